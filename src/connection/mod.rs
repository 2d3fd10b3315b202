//! Connection lifecycle
//!
//! A [`Connection`] owns one TCP socket at a time and reports every state
//! change to its [`ConnectionListener`]s. Framing, request correlation and
//! authentication live in higher layers plugged in as [`Reader`] and
//! [`Writer`].

mod details;
mod listener;
mod reactor;
mod state;

pub use details::ConnectionDetails;
pub use listener::{CallbackContext, CallbackQueue, ConnectionListener};
pub use reactor::{Connection, ConnectionStats, ReactorConfig, Reader, SocketIo, Writer};
pub use state::ConnectionState;

pub(crate) use listener::{deliver, lock, ListenerSet};
