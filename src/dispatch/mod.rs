//! Framing, request correlation and message fan-out

mod dispatcher;
mod pending;

pub use dispatcher::{MessageDispatcher, MessageListener};
