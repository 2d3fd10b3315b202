//! HTSP authentication
//!
//! The [`Authenticator`] runs the `hello` / `authenticate` exchange each
//! time the connection comes up and promotes it to `Ready` on success.

mod authenticator;
mod state;

pub use authenticator::{AuthenticationListener, Authenticator};
pub use state::{compute_digest, AuthenticationState, ServerInfo};
