//! HTSP client for TVHeadend
//!
//! Connects to a TVHeadend server over HTSP, authenticates, and keeps the
//! connection alive across network failures. Live subscriptions resume by
//! themselves after a reconnect.
//!
//! ```text
//!  HtspClient ─── reconnect on Failed
//!      │
//!      ├── Connection ──────── TCP socket, state machine, reactor task
//!      │        ▲ Reader/Writer
//!      ├── MessageDispatcher ─ framing, seq correlation, fan-out
//!      │        ▲
//!      ├── Authenticator ───── hello / authenticate on every connect
//!      │        ▲
//!      └── Subscriber ──────── subscribe, notifications, resume
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use htsp_rs::{ClientConfig, HtspClient, HtspMessage, SubscriptionListener};
//!
//! struct Printer;
//!
//! impl SubscriptionListener for Printer {
//!     fn on_muxpkt(&self, message: &HtspMessage) {
//!         println!("packet for stream {:?}", message.get_i64("stream"));
//!     }
//! }
//!
//! # async fn run() -> htsp_rs::Result<()> {
//! let client = HtspClient::new(ClientConfig::with_host("tvh.local", "user", "secret"));
//! client.start()?;
//! while !client.is_ready() {
//!     tokio::time::sleep(std::time::Duration::from_millis(50)).await;
//! }
//!
//! let subscriber = client.subscriber();
//! let printer: Arc<dyn SubscriptionListener> = Arc::new(Printer);
//! subscriber.add_subscription_listener(&printer);
//! subscriber.subscribe(1234, None, 0).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod protocol;
pub mod subscription;

pub use auth::{AuthenticationListener, AuthenticationState, Authenticator, ServerInfo};
pub use client::{ClientConfig, HtspClient, HtspFileReader};
pub use connection::{
    CallbackContext, CallbackQueue, Connection, ConnectionDetails, ConnectionListener,
    ConnectionState,
};
pub use dispatch::{MessageDispatcher, MessageListener};
pub use error::{CodecError, Error, Result};
pub use message::{HtspMessage, HtspValue};
pub use subscription::{Subscriber, SubscriptionListener};
