//! HTSP client
//!
//! Provides the reconnecting client facade and the helpers built on top of
//! it:
//! - [`HtspClient`] keeps one connection alive and authenticated
//! - [`HtspFileReader`] fetches server-side files

pub mod backoff;
pub mod config;
pub mod file;
pub mod supervisor;

pub use backoff::Backoff;
pub use config::ClientConfig;
pub use file::HtspFileReader;
pub use supervisor::HtspClient;
