//! HTSP protocol definitions

pub mod constants;

pub use constants::*;
