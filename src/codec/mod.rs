//! Wire codec
//!
//! HTSP frames are a 4-byte big-endian length followed by an HTSMSG body.
//! The dispatcher only relies on [`encode`] and [`HtsmsgDecoder::decode_frame`];
//! [`decode`] is the slice-based form of the same contract.

pub mod htsmsg;

pub use htsmsg::{decode, encode, HtsmsgDecoder, HtsmsgEncoder, MAX_FRAME_SIZE};
