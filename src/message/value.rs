//! HTSMSG value types
//!
//! Every field of an HTSP message holds one of five value kinds. The
//! numeric tags are the ones used on the wire.

use bytes::Bytes;

use super::HtspMessage;

/// A single HTSMSG field value
#[derive(Debug, Clone, PartialEq)]
pub enum HtspValue {
    /// Nested message (wire type 1)
    Map(HtspMessage),

    /// Signed 64-bit integer (wire type 2)
    S64(i64),

    /// UTF-8 string (wire type 3)
    Str(String),

    /// Raw bytes (wire type 4)
    Bin(Bytes),

    /// Ordered list of values (wire type 5)
    List(Vec<HtspValue>),
}

impl HtspValue {
    /// Try to get this value as a string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HtspValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as an integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HtspValue::S64(n) => Some(*n),
            _ => None,
        }
    }

    /// Try to get this value as binary data
    ///
    /// Strings are returned as their UTF-8 bytes; some servers send short
    /// binary fields as strings.
    pub fn as_bin(&self) -> Option<Bytes> {
        match self {
            HtspValue::Bin(b) => Some(b.clone()),
            HtspValue::Str(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
            _ => None,
        }
    }

    /// Try to get this value as a nested message
    pub fn as_map(&self) -> Option<&HtspMessage> {
        match self {
            HtspValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Try to get this value as a list
    pub fn as_list(&self) -> Option<&[HtspValue]> {
        match self {
            HtspValue::List(l) => Some(l),
            _ => None,
        }
    }

    /// Wire type tag
    pub fn type_id(&self) -> u8 {
        match self {
            HtspValue::Map(_) => 1,
            HtspValue::S64(_) => 2,
            HtspValue::Str(_) => 3,
            HtspValue::Bin(_) => 4,
            HtspValue::List(_) => 5,
        }
    }
}

impl From<i64> for HtspValue {
    fn from(v: i64) -> Self {
        HtspValue::S64(v)
    }
}

impl From<i32> for HtspValue {
    fn from(v: i32) -> Self {
        HtspValue::S64(v as i64)
    }
}

impl From<u32> for HtspValue {
    fn from(v: u32) -> Self {
        HtspValue::S64(v as i64)
    }
}

impl From<bool> for HtspValue {
    fn from(v: bool) -> Self {
        HtspValue::S64(v as i64)
    }
}

impl From<String> for HtspValue {
    fn from(v: String) -> Self {
        HtspValue::Str(v)
    }
}

impl From<&str> for HtspValue {
    fn from(v: &str) -> Self {
        HtspValue::Str(v.to_string())
    }
}

impl From<Bytes> for HtspValue {
    fn from(v: Bytes) -> Self {
        HtspValue::Bin(v)
    }
}

impl From<Vec<u8>> for HtspValue {
    fn from(v: Vec<u8>) -> Self {
        HtspValue::Bin(Bytes::from(v))
    }
}

impl From<HtspMessage> for HtspValue {
    fn from(v: HtspMessage) -> Self {
        HtspValue::Map(v)
    }
}

impl From<Vec<HtspMessage>> for HtspValue {
    fn from(v: Vec<HtspMessage>) -> Self {
        HtspValue::List(v.into_iter().map(HtspValue::Map).collect())
    }
}

impl From<Vec<HtspValue>> for HtspValue {
    fn from(v: Vec<HtspValue>) -> Self {
        HtspValue::List(v)
    }
}
