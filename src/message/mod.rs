//! HTSP messages
//!
//! An [`HtspMessage`] is an ordered set of named fields. Requests and
//! unsolicited notifications carry a `method` field; replies carry the
//! `seq` of the request they answer.

pub mod value;

pub use value::HtspValue;

use bytes::Bytes;

/// Ordered mapping of field name to value
///
/// Field names are unique. Putting an existing name replaces its value but
/// keeps its original position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HtspMessage {
    fields: Vec<(String, HtspValue)>,
}

impl HtspMessage {
    /// Create an empty message
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a request message with the given `method`
    pub fn with_method(method: &str) -> Self {
        let mut msg = Self::new();
        msg.put("method", method);
        msg
    }

    /// Set a field, replacing any previous value with the same name
    pub fn put(&mut self, name: impl Into<String>, value: impl Into<HtspValue>) -> &mut Self {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
        self
    }

    /// Builder form of [`put`](Self::put)
    pub fn field(mut self, name: impl Into<String>, value: impl Into<HtspValue>) -> Self {
        self.put(name, value);
        self
    }

    /// Remove a field, returning its value
    pub fn remove(&mut self, name: &str) -> Option<HtspValue> {
        let idx = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(idx).1)
    }

    pub fn get(&self, name: &str) -> Option<&HtspValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name)?.as_str()
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name)?.as_i64()
    }

    /// Integer field narrowed to `u32`; `None` if absent or out of range
    pub fn get_u32(&self, name: &str) -> Option<u32> {
        self.get_i64(name).and_then(|n| u32::try_from(n).ok())
    }

    pub fn get_bin(&self, name: &str) -> Option<Bytes> {
        self.get(name)?.as_bin()
    }

    pub fn get_map(&self, name: &str) -> Option<&HtspMessage> {
        self.get(name)?.as_map()
    }

    pub fn get_list(&self, name: &str) -> Option<&[HtspValue]> {
        self.get(name)?.as_list()
    }

    pub fn get_i64_or(&self, name: &str, default: i64) -> i64 {
        self.get_i64(name).unwrap_or(default)
    }

    pub fn get_str_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.get_str(name).unwrap_or(default)
    }

    /// The `method` field, if any
    pub fn method(&self) -> Option<&str> {
        self.get_str("method")
    }

    /// The `seq` field, if any
    pub fn seq(&self) -> Option<u32> {
        self.get_u32("seq")
    }

    /// Iterate fields in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HtspValue)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<HtspValue>> FromIterator<(K, V)> for HtspMessage {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut msg = HtspMessage::new();
        for (k, v) in iter {
            msg.put(k, v);
        }
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_keeps_order_and_replaces() {
        let mut msg = HtspMessage::new();
        msg.put("a", 1i64).put("b", "two").put("a", 3i64);

        let names: Vec<&str> = msg.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(msg.get_i64("a"), Some(3));
        assert_eq!(msg.len(), 2);
    }

    #[test]
    fn test_with_method_and_seq() {
        let msg = HtspMessage::with_method("hello").field("seq", 12u32);
        assert_eq!(msg.method(), Some("hello"));
        assert_eq!(msg.seq(), Some(12));
    }

    #[test]
    fn test_get_u32_out_of_range() {
        let msg = HtspMessage::new().field("n", -1i64).field("big", i64::MAX);
        assert_eq!(msg.get_u32("n"), None);
        assert_eq!(msg.get_u32("big"), None);
        assert_eq!(msg.get_i64("n"), Some(-1));
    }

    #[test]
    fn test_defaults() {
        let msg = HtspMessage::new();
        assert_eq!(msg.get_i64_or("missing", -1), -1);
        assert_eq!(msg.get_str_or("missing", "x"), "x");
        assert!(msg.is_empty());
    }

    #[test]
    fn test_remove() {
        let mut msg: HtspMessage = vec![("a", 1i64), ("b", 2i64)].into_iter().collect();
        assert_eq!(msg.remove("a"), Some(HtspValue::S64(1)));
        assert!(!msg.contains("a"));
        assert!(msg.remove("a").is_none());
    }

    #[test]
    fn test_nested_accessors() {
        let inner = HtspMessage::new().field("x", 5i64);
        let msg = HtspMessage::new()
            .field("inner", inner.clone())
            .field("list", vec![inner]);

        assert_eq!(msg.get_map("inner").unwrap().get_i64("x"), Some(5));
        assert_eq!(msg.get_list("list").unwrap().len(), 1);
        assert!(msg.get_map("list").is_none());
    }
}
