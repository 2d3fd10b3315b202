//! HTSMSG binary encoder and decoder
//!
//! Frame layout:
//! ```text
//! +----------------+-------------------------------------------+
//! | length (u32 BE)| body: field*                              |
//! +----------------+-------------------------------------------+
//!
//! field:
//! +------+----------+---------------+--------+-----------+
//! | type | name_len | data_len (BE) | name   | data      |
//! | u8   | u8       | u32           | bytes  | bytes     |
//! +------+----------+---------------+--------+-----------+
//! ```
//!
//! Type tags:
//! ```text
//! 1 - Map   (data is a nested field sequence)
//! 2 - S64   (little-endian, minimal length, zero is empty)
//! 3 - Str   (UTF-8, no terminator)
//! 4 - Bin   (raw bytes)
//! 5 - List  (nested field sequence, names empty)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;
use crate::message::{HtspMessage, HtspValue};

const TYPE_MAP: u8 = 1;
const TYPE_S64: u8 = 2;
const TYPE_STR: u8 = 3;
const TYPE_BIN: u8 = 4;
const TYPE_LIST: u8 = 5;

/// Size of the frame length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of a field header (type, name length, data length)
const FIELD_HEADER_SIZE: usize = 6;

/// Largest frame body we accept from the wire
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum nesting depth for maps/lists (prevent stack overflow)
const MAX_NESTING_DEPTH: usize = 64;

/// HTSMSG decoder
pub struct HtsmsgDecoder {
    max_frame_size: usize,
    depth: usize,
}

impl HtsmsgDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a decoder that rejects frames larger than `max` bytes
    pub fn with_max_frame_size(max: usize) -> Self {
        Self {
            max_frame_size: max,
            depth: 0,
        }
    }

    /// Decode one frame from the front of `src`
    ///
    /// Returns `Ok(None)` and leaves `src` untouched when the frame is not
    /// complete yet. On success the frame is split off `src`; anything after
    /// it stays in place for the next call.
    pub fn decode_frame(&mut self, src: &mut BytesMut) -> Result<Option<HtspMessage>, CodecError> {
        let len = match self.frame_len(src)? {
            Some(len) => len,
            None => return Ok(None),
        };

        src.advance(LENGTH_PREFIX_SIZE);
        let mut body = src.split_to(len).freeze();
        self.depth = 0;
        self.decode_fields(&mut body).map(Some)
    }

    /// Length of the frame body at the front of `src`, if complete
    fn frame_len(&self, src: &[u8]) -> Result<Option<usize>, CodecError> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        if src.len() < LENGTH_PREFIX_SIZE + len {
            return Ok(None);
        }

        Ok(Some(len))
    }

    /// Decode a field sequence into a message
    fn decode_fields(&mut self, buf: &mut Bytes) -> Result<HtspMessage, CodecError> {
        let mut msg = HtspMessage::new();
        while buf.has_remaining() {
            let (name, value) = self.decode_field(buf)?;
            msg.put(name, value);
        }
        Ok(msg)
    }

    /// Decode a field sequence into a list, ignoring names
    fn decode_list(&mut self, buf: &mut Bytes) -> Result<Vec<HtspValue>, CodecError> {
        let mut items = Vec::new();
        while buf.has_remaining() {
            let (_, value) = self.decode_field(buf)?;
            items.push(value);
        }
        Ok(items)
    }

    fn decode_field(&mut self, buf: &mut Bytes) -> Result<(String, HtspValue), CodecError> {
        if buf.remaining() < FIELD_HEADER_SIZE {
            return Err(CodecError::Truncated);
        }

        let type_id = buf.get_u8();
        let name_len = buf.get_u8() as usize;
        let data_len = buf.get_u32() as usize;

        if buf.remaining() < name_len + data_len {
            return Err(CodecError::Truncated);
        }

        let name = buf.split_to(name_len);
        let name = String::from_utf8(name.to_vec()).map_err(|_| CodecError::InvalidUtf8)?;
        let mut data = buf.split_to(data_len);

        let value = match type_id {
            TYPE_MAP => {
                self.enter()?;
                let map = self.decode_fields(&mut data);
                self.depth -= 1;
                HtspValue::Map(map?)
            }
            TYPE_LIST => {
                self.enter()?;
                let list = self.decode_list(&mut data);
                self.depth -= 1;
                HtspValue::List(list?)
            }
            TYPE_S64 => HtspValue::S64(decode_s64(&data)?),
            TYPE_STR => HtspValue::Str(
                String::from_utf8(data.to_vec()).map_err(|_| CodecError::InvalidUtf8)?,
            ),
            TYPE_BIN => HtspValue::Bin(data),
            other => return Err(CodecError::UnknownType(other)),
        };

        Ok((name, value))
    }

    fn enter(&mut self) -> Result<(), CodecError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(CodecError::NestingTooDeep);
        }
        Ok(())
    }
}

impl Default for HtsmsgDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_s64(data: &[u8]) -> Result<i64, CodecError> {
    if data.len() > 8 {
        return Err(CodecError::IntegerTooLong(data.len()));
    }
    let mut raw = [0u8; 8];
    raw[..data.len()].copy_from_slice(data);
    Ok(u64::from_le_bytes(raw) as i64)
}

/// HTSMSG encoder
pub struct HtsmsgEncoder {
    buf: BytesMut,
}

impl HtsmsgEncoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Get the encoded bytes and reset encoder
    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Encode a complete frame (length prefix + body)
    pub fn encode_frame(&mut self, msg: &HtspMessage) -> Result<(), CodecError> {
        let start = self.buf.len();
        self.buf.put_u32(0);
        self.encode_fields(msg.iter())?;

        let body_len = self.buf.len() - start - LENGTH_PREFIX_SIZE;
        self.buf[start..start + LENGTH_PREFIX_SIZE]
            .copy_from_slice(&(body_len as u32).to_be_bytes());
        Ok(())
    }

    fn encode_fields<'a>(
        &mut self,
        fields: impl Iterator<Item = (&'a str, &'a HtspValue)>,
    ) -> Result<(), CodecError> {
        for (name, value) in fields {
            self.encode_field(name, value)?;
        }
        Ok(())
    }

    fn encode_field(&mut self, name: &str, value: &HtspValue) -> Result<(), CodecError> {
        if name.len() > u8::MAX as usize {
            return Err(CodecError::NameTooLong(name.len()));
        }

        self.buf.put_u8(value.type_id());
        self.buf.put_u8(name.len() as u8);
        let len_pos = self.buf.len();
        self.buf.put_u32(0);
        self.buf.put_slice(name.as_bytes());

        let data_start = self.buf.len();
        match value {
            HtspValue::Map(map) => self.encode_fields(map.iter())?,
            HtspValue::List(items) => {
                for item in items {
                    self.encode_field("", item)?;
                }
            }
            HtspValue::S64(n) => {
                let mut v = *n as u64;
                while v != 0 {
                    self.buf.put_u8(v as u8);
                    v >>= 8;
                }
            }
            HtspValue::Str(s) => self.buf.put_slice(s.as_bytes()),
            HtspValue::Bin(b) => self.buf.put_slice(b),
        }

        let data_len = (self.buf.len() - data_start) as u32;
        self.buf[len_pos..len_pos + 4].copy_from_slice(&data_len.to_be_bytes());
        Ok(())
    }
}

impl Default for HtsmsgEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a message into a complete wire frame
pub fn encode(msg: &HtspMessage) -> Result<Bytes, CodecError> {
    let mut encoder = HtsmsgEncoder::new();
    encoder.encode_frame(msg)?;
    Ok(encoder.finish())
}

/// Decode one frame from the front of `data`
///
/// Returns the message and the number of bytes consumed, or `None` when
/// `data` does not hold a complete frame yet.
pub fn decode(data: &[u8]) -> Result<Option<(HtspMessage, usize)>, CodecError> {
    let mut buf = BytesMut::from(data);
    let before = buf.len();
    let msg = HtsmsgDecoder::new().decode_frame(&mut buf)?;
    Ok(msg.map(|m| (m, before - buf.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HtspMessage {
        let nested = HtspMessage::new()
            .field("name", "BBC One")
            .field("number", 1i64);

        HtspMessage::with_method("channelAdd")
            .field("seq", 7u32)
            .field("negative", -2i64)
            .field("zero", 0i64)
            .field("max", i64::MAX)
            .field("min", i64::MIN)
            .field("empty", Bytes::new())
            .field("blob", vec![0u8, 1, 2, 255])
            .field("nested", nested.clone())
            .field("services", vec![nested.clone(), nested])
            .field(
                "mixed",
                vec![HtspValue::S64(1), HtspValue::Str("two".into())],
            )
    }

    #[test]
    fn test_round_trip() {
        let msg = sample();
        let frame = encode(&msg).unwrap();
        let (decoded, consumed) = decode(&frame).unwrap().unwrap();

        assert_eq!(decoded, msg);
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn test_large_binary_round_trip() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let msg = HtspMessage::with_method("muxpkt").field("payload", payload.clone());

        let frame = encode(&msg).unwrap();
        let (decoded, _) = decode(&frame).unwrap().unwrap();
        assert_eq!(decoded.get_bin("payload").unwrap().as_ref(), &payload[..]);
    }

    #[test]
    fn test_wire_layout() {
        let msg = HtspMessage::new().field("a", 1i64).field("s", "hi");
        let frame = encode(&msg).unwrap();

        let expected: &[u8] = &[
            0, 0, 0, 17, // body length
            2, 1, 0, 0, 0, 1, b'a', 1, // S64 "a" = 1
            3, 1, 0, 0, 0, 2, b's', b'h', b'i', // STR "s" = "hi"
        ];
        assert_eq!(&frame[..], expected);
    }

    #[test]
    fn test_zero_encodes_empty() {
        let frame = encode(&HtspMessage::new().field("z", 0i64)).unwrap();
        // prefix + header + name, no data bytes
        assert_eq!(frame.len(), 4 + 6 + 1);
    }

    #[test]
    fn test_incomplete_frame() {
        let frame = encode(&sample()).unwrap();

        assert!(decode(&frame[..2]).unwrap().is_none());
        assert!(decode(&frame[..frame.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn test_partial_reassembly() {
        let first = HtspMessage::with_method("one").field("seq", 1u32);
        let second = HtspMessage::with_method("two").field("data", vec![9u8; 5000]);

        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode(&first).unwrap());
        wire.extend_from_slice(&encode(&second).unwrap());

        let mut decoder = HtsmsgDecoder::new();
        let mut buf = BytesMut::new();
        let mut out = Vec::new();

        // Feed in awkward chunk sizes
        for chunk in wire.chunks(7) {
            buf.extend_from_slice(chunk);
            while let Some(msg) = decoder.decode_frame(&mut buf).unwrap() {
                out.push(msg);
            }
        }

        assert_eq!(out, vec![first, second]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_remainder_retained() {
        let frame = encode(&HtspMessage::with_method("x")).unwrap();
        let mut buf = BytesMut::from(&frame[..]);
        buf.extend_from_slice(&[0, 0]);

        let msg = HtsmsgDecoder::new().decode_frame(&mut buf).unwrap();
        assert!(msg.is_some());
        assert_eq!(&buf[..], &[0, 0]);
    }

    #[test]
    fn test_frame_too_large() {
        let mut buf = BytesMut::from(&[0x7F, 0xFF, 0xFF, 0xFF][..]);
        let err = HtsmsgDecoder::new().decode_frame(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_truncated_field() {
        // Body claims a 10-byte string but only carries 2
        let body: &[u8] = &[3, 1, 0, 0, 0, 10, b's', b'h', b'i'];
        let mut buf = BytesMut::new();
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);

        let err = HtsmsgDecoder::new().decode_frame(&mut buf).unwrap_err();
        assert_eq!(err, CodecError::Truncated);
    }

    #[test]
    fn test_unknown_type() {
        let body: &[u8] = &[9, 0, 0, 0, 0, 0];
        let mut buf = BytesMut::new();
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);

        let err = HtsmsgDecoder::new().decode_frame(&mut buf).unwrap_err();
        assert_eq!(err, CodecError::UnknownType(9));
    }

    #[test]
    fn test_name_too_long() {
        let name = "n".repeat(300);
        let err = encode(&HtspMessage::new().field(name, 1i64)).unwrap_err();
        assert_eq!(err, CodecError::NameTooLong(300));
    }

    #[test]
    fn test_nesting_too_deep() {
        let mut msg = HtspMessage::new().field("leaf", 1i64);
        for _ in 0..(MAX_NESTING_DEPTH + 1) {
            msg = HtspMessage::new().field("m", msg);
        }
        let frame = encode(&msg).unwrap();
        let err = decode(&frame).unwrap_err();
        assert_eq!(err, CodecError::NestingTooDeep);
    }

    #[test]
    fn test_empty_message() {
        let frame = encode(&HtspMessage::new()).unwrap();
        assert_eq!(&frame[..], &[0, 0, 0, 0]);
        let (msg, consumed) = decode(&frame).unwrap().unwrap();
        assert!(msg.is_empty());
        assert_eq!(consumed, 4);
    }
}
