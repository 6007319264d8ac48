//! ANP value codec.
//!
//! An ANP message is an ordered list of tagged values. Order is the argument
//! list of a call, so the reader is strictly sequential.
//!
//! Wire format: `tag:u8 | payload`, all integers big-endian.
//!
//! ```text
//! 1 = U32   4 bytes
//! 2 = U64   8 bytes
//! 3 = STR   len:u32 | UTF-8 bytes
//! 4 = BIN   len:u32 | raw bytes
//! ```

use crate::error::{KanpError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

pub const TAG_U32: u8 = 1;
pub const TAG_U64: u8 = 2;
pub const TAG_STR: u8 = 3;
pub const TAG_BIN: u8 = 4;

/// Encoded size of a value header for STR/BIN (tag + length).
pub const LENGTH_PREFIXED_OVERHEAD: usize = 1 + 4;

// =============================================================================
// Values
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    U32,
    U64,
    Str,
    Bin,
}

impl ValueKind {
    pub fn tag(self) -> u8 {
        match self {
            ValueKind::U32 => TAG_U32,
            ValueKind::U64 => TAG_U64,
            ValueKind::Str => TAG_STR,
            ValueKind::Bin => TAG_BIN,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            TAG_U32 => Some(ValueKind::U32),
            TAG_U64 => Some(ValueKind::U64),
            TAG_STR => Some(ValueKind::Str),
            TAG_BIN => Some(ValueKind::Bin),
            _ => None,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::U32 => "U32",
            ValueKind::U64 => "U64",
            ValueKind::Str => "STR",
            ValueKind::Bin => "BIN",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    U32(u32),
    U64(u64),
    Str(String),
    Bin(Bytes),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::U32(_) => ValueKind::U32,
            Value::U64(_) => ValueKind::U64,
            Value::Str(_) => ValueKind::Str,
            Value::Bin(_) => ValueKind::Bin,
        }
    }

    /// Encoded size including the tag byte.
    pub fn encoded_len(&self) -> usize {
        match self {
            Value::U32(_) => 1 + 4,
            Value::U64(_) => 1 + 8,
            Value::Str(s) => LENGTH_PREFIXED_OVERHEAD + s.len(),
            Value::Bin(b) => LENGTH_PREFIXED_OVERHEAD + b.len(),
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind().tag());
        match self {
            Value::U32(v) => buf.put_u32(*v),
            Value::U64(v) => buf.put_u64(*v),
            Value::Str(s) => {
                buf.put_u32(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            Value::Bin(b) => {
                buf.put_u32(b.len() as u32);
                buf.put_slice(b);
            }
        }
    }
}

// =============================================================================
// Message
// =============================================================================

/// An ordered list of ANP values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    values: Vec<Value>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: Value) -> &mut Self {
        self.values.push(value);
        self
    }

    pub fn push_u32(&mut self, v: u32) -> &mut Self {
        self.push(Value::U32(v))
    }

    pub fn push_u64(&mut self, v: u64) -> &mut Self {
        self.push(Value::U64(v))
    }

    pub fn push_str(&mut self, s: impl Into<String>) -> &mut Self {
        self.push(Value::Str(s.into()))
    }

    pub fn push_bin(&mut self, b: impl Into<Bytes>) -> &mut Self {
        self.push(Value::Bin(b.into()))
    }

    /// Move every value of `other` to the end of this message.
    pub fn append(&mut self, other: Message) -> &mut Self {
        self.values.extend(other.values);
        self
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Exact payload size of `encode()`, without encoding.
    pub fn encoded_len(&self) -> usize {
        self.values.iter().map(Value::encoded_len).sum()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        for value in &self.values {
            value.encode_into(&mut buf);
        }
        buf.freeze()
    }

    /// Decode a complete payload. STR/BIN values share the input buffer.
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let mut values = Vec::new();

        while payload.has_remaining() {
            let index = values.len();
            let tag = payload.get_u8();
            let kind = ValueKind::from_tag(tag).ok_or_else(|| {
                KanpError::Malformed(format!("element {}: unknown tag {}", index, tag))
            })?;

            let value = match kind {
                ValueKind::U32 => {
                    need(&payload, 4, index)?;
                    Value::U32(payload.get_u32())
                }
                ValueKind::U64 => {
                    need(&payload, 8, index)?;
                    Value::U64(payload.get_u64())
                }
                ValueKind::Str => {
                    let raw = take_length_prefixed(&mut payload, index)?;
                    let s = String::from_utf8(raw.to_vec()).map_err(|_| {
                        KanpError::Malformed(format!("element {}: string is not UTF-8", index))
                    })?;
                    Value::Str(s)
                }
                ValueKind::Bin => Value::Bin(take_length_prefixed(&mut payload, index)?),
            };
            values.push(value);
        }

        Ok(Self { values })
    }

    /// Hand the message to a cursor that owns it for one read pass.
    pub fn into_reader(self) -> MessageReader {
        MessageReader::new(self)
    }
}

impl From<Vec<Value>> for Message {
    fn from(values: Vec<Value>) -> Self {
        Self { values }
    }
}

fn need(payload: &Bytes, n: usize, index: usize) -> Result<()> {
    if payload.remaining() < n {
        return Err(KanpError::Malformed(format!(
            "element {}: need {} bytes, {} left",
            index,
            n,
            payload.remaining()
        )));
    }
    Ok(())
}

fn take_length_prefixed(payload: &mut Bytes, index: usize) -> Result<Bytes> {
    need(payload, 4, index)?;
    let len = payload.get_u32() as usize;
    need(payload, len, index)?;
    Ok(payload.split_to(len))
}

// =============================================================================
// Reader
// =============================================================================

/// Sequential typed cursor over one message.
///
/// The cursor position belongs to this value alone; two call sites reading
/// the same payload each decode their own reader.
#[derive(Debug)]
pub struct MessageReader {
    values: std::vec::IntoIter<Value>,
    index: usize,
}

impl MessageReader {
    pub fn new(message: Message) -> Self {
        Self {
            values: message.values.into_iter(),
            index: 0,
        }
    }

    /// Index of the next element to be read.
    pub fn position(&self) -> usize {
        self.index
    }

    pub fn remaining(&self) -> usize {
        self.values.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.values.len() == 0
    }

    pub fn peek_kind(&self) -> Option<ValueKind> {
        self.values.as_slice().first().map(Value::kind)
    }

    fn next_value(&mut self, expected: ValueKind) -> Result<Value> {
        let index = self.index;
        match self.values.as_slice().first() {
            None => Err(KanpError::UnexpectedEnd { index }),
            Some(v) if v.kind() != expected => Err(KanpError::TypeMismatch {
                index,
                expected,
                found: v.kind(),
            }),
            Some(_) => {
                self.index += 1;
                self.values.next().ok_or(KanpError::UnexpectedEnd { index })
            }
        }
    }

    pub fn next_u32(&mut self) -> Result<u32> {
        match self.next_value(ValueKind::U32)? {
            Value::U32(v) => Ok(v),
            other => Err(self.mismatch(ValueKind::U32, &other)),
        }
    }

    pub fn next_u64(&mut self) -> Result<u64> {
        match self.next_value(ValueKind::U64)? {
            Value::U64(v) => Ok(v),
            other => Err(self.mismatch(ValueKind::U64, &other)),
        }
    }

    pub fn next_str(&mut self) -> Result<String> {
        match self.next_value(ValueKind::Str)? {
            Value::Str(s) => Ok(s),
            other => Err(self.mismatch(ValueKind::Str, &other)),
        }
    }

    pub fn next_bin(&mut self) -> Result<Bytes> {
        match self.next_value(ValueKind::Bin)? {
            Value::Bin(b) => Ok(b),
            other => Err(self.mismatch(ValueKind::Bin, &other)),
        }
    }

    fn mismatch(&self, expected: ValueKind, found: &Value) -> KanpError {
        KanpError::TypeMismatch {
            index: self.index.saturating_sub(1),
            expected,
            found: found.kind(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        let mut m = Message::new();
        m.push_u32(7)
            .push_u64(u64::MAX)
            .push_str("d1/f.txt")
            .push_bin(vec![0u8, 1, 2, 255]);
        m
    }

    #[test]
    fn test_wire_layout() {
        let mut m = Message::new();
        m.push_u32(0x0102_0304).push_str("ab");
        let encoded = m.encode();
        assert_eq!(
            encoded.as_ref(),
            &[1, 1, 2, 3, 4, 3, 0, 0, 0, 2, b'a', b'b']
        );
        assert_eq!(m.encoded_len(), encoded.len());
    }

    #[test]
    fn test_roundtrip() {
        let m = sample();
        let decoded = Message::decode(m.encode()).unwrap();
        assert_eq!(decoded, m);
    }

    #[test]
    fn test_read_in_order() {
        let mut r = sample().into_reader();
        assert_eq!(r.next_u32().unwrap(), 7);
        assert_eq!(r.next_u64().unwrap(), u64::MAX);
        assert_eq!(r.next_str().unwrap(), "d1/f.txt");
        assert_eq!(r.next_bin().unwrap().as_ref(), &[0, 1, 2, 255]);
        assert!(r.is_exhausted());
        assert!(matches!(
            r.next_u32(),
            Err(KanpError::UnexpectedEnd { index: 4 })
        ));
    }

    #[test]
    fn test_wrong_accessor_is_type_mismatch() {
        let mut r = sample().into_reader();
        match r.next_u64() {
            Err(KanpError::TypeMismatch {
                index,
                expected,
                found,
            }) => {
                assert_eq!(index, 0);
                assert_eq!(expected, ValueKind::U64);
                assert_eq!(found, ValueKind::U32);
            }
            other => panic!("expected TypeMismatch, got {:?}", other),
        }
        // A failed read does not advance the cursor.
        assert_eq!(r.position(), 0);
        assert_eq!(r.next_u32().unwrap(), 7);
    }

    #[test]
    fn test_bin_is_not_str() {
        let mut m = Message::new();
        m.push_bin(&b"abc"[..]);
        let mut r = m.into_reader();
        assert!(matches!(r.next_str(), Err(KanpError::TypeMismatch { .. })));
    }

    #[test]
    fn test_truncated_length_is_malformed() {
        // STR claiming 10 bytes with only 2 present
        let payload = Bytes::from_static(&[3, 0, 0, 0, 10, b'h', b'i']);
        assert!(matches!(
            Message::decode(payload),
            Err(KanpError::Malformed(_))
        ));
    }

    #[test]
    fn test_truncated_scalar_is_malformed() {
        let payload = Bytes::from_static(&[2, 0, 0, 0]);
        assert!(matches!(
            Message::decode(payload),
            Err(KanpError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_tag_is_malformed() {
        let payload = Bytes::from_static(&[9, 0, 0, 0, 1]);
        assert!(matches!(
            Message::decode(payload),
            Err(KanpError::Malformed(_))
        ));
    }

    #[test]
    fn test_huge_declared_length() {
        let payload = Bytes::from_static(&[4, 0xFF, 0xFF, 0xFF, 0xFF, 0]);
        assert!(matches!(
            Message::decode(payload),
            Err(KanpError::Malformed(_))
        ));
    }

    #[test]
    fn test_invalid_utf8_string() {
        let payload = Bytes::from_static(&[3, 0, 0, 0, 2, 0xC3, 0x28]);
        assert!(matches!(
            Message::decode(payload),
            Err(KanpError::Malformed(_))
        ));
    }

    #[test]
    fn test_empty_payload() {
        let m = Message::decode(Bytes::new()).unwrap();
        assert!(m.is_empty());
        assert!(matches!(
            m.into_reader().next_u32(),
            Err(KanpError::UnexpectedEnd { index: 0 })
        ));
    }

    #[test]
    fn test_empty_bin_and_str() {
        let mut m = Message::new();
        m.push_str("").push_bin(Bytes::new());
        let decoded = Message::decode(m.encode()).unwrap();
        let mut r = decoded.into_reader();
        assert_eq!(r.next_str().unwrap(), "");
        assert!(r.next_bin().unwrap().is_empty());
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        fn value() -> impl Strategy<Value = Value> {
            prop_oneof![
                any::<u32>().prop_map(Value::U32),
                any::<u64>().prop_map(Value::U64),
                ".{0,40}".prop_map(Value::Str),
                proptest::collection::vec(any::<u8>(), 0..64)
                    .prop_map(|v| Value::Bin(Bytes::from(v))),
            ]
        }

        proptest! {
            #[test]
            fn decode_inverts_encode(values in proptest::collection::vec(value(), 0..32)) {
                let m = Message::from(values);
                let encoded = m.encode();
                prop_assert_eq!(encoded.len(), m.encoded_len());
                prop_assert_eq!(Message::decode(encoded).unwrap(), m);
            }

            #[test]
            fn decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..128)) {
                let _ = Message::decode(Bytes::from(data));
            }
        }
    }
}
