//! AMQP field tables and field values.
//!
//! Grounded on `libamqpprox/amqpprox_types.cpp` (`Types::decodeFieldValue` /
//! `encodeFieldValue`) and `amqpprox_fieldtable.h`. Only enough semantics to
//! round-trip every tag the original accepts - we don't interpret values,
//! just preserve them byte-for-byte across decode/encode, since the proxy
//! never needs to act on them (Non-goal: no AMQP semantics beyond
//! connection-class methods).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

pub const SHORT_STRING_LIMIT: usize = 255;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer underrun: needed {needed} bytes, had {available}")]
    Underrun { needed: usize, available: usize },
    #[error("unrecognized field value tag {0:#04x}")]
    UnknownTag(u8),
    #[error("short string exceeds {SHORT_STRING_LIMIT} bytes")]
    ShortStringTooLong,
}

fn need(buf: &[u8], n: usize) -> Result<(), CodecError> {
    if buf.len() < n {
        Err(CodecError::Underrun {
            needed: n,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

/// A single AMQP field value. Opaque binary types (`float`, `double`,
/// `decimal`) are preserved verbatim rather than interpreted, matching the
/// original's `std::vector<uint8_t>` storage for those tags.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Boolean(bool),
    ShortShortInt(i8),
    ShortShortUint(u8),
    ShortInt(i16),
    ShortUint(u16),
    LongInt(i32),
    LongUint(u32),
    LongLongInt(i64),
    /// 4-byte IEEE-754 float, stored as raw big-endian bytes.
    Float([u8; 4]),
    /// 8-byte IEEE-754 double, stored as raw big-endian bytes.
    Double([u8; 8]),
    /// 5-byte AMQP decimal-value (1 scale byte + 4 value bytes).
    Decimal([u8; 5]),
    LongString(Bytes),
    FieldArray(Vec<FieldValue>),
    Timestamp(u64),
    FieldTable(FieldTable),
    Void,
    ByteArray(Bytes),
}

impl FieldValue {
    fn tag(&self) -> u8 {
        match self {
            FieldValue::Boolean(_) => b't',
            FieldValue::ShortShortInt(_) => b'b',
            FieldValue::ShortShortUint(_) => b'B',
            FieldValue::ShortInt(_) => b's',
            FieldValue::ShortUint(_) => b'u',
            FieldValue::LongInt(_) => b'I',
            FieldValue::LongUint(_) => b'i',
            FieldValue::LongLongInt(_) => b'l',
            FieldValue::Float(_) => b'f',
            FieldValue::Double(_) => b'd',
            FieldValue::Decimal(_) => b'D',
            FieldValue::LongString(_) => b'S',
            FieldValue::FieldArray(_) => b'A',
            FieldValue::Timestamp(_) => b'T',
            FieldValue::FieldTable(_) => b'F',
            FieldValue::Void => b'V',
            FieldValue::ByteArray(_) => b'x',
        }
    }
}

/// An ordered sequence of `(name, value)` pairs, matching
/// `amqpprox_fieldtable.h`'s `std::vector<std::pair<std::string, FieldValue>>`
/// (not a map - AMQP field tables may repeat names and order is preserved).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldTable {
    fields: Vec<(String, FieldValue)>,
}

impl FieldTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.push((name.into(), value));
    }

    pub fn find(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, FieldValue)> {
        self.fields.iter()
    }

    /// Convenience used by the handshake code to add or overwrite a single
    /// string-valued client property (e.g. `amqpprox_client`).
    pub fn set_long_string(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = FieldValue::LongString(Bytes::from(value.into()));
        if let Some(existing) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            existing.1 = value;
        } else {
            self.fields.push((name, value));
        }
    }
}

// A poor man's map view used only by tests that want deterministic
// ordering when asserting on contents.
impl From<&FieldTable> for BTreeMap<String, FieldValue> {
    fn from(t: &FieldTable) -> Self {
        t.fields.iter().cloned().collect()
    }
}

pub fn decode_short_string(buf: &mut &[u8]) -> Result<String, CodecError> {
    need(buf, 1)?;
    let len = buf.get_u8() as usize;
    need(buf, len)?;
    let bytes = &buf[..len];
    let s = String::from_utf8_lossy(bytes).into_owned();
    buf.advance(len);
    Ok(s)
}

pub fn encode_short_string(out: &mut BytesMut, s: &str) -> Result<(), CodecError> {
    if s.len() > SHORT_STRING_LIMIT {
        return Err(CodecError::ShortStringTooLong);
    }
    out.put_u8(s.len() as u8);
    out.put_slice(s.as_bytes());
    Ok(())
}

pub fn decode_long_string(buf: &mut &[u8]) -> Result<Bytes, CodecError> {
    need(buf, 4)?;
    let len = buf.get_u32() as usize;
    need(buf, len)?;
    let bytes = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(bytes)
}

pub fn encode_long_string(out: &mut BytesMut, bytes: &[u8]) {
    out.put_u32(bytes.len() as u32);
    out.put_slice(bytes);
}

fn decode_fixed<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N], CodecError> {
    need(buf, N)?;
    let mut arr = [0u8; N];
    arr.copy_from_slice(&buf[..N]);
    buf.advance(N);
    Ok(arr)
}

pub fn decode_field_value(buf: &mut &[u8]) -> Result<FieldValue, CodecError> {
    need(buf, 1)?;
    let tag = buf.get_u8();
    let value = match tag {
        b't' => {
            need(buf, 1)?;
            FieldValue::Boolean(buf.get_u8() != 0)
        }
        b'b' => {
            need(buf, 1)?;
            FieldValue::ShortShortInt(buf.get_i8())
        }
        b'B' => {
            need(buf, 1)?;
            FieldValue::ShortShortUint(buf.get_u8())
        }
        // 'U' is accepted as a compatibility alias for 's', matching the
        // original's fallthrough ("Converting unsupported field type 'U' to 's'").
        b's' | b'U' => {
            need(buf, 2)?;
            FieldValue::ShortInt(buf.get_i16())
        }
        b'u' => {
            need(buf, 2)?;
            FieldValue::ShortUint(buf.get_u16())
        }
        b'I' => {
            need(buf, 4)?;
            FieldValue::LongInt(buf.get_i32())
        }
        b'i' => {
            need(buf, 4)?;
            FieldValue::LongUint(buf.get_u32())
        }
        // 'L' is a compatibility alias for 'l'.
        b'l' | b'L' => {
            need(buf, 8)?;
            FieldValue::LongLongInt(buf.get_i64())
        }
        b'f' => FieldValue::Float(decode_fixed::<4>(buf)?),
        b'd' => FieldValue::Double(decode_fixed::<8>(buf)?),
        b'D' => FieldValue::Decimal(decode_fixed::<5>(buf)?),
        b'S' => FieldValue::LongString(decode_long_string(buf)?),
        b'A' => FieldValue::FieldArray(decode_field_array(buf)?),
        b'T' => {
            need(buf, 8)?;
            FieldValue::Timestamp(buf.get_u64())
        }
        b'F' => FieldValue::FieldTable(decode_field_table(buf)?),
        b'V' => FieldValue::Void,
        b'x' => {
            need(buf, 4)?;
            let len = buf.get_u32() as usize;
            need(buf, len)?;
            let bytes = Bytes::copy_from_slice(&buf[..len]);
            buf.advance(len);
            FieldValue::ByteArray(bytes)
        }
        other => return Err(CodecError::UnknownTag(other)),
    };
    Ok(value)
}

pub fn encode_field_value(out: &mut BytesMut, value: &FieldValue) -> Result<(), CodecError> {
    out.put_u8(value.tag());
    match value {
        FieldValue::Boolean(b) => out.put_u8(if *b { 1 } else { 0 }),
        FieldValue::ShortShortInt(v) => out.put_i8(*v),
        FieldValue::ShortShortUint(v) => out.put_u8(*v),
        FieldValue::ShortInt(v) => out.put_i16(*v),
        FieldValue::ShortUint(v) => out.put_u16(*v),
        FieldValue::LongInt(v) => out.put_i32(*v),
        FieldValue::LongUint(v) => out.put_u32(*v),
        FieldValue::LongLongInt(v) => out.put_i64(*v),
        FieldValue::Float(bytes) => out.put_slice(bytes),
        FieldValue::Double(bytes) => out.put_slice(bytes),
        FieldValue::Decimal(bytes) => out.put_slice(bytes),
        FieldValue::LongString(bytes) => encode_long_string(out, bytes),
        FieldValue::FieldArray(values) => encode_field_array(out, values)?,
        FieldValue::Timestamp(v) => out.put_u64(*v),
        FieldValue::FieldTable(table) => encode_field_table(out, table)?,
        FieldValue::Void => {}
        FieldValue::ByteArray(bytes) => {
            out.put_u32(bytes.len() as u32);
            out.put_slice(bytes);
        }
    }
    Ok(())
}

fn decode_field_array(buf: &mut &[u8]) -> Result<Vec<FieldValue>, CodecError> {
    need(buf, 4)?;
    let byte_len = buf.get_u32() as usize;
    need(buf, byte_len)?;
    let mut slice = &buf[..byte_len];
    buf.advance(byte_len);
    let mut values = Vec::new();
    while !slice.is_empty() {
        values.push(decode_field_value(&mut slice)?);
    }
    Ok(values)
}

fn encode_field_array(out: &mut BytesMut, values: &[FieldValue]) -> Result<(), CodecError> {
    let mut inner = BytesMut::new();
    for value in values {
        encode_field_value(&mut inner, value)?;
    }
    out.put_u32(inner.len() as u32);
    out.put_slice(&inner);
    Ok(())
}

pub fn decode_field_table(buf: &mut &[u8]) -> Result<FieldTable, CodecError> {
    need(buf, 4)?;
    let byte_len = buf.get_u32() as usize;
    need(buf, byte_len)?;
    let mut slice = &buf[..byte_len];
    buf.advance(byte_len);

    let mut table = FieldTable::new();
    while !slice.is_empty() {
        let name = decode_short_string(&mut slice)?;
        let value = decode_field_value(&mut slice)?;
        table.push(name, value);
    }
    Ok(table)
}

pub fn encode_field_table(out: &mut BytesMut, table: &FieldTable) -> Result<(), CodecError> {
    let mut inner = BytesMut::new();
    for (name, value) in &table.fields {
        encode_short_string(&mut inner, name)?;
        encode_field_value(&mut inner, value)?;
    }
    out.put_u32(inner.len() as u32);
    out.put_slice(&inner);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: FieldValue) {
        let mut out = BytesMut::new();
        encode_field_value(&mut out, &value).unwrap();
        let mut slice: &[u8] = &out;
        let decoded = decode_field_value(&mut slice).unwrap();
        assert!(slice.is_empty());
        assert_eq!(decoded, value);
    }

    #[test]
    fn round_trips_every_scalar_tag() {
        round_trip(FieldValue::Boolean(true));
        round_trip(FieldValue::Boolean(false));
        round_trip(FieldValue::ShortShortInt(-5));
        round_trip(FieldValue::ShortShortUint(200));
        round_trip(FieldValue::ShortInt(-1234));
        round_trip(FieldValue::ShortUint(5000));
        round_trip(FieldValue::LongInt(-70000));
        round_trip(FieldValue::LongUint(70000));
        round_trip(FieldValue::LongLongInt(i64::MIN));
        round_trip(FieldValue::Float([0, 1, 2, 3]));
        round_trip(FieldValue::Double([0, 1, 2, 3, 4, 5, 6, 7]));
        round_trip(FieldValue::Decimal([2, 0, 0, 1, 244]));
        round_trip(FieldValue::LongString(Bytes::from_static(b"a long string")));
        round_trip(FieldValue::Timestamp(1_700_000_000));
        round_trip(FieldValue::Void);
        round_trip(FieldValue::ByteArray(Bytes::from_static(b"\x00\x01\x02")));
    }

    #[test]
    fn round_trips_nested_array_and_table() {
        let mut nested = FieldTable::new();
        nested.push("inner", FieldValue::LongUint(42));
        round_trip(FieldValue::FieldArray(vec![
            FieldValue::Boolean(true),
            FieldValue::LongString(Bytes::from_static(b"x")),
        ]));
        round_trip(FieldValue::FieldTable(nested));
    }

    #[test]
    fn u_tag_decodes_as_short_int() {
        let mut payload = BytesMut::new();
        payload.put_u8(b'U');
        payload.put_i16(-7);
        let mut slice: &[u8] = &payload;
        match decode_field_value(&mut slice).unwrap() {
            FieldValue::ShortInt(v) => assert_eq!(v, -7),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn field_table_round_trips_with_repeated_and_ordered_names() {
        let mut table = FieldTable::new();
        table.push("platform", FieldValue::LongString(Bytes::from_static(b"rust")));
        table.push("copyright", FieldValue::LongString(Bytes::from_static(b"x")));
        table.push("platform", FieldValue::LongString(Bytes::from_static(b"dup")));

        let mut out = BytesMut::new();
        encode_field_table(&mut out, &table).unwrap();
        let mut slice: &[u8] = &out;
        let decoded = decode_field_table(&mut slice).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded, table);
    }

    #[test]
    fn short_string_over_limit_is_rejected() {
        let s = "a".repeat(SHORT_STRING_LIMIT + 1);
        let mut out = BytesMut::new();
        assert!(encode_short_string(&mut out, &s).is_err());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut payload = BytesMut::new();
        payload.put_u8(b'?');
        let mut slice: &[u8] = &payload;
        assert_eq!(
            decode_field_value(&mut slice).unwrap_err(),
            CodecError::UnknownTag(b'?')
        );
    }
}
