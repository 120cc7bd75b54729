//! Binary encoding/decoding of forwarder records.
//!
//! This module converts between:
//! - raw frames (`&[u8]`), one record per frame
//! - high-level `forwarder_core::Record`
//!
//! Frame layout (all integers little-endian):
//!
//! ```text
//! Header
//! ------
//! [0]    : schema version (SCHEMA_VERSION)
//! [1..4] : reserved = 0
//! [4..8] : identifier, b"f142" or b"ep00"
//! [8..]  : body (depends on identifier)
//!
//! Value update (f142):
//!   [+8]  timestamp_ms (u64)
//!   [+1]  flags (bit0 = status present)
//!   [+2]  status (u16, 0 when absent)
//!   [+1]  value class (0=scalar, 1=array, 2=string)
//!   [+1]  element kind (ScalarKind tag, 0 for strings)
//!   [+2]  name_len (u16, 1..=MAX_SOURCE_NAME_LEN)
//!   [..]  name bytes (UTF-8)
//!   payload:
//!     scalar: one element of the kind's width
//!     array : count (u32), then count elements
//!     string: byte length (u32), then UTF-8 bytes
//!
//! Connection status (ep00):
//!   [+8]  timestamp_ms (u64)
//!   [+1]  status event (StatusEvent tag)
//!   [+2]  name_len (u16)
//!   [..]  name bytes
//! ```
//!
//! Floats are written with `to_bits`, so NaN payloads and signed zeros
//! survive a round trip. The round trip is bitwise: `Value` equality
//! follows IEEE rules, so a decoded NaN never equals the original; compare
//! the re-encoded frames instead. A frame must be consumed exactly;
//! trailing bytes are an error. Reserved header bytes and the element
//! kind of a string must be zero.

use bytes::{Buf, BufMut};
use thiserror::Error;

use forwarder_core::{
    ArrayValue, ConnectionStatus, ForwarderError, Record, Scalar, ScalarKind, StatusEvent, Value,
    ValueUpdate,
};

use crate::wire_types::{
    validate_source_name_len, SchemaId, ValueClass, FLAG_HAS_STATUS, HEADER_LEN,
    IDENTIFIER_OFFSET, SCHEMA_VERSION,
};

/// Errors that can arise when encoding/decoding a frame or a command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer too short for the expected fields.
    #[error("buffer truncated")]
    Truncated,

    /// Identifier is neither `f142` nor `ep00`.
    #[error("unknown schema identifier: {:?}", String::from_utf8_lossy(.0))]
    UnknownIdentifier([u8; 4]),

    #[error("schema version mismatch: got {0}, expected {}", SCHEMA_VERSION)]
    VersionMismatch(u8),

    /// Empty, over-long or non-UTF-8 channel name.
    #[error("invalid source name")]
    InvalidSourceName,

    /// Bad tag or out-of-range field.
    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),

    /// JSON command could not be parsed or validated.
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl From<ProtocolError> for ForwarderError {
    fn from(err: ProtocolError) -> Self {
        ForwarderError::MalformedMessage(err.to_string())
    }
}

// ============================================================================
// ENCODE
// ============================================================================

/// Encode a single record into a frame.
///
/// The encoded bytes are appended to `out`.
pub fn encode(record: &Record, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
    match record {
        Record::ValueUpdate(u) => encode_value_update(u, out),
        Record::ConnectionStatus(s) => encode_connection_status(s, out),
    }
}

/// Encode a single record into a fresh buffer.
pub fn encode_to_vec(record: &Record) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(64);
    encode(record, &mut out)?;
    Ok(out)
}

fn encode_value_update(u: &ValueUpdate, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
    let name = checked_name(&u.source_name)?;

    write_header(SchemaId::ValueUpdate, out);
    out.put_u64_le(u.timestamp_ms);

    let flags = if u.status.is_some() { FLAG_HAS_STATUS } else { 0 };
    out.put_u8(flags);
    out.put_u16_le(u.status.unwrap_or(0));

    match &u.value {
        Value::Scalar(s) => {
            out.put_u8(ValueClass::Scalar as u8);
            out.put_u8(s.kind() as u8);
            write_name(name, out);
            write_scalar(s, out);
        }
        Value::Array(a) => {
            let count =
                u32::try_from(a.len()).map_err(|_| ProtocolError::InvalidField("array length"))?;
            out.put_u8(ValueClass::Array as u8);
            out.put_u8(a.element_kind() as u8);
            write_name(name, out);
            out.put_u32_le(count);
            write_array(a, out);
        }
        Value::String(s) => {
            let len =
                u32::try_from(s.len()).map_err(|_| ProtocolError::InvalidField("string length"))?;
            out.put_u8(ValueClass::String as u8);
            out.put_u8(0);
            write_name(name, out);
            out.put_u32_le(len);
            out.put_slice(s.as_bytes());
        }
    }

    Ok(())
}

fn encode_connection_status(s: &ConnectionStatus, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
    let name = checked_name(&s.source_name)?;

    write_header(SchemaId::ConnectionStatus, out);
    out.put_u64_le(s.timestamp_ms);
    out.put_u8(s.event as u8);
    write_name(name, out);

    Ok(())
}

fn write_header(id: SchemaId, out: &mut Vec<u8>) {
    out.put_u8(SCHEMA_VERSION);
    out.put_slice(&[0, 0, 0]); // reserved
    out.put_slice(&id.as_bytes());
}

fn checked_name(name: &str) -> Result<&[u8], ProtocolError> {
    let bytes = name.as_bytes();
    if !validate_source_name_len(bytes.len()) {
        return Err(ProtocolError::InvalidSourceName);
    }
    Ok(bytes)
}

/// Caller has validated the length, so it fits in a u16.
fn write_name(name: &[u8], out: &mut Vec<u8>) {
    out.put_u16_le(name.len() as u16);
    out.put_slice(name);
}

fn write_scalar(s: &Scalar, out: &mut Vec<u8>) {
    match *s {
        Scalar::Int8(v) => out.put_i8(v),
        Scalar::Int16(v) => out.put_i16_le(v),
        Scalar::Int32(v) => out.put_i32_le(v),
        Scalar::Int64(v) => out.put_i64_le(v),
        Scalar::UInt8(v) => out.put_u8(v),
        Scalar::UInt16(v) => out.put_u16_le(v),
        Scalar::UInt32(v) => out.put_u32_le(v),
        Scalar::UInt64(v) => out.put_u64_le(v),
        Scalar::Float(v) => out.put_u32_le(v.to_bits()),
        Scalar::Double(v) => out.put_u64_le(v.to_bits()),
    }
}

fn write_array(a: &ArrayValue, out: &mut Vec<u8>) {
    match a {
        ArrayValue::Int8(vals) => vals.iter().for_each(|v| out.put_i8(*v)),
        ArrayValue::Int16(vals) => vals.iter().for_each(|v| out.put_i16_le(*v)),
        ArrayValue::Int32(vals) => vals.iter().for_each(|v| out.put_i32_le(*v)),
        ArrayValue::Int64(vals) => vals.iter().for_each(|v| out.put_i64_le(*v)),
        ArrayValue::UInt8(vals) => out.put_slice(vals),
        ArrayValue::UInt16(vals) => vals.iter().for_each(|v| out.put_u16_le(*v)),
        ArrayValue::UInt32(vals) => vals.iter().for_each(|v| out.put_u32_le(*v)),
        ArrayValue::UInt64(vals) => vals.iter().for_each(|v| out.put_u64_le(*v)),
        ArrayValue::Float(vals) => vals.iter().for_each(|v| out.put_u32_le(v.to_bits())),
        ArrayValue::Double(vals) => vals.iter().for_each(|v| out.put_u64_le(v.to_bits())),
    }
}

// ============================================================================
// DECODE
// ============================================================================

/// Decode a single record from a frame.
///
/// The buffer must contain exactly one full record as described above.
pub fn decode(buf: &[u8]) -> Result<Record, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Err(ProtocolError::Truncated);
    }

    let mut id = [0u8; 4];
    id.copy_from_slice(&buf[IDENTIFIER_OFFSET..IDENTIFIER_OFFSET + 4]);
    let schema = SchemaId::from_bytes(id).ok_or(ProtocolError::UnknownIdentifier(id))?;

    let version = buf[0];
    if version != SCHEMA_VERSION {
        return Err(ProtocolError::VersionMismatch(version));
    }
    if buf[1..IDENTIFIER_OFFSET].iter().any(|b| *b != 0) {
        return Err(ProtocolError::InvalidField("reserved"));
    }

    let mut reader = Reader::new(&buf[HEADER_LEN..]);
    let record = match schema {
        SchemaId::ValueUpdate => decode_value_update(&mut reader)?,
        SchemaId::ConnectionStatus => decode_connection_status(&mut reader)?,
    };
    reader.finish()?;

    Ok(record)
}

fn decode_value_update(r: &mut Reader<'_>) -> Result<Record, ProtocolError> {
    let timestamp_ms = r.u64()?;

    let flags = r.u8()?;
    if flags & !FLAG_HAS_STATUS != 0 {
        return Err(ProtocolError::InvalidField("flags"));
    }
    let raw_status = r.u16()?;
    let status = (flags & FLAG_HAS_STATUS != 0).then_some(raw_status);

    let class = ValueClass::from_u8(r.u8()?).ok_or(ProtocolError::InvalidField("value class"))?;
    let kind_tag = r.u8()?;
    let source_name = r.name()?;

    let value = match class {
        ValueClass::Scalar => {
            let kind = ScalarKind::from_u8(kind_tag).ok_or(ProtocolError::InvalidField("kind"))?;
            Value::Scalar(read_scalar(kind, r)?)
        }
        ValueClass::Array => {
            let kind = ScalarKind::from_u8(kind_tag).ok_or(ProtocolError::InvalidField("kind"))?;
            let count = r.u32()? as usize;
            Value::Array(read_array(kind, count, r)?)
        }
        ValueClass::String => {
            if kind_tag != 0 {
                return Err(ProtocolError::InvalidField("kind"));
            }
            let len = r.u32()? as usize;
            let bytes = r.take(len)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|_| ProtocolError::InvalidField("string value"))?;
            Value::String(s.to_string())
        }
    };

    Ok(Record::ValueUpdate(ValueUpdate {
        source_name,
        value,
        timestamp_ms,
        status,
    }))
}

fn decode_connection_status(r: &mut Reader<'_>) -> Result<Record, ProtocolError> {
    let timestamp_ms = r.u64()?;
    let event = StatusEvent::from_u8(r.u8()?).ok_or(ProtocolError::InvalidField("status event"))?;
    let source_name = r.name()?;

    Ok(Record::ConnectionStatus(ConnectionStatus {
        source_name,
        event,
        timestamp_ms,
    }))
}

fn read_scalar(kind: ScalarKind, r: &mut Reader<'_>) -> Result<Scalar, ProtocolError> {
    r.need(kind.width())?;
    let buf = &mut r.buf;
    Ok(match kind {
        ScalarKind::Int8 => Scalar::Int8(buf.get_i8()),
        ScalarKind::Int16 => Scalar::Int16(buf.get_i16_le()),
        ScalarKind::Int32 => Scalar::Int32(buf.get_i32_le()),
        ScalarKind::Int64 => Scalar::Int64(buf.get_i64_le()),
        ScalarKind::UInt8 => Scalar::UInt8(buf.get_u8()),
        ScalarKind::UInt16 => Scalar::UInt16(buf.get_u16_le()),
        ScalarKind::UInt32 => Scalar::UInt32(buf.get_u32_le()),
        ScalarKind::UInt64 => Scalar::UInt64(buf.get_u64_le()),
        ScalarKind::Float => Scalar::Float(f32::from_bits(buf.get_u32_le())),
        ScalarKind::Double => Scalar::Double(f64::from_bits(buf.get_u64_le())),
    })
}

fn read_array(kind: ScalarKind, count: usize, r: &mut Reader<'_>) -> Result<ArrayValue, ProtocolError> {
    let total = count
        .checked_mul(kind.width())
        .ok_or(ProtocolError::InvalidField("array length"))?;
    r.need(total)?;
    let buf = &mut r.buf;

    Ok(match kind {
        ScalarKind::Int8 => ArrayValue::Int8((0..count).map(|_| buf.get_i8()).collect()),
        ScalarKind::Int16 => ArrayValue::Int16((0..count).map(|_| buf.get_i16_le()).collect()),
        ScalarKind::Int32 => ArrayValue::Int32((0..count).map(|_| buf.get_i32_le()).collect()),
        ScalarKind::Int64 => ArrayValue::Int64((0..count).map(|_| buf.get_i64_le()).collect()),
        ScalarKind::UInt8 => ArrayValue::UInt8((0..count).map(|_| buf.get_u8()).collect()),
        ScalarKind::UInt16 => ArrayValue::UInt16((0..count).map(|_| buf.get_u16_le()).collect()),
        ScalarKind::UInt32 => ArrayValue::UInt32((0..count).map(|_| buf.get_u32_le()).collect()),
        ScalarKind::UInt64 => ArrayValue::UInt64((0..count).map(|_| buf.get_u64_le()).collect()),
        ScalarKind::Float => {
            ArrayValue::Float((0..count).map(|_| f32::from_bits(buf.get_u32_le())).collect())
        }
        ScalarKind::Double => {
            ArrayValue::Double((0..count).map(|_| f64::from_bits(buf.get_u64_le())).collect())
        }
    })
}

// -----------------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------------

/// Bounds-checked cursor over a frame body.
///
/// `bytes::Buf` getters panic on short input, so every read goes through
/// `need` first.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            return Err(ProtocolError::Truncated);
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn name(&mut self) -> Result<String, ProtocolError> {
        let len = self.u16()? as usize;
        if !validate_source_name_len(len) {
            return Err(ProtocolError::InvalidSourceName);
        }
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| ProtocolError::InvalidSourceName)
    }

    fn finish(&self) -> Result<(), ProtocolError> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }
}
