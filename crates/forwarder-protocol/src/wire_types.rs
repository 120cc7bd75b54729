//! Low-level wire types and constants.
//!
//! This module defines:
//! - Schema identifiers for the two record kinds.
//! - Schema versioning and header geometry.
//! - Value class tags and name length limits.
//!
//! The actual encode/decode logic lives in `schema_codec`.

/// Current schema version, first byte of every frame.
pub const SCHEMA_VERSION: u8 = 1;

/// Bytes before the body: version, 3 reserved, 4-byte identifier.
pub const HEADER_LEN: usize = 8;

/// Where the identifier sits inside the header.
///
/// Downstream readers sniff `frame[4..8]` to tell record kinds apart
/// without decoding.
pub const IDENTIFIER_OFFSET: usize = 4;

/// Identifier of a value-update record.
pub const VALUE_UPDATE_ID: [u8; 4] = *b"f142";

/// Identifier of a connection-status record.
pub const CONNECTION_STATUS_ID: [u8; 4] = *b"ep00";

/// Record kind selected by the identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchemaId {
    ValueUpdate,
    ConnectionStatus,
}

impl SchemaId {
    pub fn from_bytes(id: [u8; 4]) -> Option<Self> {
        match &id {
            b"f142" => Some(SchemaId::ValueUpdate),
            b"ep00" => Some(SchemaId::ConnectionStatus),
            _ => None,
        }
    }

    pub fn as_bytes(self) -> [u8; 4] {
        match self {
            SchemaId::ValueUpdate => VALUE_UPDATE_ID,
            SchemaId::ConnectionStatus => CONNECTION_STATUS_ID,
        }
    }
}

/// Shape of the payload in a value-update body.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValueClass {
    Scalar = 0,
    Array = 1,
    String = 2,
}

impl ValueClass {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ValueClass::Scalar),
            1 => Some(ValueClass::Array),
            2 => Some(ValueClass::String),
            _ => None,
        }
    }
}

/// Flag bit: the value update carries a status code.
pub const FLAG_HAS_STATUS: u8 = 0b0000_0001;

/// Maximum channel name length on the wire, in bytes.
pub const MAX_SOURCE_NAME_LEN: usize = 1024;

/// A tiny helper for validating channel name lengths.
pub fn validate_source_name_len(len: usize) -> bool {
    len > 0 && len <= MAX_SOURCE_NAME_LEN
}

/// Read the schema identifier of a frame without decoding it.
///
/// Returns `None` for short frames and unknown identifiers.
pub fn peek_schema_id(frame: &[u8]) -> Option<SchemaId> {
    let id: [u8; 4] = frame
        .get(IDENTIFIER_OFFSET..IDENTIFIER_OFFSET + 4)?
        .try_into()
        .ok()?;
    SchemaId::from_bytes(id)
}
