//! forwarder-protocol
//!
//! Wire-level encoding/decoding for the PV forwarder.
//!
//! - [`schema_codec`]  : binary data-log records (`f142` value updates,
//!   `ep00` connection status)
//! - [`command_codec`] : JSON command-log payloads

pub mod wire_types;
pub mod schema_codec;
pub mod command_codec;

pub use schema_codec::{
    ProtocolError,
    decode,
    encode,
    encode_to_vec,
};

pub use command_codec::{encode_command, parse_command, StreamConfig};
pub use wire_types::{peek_schema_id, SchemaId};
