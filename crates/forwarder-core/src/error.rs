//! Error types for the forwarder.
//!
//! Only `Transport` and `Internal` failures stop the forwarder; everything
//! else is local to one message or one channel.

use thiserror::Error;

use crate::value::ValueKind;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ForwarderError {
    /// The log transport is unreachable or rejected an operation.
    #[error("transport error: {0}")]
    Transport(String),

    /// A command or data payload could not be decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The channel is not in the registry.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// A channel produced a value of a different kind than before.
    #[error("type mismatch on channel {channel}: expected {expected}, found {found}")]
    TypeMismatch {
        channel: String,
        expected: ValueKind,
        found: ValueKind,
    },

    /// Invalid configuration (environment, channel file, command fields).
    #[error("configuration error: {0}")]
    Config(String),

    /// A generic internal error (e.g. a forwarder task panicked).
    #[error("internal error: {0}")]
    Internal(String),
}

impl ForwarderError {
    /// Whether the forwarder can keep running after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ForwarderError::Transport(_) | ForwarderError::Internal(_))
    }
}
