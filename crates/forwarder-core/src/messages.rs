//! Message types used by the forwarder core.
//!
//! These are **transport-agnostic** logical messages:
//! - [`SourceEvent`]: what the update sources feed into the registry.
//! - [`Command`]: what the command log asks the controller to do.
//! - [`Record`]: what ends up on the data log.
//!
//! Every record names its channel so the publisher can key it without
//! extra context.
//!
//! Note: the binary / JSON encoders live in the `forwarder-protocol`
//! crate; this module is purely logical.

use crate::channel::{ChannelSpec, SubscriptionHandle};
use crate::value::Value;

/// Connection state of a channel as seen by the registry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Unknown,
}

/// Status event carried by a [`ConnectionStatus`] record.
///
/// A superset of [`ConnectionState`]: it also reports channel removal and
/// type errors. The discriminants are the wire values.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Unknown = 0,
    NeverConnected = 1,
    Connected = 2,
    Disconnected = 3,
    Destroyed = 4,
    TypeMismatch = 5,
}

impl StatusEvent {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(StatusEvent::Unknown),
            1 => Some(StatusEvent::NeverConnected),
            2 => Some(StatusEvent::Connected),
            3 => Some(StatusEvent::Disconnected),
            4 => Some(StatusEvent::Destroyed),
            5 => Some(StatusEvent::TypeMismatch),
            _ => None,
        }
    }
}

impl From<ConnectionState> for StatusEvent {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connected => StatusEvent::Connected,
            ConnectionState::Disconnected => StatusEvent::Disconnected,
            ConnectionState::Unknown => StatusEvent::Unknown,
        }
    }
}

/// Value update record (`f142` on the wire).
#[derive(Debug, Clone, PartialEq)]
pub struct ValueUpdate {
    /// Channel (PV) name; also the publish key.
    pub source_name: String,

    pub value: Value,

    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,

    /// Alarm/status code reported by the source, if any.
    pub status: Option<u16>,
}

/// Connection status record (`ep00` on the wire).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub source_name: String,
    pub event: StatusEvent,
    pub timestamp_ms: u64,
}

/// Anything the forwarder publishes to the data log.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    ValueUpdate(ValueUpdate),
    ConnectionStatus(ConnectionStatus),
}

impl Record {
    /// Convenience constructor for a value update without status.
    pub fn value_update(source_name: impl Into<String>, value: Value, timestamp_ms: u64) -> Self {
        Record::ValueUpdate(ValueUpdate {
            source_name: source_name.into(),
            value,
            timestamp_ms,
            status: None,
        })
    }

    /// Convenience constructor for a connection status record.
    pub fn connection_status(
        source_name: impl Into<String>,
        event: StatusEvent,
        timestamp_ms: u64,
    ) -> Self {
        Record::ConnectionStatus(ConnectionStatus {
            source_name: source_name.into(),
            event,
            timestamp_ms,
        })
    }

    pub fn source_name(&self) -> &str {
        match self {
            Record::ValueUpdate(u) => &u.source_name,
            Record::ConnectionStatus(s) => &s.source_name,
        }
    }

    pub fn timestamp_ms(&self) -> u64 {
        match self {
            Record::ValueUpdate(u) => u.timestamp_ms,
            Record::ConnectionStatus(s) => s.timestamp_ms,
        }
    }

    pub fn as_value_update(&self) -> Option<&ValueUpdate> {
        match self {
            Record::ValueUpdate(u) => Some(u),
            Record::ConnectionStatus(_) => None,
        }
    }
}

/// An event produced by an update source for one channel.
///
/// `subscription` names the subscription that produced the event. The
/// registry drops events whose subscription is no longer the channel's
/// current one; `None` is accepted for any subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    ValueChanged {
        name: String,
        subscription: Option<SubscriptionHandle>,
        value: Value,
        timestamp_ms: u64,
        status: Option<u16>,
    },
    ConnectionChanged {
        name: String,
        subscription: Option<SubscriptionHandle>,
        state: ConnectionState,
        timestamp_ms: u64,
    },
}

impl SourceEvent {
    pub fn name(&self) -> &str {
        match self {
            SourceEvent::ValueChanged { name, .. } => name,
            SourceEvent::ConnectionChanged { name, .. } => name,
        }
    }

    pub fn subscription(&self) -> Option<SubscriptionHandle> {
        match self {
            SourceEvent::ValueChanged { subscription, .. } => *subscription,
            SourceEvent::ConnectionChanged { subscription, .. } => *subscription,
        }
    }
}

/// A control-plane request.
///
/// Commands are idempotent against the registry: starting a running
/// channel re-affirms its config, stopping an absent channel does nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Add (or reconfigure) the listed channels.
    StartChannels(Vec<ChannelSpec>),

    /// Remove the listed channels.
    StopChannels(Vec<String>),

    /// Remove every channel.
    StopAll,

    /// Drain and stop the forwarder.
    Exit,
}
