//! forwarder-core
//!
//! Pure PV forwarding logic:
//! - typed values
//! - messages (source events, commands, output records)
//! - channel configuration and state
//! - channel registry
//! - idle-update policy

pub mod value;
pub mod messages;
pub mod channel;
pub mod registry;
pub mod idle_policy;
pub mod error;

pub use value::{ArrayValue, Scalar, ScalarKind, Value, ValueKind};

pub use messages::{
    Command,
    ConnectionState,
    ConnectionStatus,
    Record,
    SourceEvent,
    StatusEvent,
    ValueUpdate,
};

pub use channel::{Channel, ChannelConfig, ChannelSpec, SourceKind, SubscriptionHandle};
pub use registry::{AddOutcome, Registry};
pub use idle_policy::{IdleConfig, IdleTimer, DEFAULT_IDLE_TICK};
pub use error::ForwarderError;
