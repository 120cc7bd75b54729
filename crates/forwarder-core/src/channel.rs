//! A single forwarded channel and its configuration.

use std::time::Duration;

use tokio::time::Instant;

use crate::idle_policy::{IdleConfig, IdleTimer};
use crate::messages::ConnectionState;
use crate::value::{Value, ValueKind};

/// Where a channel's updates come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// A live PV provider (channel access).
    Live,

    /// Synthetic generator. With no `update_period` it emits a single
    /// value and then stays silent.
    Fake { update_period: Option<Duration> },
}

/// Per-channel configuration carried by `StartChannels`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub source: SourceKind,
    pub idle: IdleConfig,

    /// Output topic override; `None` means the forwarder's data topic.
    pub topic: Option<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            source: SourceKind::Live,
            idle: IdleConfig::default(),
            topic: None,
        }
    }
}

/// A channel name plus its config, as listed in a start command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub config: ChannelConfig,
}

impl ChannelSpec {
    pub fn new(name: impl Into<String>, config: ChannelConfig) -> Self {
        ChannelSpec {
            name: name.into(),
            config,
        }
    }
}

/// Opaque handle for a source subscription.
///
/// Unique over the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// Registry entry for one channel.
#[derive(Debug, Clone)]
pub struct Channel {
    name: String,
    config: ChannelConfig,
    pub(crate) subscription: Option<SubscriptionHandle>,

    /// Kind of the first value observed; later values must match.
    pub(crate) kind: Option<ValueKind>,
    pub(crate) last_value: Option<Value>,
    pub(crate) last_status: Option<u16>,
    pub(crate) last_update_ms: Option<u64>,
    pub(crate) last_update_at: Option<Instant>,
    pub(crate) state: ConnectionState,
    pub(crate) degraded: bool,
    pub(crate) idle: IdleTimer,
}

impl Channel {
    pub(crate) fn new(name: impl Into<String>, config: ChannelConfig) -> Self {
        let idle = IdleTimer::new(config.idle);
        Channel {
            name: name.into(),
            config,
            subscription: None,
            kind: None,
            last_value: None,
            last_status: None,
            last_update_ms: None,
            last_update_at: None,
            state: ConnectionState::Unknown,
            degraded: false,
            idle,
        }
    }

    /// Replace the config without touching value history.
    pub(crate) fn reconfigure(&mut self, config: ChannelConfig) {
        self.idle.reconfigure(config.idle);
        self.config = config;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn subscription(&self) -> Option<SubscriptionHandle> {
        self.subscription
    }

    pub fn kind(&self) -> Option<ValueKind> {
        self.kind
    }

    pub fn last_value(&self) -> Option<&Value> {
        self.last_value.as_ref()
    }

    /// Wall-clock timestamp (ms since epoch) of the last real update.
    pub fn last_update_ms(&self) -> Option<u64> {
        self.last_update_ms
    }

    /// Monotonic instant of the last real update.
    pub fn last_update_at(&self) -> Option<Instant> {
        self.last_update_at
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True once a value of the wrong kind has been seen.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn idle_timer(&self) -> &IdleTimer {
        &self.idle
    }
}
