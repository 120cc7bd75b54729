//! Idle-update policy.
//!
//! A channel whose value has not changed for `idle_period` is republished
//! with its last value and a fresh timestamp, so consumers can tell a quiet
//! PV from a dead forwarder.
//!
//! - A real value change publishes immediately and resets the timer.
//! - The controller checks every channel on a fixed tick
//!   ([`DEFAULT_IDLE_TICK`] unless configured), independent of how many
//!   channels there are.
//! - `update_period` is a lower bound on the spacing between two forced
//!   republishes of the same channel.
//! - A channel that never produced a value is never republished.

use std::time::Duration;

use tokio::time::Instant;

/// Default interval between idle checks.
pub const DEFAULT_IDLE_TICK: Duration = Duration::from_secs(1);

/// Per-channel idle knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IdleConfig {
    /// Silence after which the last value is republished. `None` disables
    /// idle updates for the channel.
    pub idle_period: Option<Duration>,

    /// Minimum spacing between two forced updates.
    pub update_period: Duration,
}

/// Timer state kept on every channel.
#[derive(Debug, Clone)]
pub struct IdleTimer {
    config: IdleConfig,
    last_published: Option<Instant>,
    last_forced: Option<Instant>,
}

impl IdleTimer {
    pub fn new(config: IdleConfig) -> Self {
        IdleTimer {
            config,
            last_published: None,
            last_forced: None,
        }
    }

    pub fn config(&self) -> IdleConfig {
        self.config
    }

    /// Swap the knobs, keeping the publish history.
    pub fn reconfigure(&mut self, config: IdleConfig) {
        self.config = config;
    }

    /// A real update was published at `now`.
    pub fn on_published(&mut self, now: Instant) {
        self.last_published = Some(now);
    }

    /// A forced (idle) update was published at `now`.
    pub fn on_forced(&mut self, now: Instant) {
        self.last_published = Some(now);
        self.last_forced = Some(now);
    }

    /// Whether an idle republish is due at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        let Some(idle_period) = self.config.idle_period else {
            return false;
        };
        let Some(last_published) = self.last_published else {
            return false;
        };

        if now.saturating_duration_since(last_published) < idle_period {
            return false;
        }

        match self.last_forced {
            Some(last_forced) => {
                now.saturating_duration_since(last_forced) >= self.config.update_period
            }
            None => true,
        }
    }

    pub fn last_published(&self) -> Option<Instant> {
        self.last_published
    }
}
