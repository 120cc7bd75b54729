//! Shared types for the forwarder service.
//!
//! This module defines:
//! - `ControlInput`: messages flowing into the controller loop
//! - channel aliases between the command consumer and the controller
//! - `ServiceState`: the lifecycle published on a watch channel
//! - `ForwarderReport`: what `run` returns after draining

use std::fmt;

use forwarder_core::{Command, ForwarderError};
use tokio::sync::{mpsc, watch};

/// Message flowing into the controller task.
#[derive(Debug)]
pub enum ControlInput {
    /// A parsed command from the command log (or from ctrl-c).
    Command(Command),

    /// The command consumer gave up; the controller must drain and stop.
    Fatal(ForwarderError),
}

/// Bounded channel into the controller task.
pub type ControlTx = mpsc::Sender<ControlInput>;
pub type ControlRx = mpsc::Receiver<ControlInput>;

/// Forwarder lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Initializing,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Initializing => "initializing",
            ServiceState::Running => "running",
            ServiceState::Draining => "draining",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

pub type StateTx = watch::Sender<ServiceState>;
pub type StateRx = watch::Receiver<ServiceState>;

/// Summary of a forwarder run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderReport {
    /// Records acknowledged by the transport.
    pub published: u64,

    /// Records dropped after exhausting the retry budget.
    pub dropped: u64,

    /// Records still in flight when the drain timeout expired.
    pub unacknowledged: usize,
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
