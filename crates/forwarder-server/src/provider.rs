//! Live PV providers.
//!
//! A [`PvProvider`] turns a PV name into a stream of [`PvUpdate`]s. The
//! forwarder never talks to a control-system library directly; it only
//! sees this trait. [`LoopbackProvider`] keeps PVs in memory and is
//! driven with [`LoopbackProvider::put`] and
//! [`LoopbackProvider::set_connected`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use forwarder_core::{ConnectionState, Value};

use crate::types::epoch_millis;

const MONITOR_CAPACITY: usize = 256;

/// One update from a monitored PV.
#[derive(Debug, Clone, PartialEq)]
pub enum PvUpdate {
    Value {
        value: Value,
        timestamp_ms: u64,
        status: Option<u16>,
    },
    Connection(ConnectionState),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("unknown PV: {0}")]
    UnknownPv(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

pub trait PvProvider: Send + Sync {
    /// Start monitoring `name`. The stream ends when the provider drops
    /// the PV.
    fn monitor(&self, name: &str) -> Result<mpsc::Receiver<PvUpdate>, ProviderError>;
}

#[derive(Debug, Default)]
struct LoopbackPv {
    connected: bool,
    value: Option<(Value, u64)>,
    monitors: Vec<mpsc::Sender<PvUpdate>>,
}

impl LoopbackPv {
    fn broadcast(&mut self, update: PvUpdate) {
        // A full monitor misses this update but stays attached; closed
        // monitors are detached.
        self.monitors
            .retain(|tx| match tx.try_send(update.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!("monitor queue full, update skipped");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
    }
}

/// In-memory PV provider.
///
/// PVs must be declared with [`add_pv`](Self::add_pv) before they can be
/// monitored. A new monitor immediately receives the current connection
/// state and, when connected, the current value.
#[derive(Debug, Default)]
pub struct LoopbackProvider {
    pvs: Mutex<HashMap<String, LoopbackPv>>,
}

impl LoopbackProvider {
    pub fn new() -> Self {
        LoopbackProvider::default()
    }

    fn pvs(&self) -> MutexGuard<'_, HashMap<String, LoopbackPv>> {
        self.pvs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Declare a connected PV with an initial value.
    pub fn add_pv(&self, name: &str, value: impl Into<Value>) {
        let mut pvs = self.pvs();
        let pv = pvs.entry(name.to_string()).or_default();
        pv.connected = true;
        pv.value = Some((value.into(), epoch_millis()));
    }

    /// Set a new value, stamped with the current wall clock.
    pub fn put(&self, name: &str, value: impl Into<Value>) -> Result<(), ProviderError> {
        self.put_at(name, value, epoch_millis())
    }

    /// Set a new value with an explicit source timestamp.
    pub fn put_at(
        &self,
        name: &str,
        value: impl Into<Value>,
        timestamp_ms: u64,
    ) -> Result<(), ProviderError> {
        let mut pvs = self.pvs();
        let pv = pvs
            .get_mut(name)
            .ok_or_else(|| ProviderError::UnknownPv(name.to_string()))?;

        let value = value.into();
        pv.value = Some((value.clone(), timestamp_ms));
        if pv.connected {
            pv.broadcast(PvUpdate::Value {
                value,
                timestamp_ms,
                status: None,
            });
        }
        Ok(())
    }

    pub fn set_connected(&self, name: &str, connected: bool) -> Result<(), ProviderError> {
        let mut pvs = self.pvs();
        let pv = pvs
            .get_mut(name)
            .ok_or_else(|| ProviderError::UnknownPv(name.to_string()))?;

        if pv.connected == connected {
            return Ok(());
        }
        pv.connected = connected;

        let state = if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        pv.broadcast(PvUpdate::Connection(state));
        if connected {
            if let Some((value, timestamp_ms)) = pv.value.clone() {
                pv.broadcast(PvUpdate::Value {
                    value,
                    timestamp_ms,
                    status: None,
                });
            }
        }
        Ok(())
    }

    /// Forget a PV; its monitors see their stream end.
    pub fn remove_pv(&self, name: &str) {
        self.pvs().remove(name);
    }
}

impl PvProvider for LoopbackProvider {
    fn monitor(&self, name: &str) -> Result<mpsc::Receiver<PvUpdate>, ProviderError> {
        let mut pvs = self.pvs();
        let pv = pvs
            .get_mut(name)
            .ok_or_else(|| ProviderError::UnknownPv(name.to_string()))?;

        let (tx, rx) = mpsc::channel(MONITOR_CAPACITY);
        if pv.connected {
            // Fresh channel with spare capacity; these cannot fail.
            let _ = tx.try_send(PvUpdate::Connection(ConnectionState::Connected));
            if let Some((value, timestamp_ms)) = pv.value.clone() {
                let _ = tx.try_send(PvUpdate::Value {
                    value,
                    timestamp_ms,
                    status: None,
                });
            }
        } else {
            let _ = tx.try_send(PvUpdate::Connection(ConnectionState::Disconnected));
        }
        pv.monitors.push(tx);

        debug!(pv = name, monitors = pv.monitors.len(), "monitor attached");
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn monitor_replays_current_state() {
        let provider = LoopbackProvider::new();
        provider.add_pv("SIM:Temp", 21.5);

        let mut rx = provider.monitor("SIM:Temp").unwrap();
        assert_eq!(
            rx.recv().await,
            Some(PvUpdate::Connection(ConnectionState::Connected))
        );
        match rx.recv().await {
            Some(PvUpdate::Value { value, .. }) => assert_eq!(value, Value::from(21.5)),
            other => panic!("expected value, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn put_reaches_every_monitor() {
        let provider = LoopbackProvider::new();
        provider.add_pv("PV", 1i32);

        let mut a = provider.monitor("PV").unwrap();
        let mut b = provider.monitor("PV").unwrap();
        for rx in [&mut a, &mut b] {
            rx.recv().await;
            rx.recv().await;
        }

        provider.put_at("PV", 2i32, 1234).unwrap();
        for rx in [&mut a, &mut b] {
            assert_eq!(
                rx.recv().await,
                Some(PvUpdate::Value {
                    value: Value::from(2i32),
                    timestamp_ms: 1234,
                    status: None
                })
            );
        }
    }

    #[tokio::test]
    async fn disconnect_is_reported_and_values_held_back() {
        let provider = LoopbackProvider::new();
        provider.add_pv("PV", 1i32);
        let mut rx = provider.monitor("PV").unwrap();
        rx.recv().await;
        rx.recv().await;

        provider.set_connected("PV", false).unwrap();
        provider.put("PV", 5i32).unwrap();
        assert_eq!(
            rx.recv().await,
            Some(PvUpdate::Connection(ConnectionState::Disconnected))
        );
        assert!(rx.try_recv().is_err());

        provider.set_connected("PV", true).unwrap();
        assert_eq!(
            rx.recv().await,
            Some(PvUpdate::Connection(ConnectionState::Connected))
        );
        assert!(matches!(rx.recv().await, Some(PvUpdate::Value { .. })));
    }

    #[tokio::test]
    async fn slow_monitor_survives_a_full_queue() {
        let provider = LoopbackProvider::new();
        provider.add_pv("PV", 0i32);
        let mut rx = provider.monitor("PV").unwrap();

        for n in 1..=(MONITOR_CAPACITY as i32 + 50) {
            provider.put_at("PV", n, n as u64).unwrap();
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, MONITOR_CAPACITY);

        provider.put_at("PV", -1i32, 9999).unwrap();
        assert_eq!(
            rx.recv().await,
            Some(PvUpdate::Value {
                value: Value::from(-1i32),
                timestamp_ms: 9999,
                status: None
            })
        );
    }

    #[tokio::test]
    async fn dropped_monitor_is_detached() {
        let provider = LoopbackProvider::new();
        provider.add_pv("PV", 0i32);
        drop(provider.monitor("PV").unwrap());
        let _kept = provider.monitor("PV").unwrap();

        provider.put("PV", 1i32).unwrap();
        assert_eq!(provider.pvs().get("PV").map(|pv| pv.monitors.len()), Some(1));
    }

    #[test]
    fn unknown_pv_cannot_be_monitored() {
        let provider = LoopbackProvider::new();
        assert_eq!(
            provider.monitor("nope").err(),
            Some(ProviderError::UnknownPv("nope".to_string()))
        );
    }
}
