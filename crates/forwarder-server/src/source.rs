//! Update source adapter.
//!
//! One task per subscription feeds [`SourceEvent`]s into a single bounded
//! queue that the controller drains with [`SourceAdapter::next_event`].
//!
//! - Live channels bridge a [`PvProvider`] monitor.
//! - Fake channels emit `Connected`, then a deterministic Double
//!   waveform every `update_period` (one value if there is no period).
//!
//! Subscribing never fails: a provider error is reported as a
//! `Disconnected` connection event for the channel.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use forwarder_core::{ConnectionState, SourceEvent, SourceKind, SubscriptionHandle, Value};

use crate::provider::{PvProvider, PvUpdate};
use crate::types::epoch_millis;

/// Samples per period of the fake waveform.
const FAKE_WAVE_SAMPLES: u64 = 40;

pub struct SourceAdapter {
    provider: Arc<dyn PvProvider>,
    events_tx: mpsc::Sender<SourceEvent>,
    events_rx: mpsc::Receiver<SourceEvent>,
    tasks: HashMap<SubscriptionHandle, JoinHandle<()>>,
    next_handle: u64,
}

impl SourceAdapter {
    pub fn new(provider: Arc<dyn PvProvider>, queue_capacity: usize) -> Self {
        let (events_tx, events_rx) = mpsc::channel(queue_capacity.max(1));
        SourceAdapter {
            provider,
            events_tx,
            events_rx,
            tasks: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Start delivering events for `name`.
    pub fn subscribe(&mut self, name: &str, kind: &SourceKind) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_handle);
        self.next_handle += 1;

        let name = name.to_string();
        let tx = self.events_tx.clone();
        let task = match *kind {
            SourceKind::Live => {
                let provider = self.provider.clone();
                tokio::spawn(run_live(provider, handle, name.clone(), tx))
            }
            SourceKind::Fake { update_period } => {
                tokio::spawn(run_fake(handle, name.clone(), update_period, tx))
            }
        };

        debug!(channel = %name, handle = handle.0, ?kind, "subscribed");
        self.tasks.insert(handle, task);
        handle
    }

    /// Stop the subscription. Unknown handles are ignored.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) {
        if let Some(task) = self.tasks.remove(&handle) {
            task.abort();
            debug!(handle = handle.0, "unsubscribed");
        }
    }

    pub fn unsubscribe_all(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }

    /// Number of live subscriptions.
    pub fn active(&self) -> usize {
        self.tasks.len()
    }

    /// Next event from any subscription.
    ///
    /// Never returns `None` while the adapter is alive, because it holds
    /// a sender itself.
    pub async fn next_event(&mut self) -> Option<SourceEvent> {
        self.events_rx.recv().await
    }
}

impl Drop for SourceAdapter {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}

fn connection(handle: SubscriptionHandle, name: &str, state: ConnectionState) -> SourceEvent {
    SourceEvent::ConnectionChanged {
        name: name.to_string(),
        subscription: Some(handle),
        state,
        timestamp_ms: epoch_millis(),
    }
}

async fn run_live(
    provider: Arc<dyn PvProvider>,
    handle: SubscriptionHandle,
    name: String,
    tx: mpsc::Sender<SourceEvent>,
) {
    let mut updates = match provider.monitor(&name) {
        Ok(rx) => rx,
        Err(err) => {
            warn!(channel = %name, error = %err, "could not monitor PV");
            let _ = tx
                .send(connection(handle, &name, ConnectionState::Disconnected))
                .await;
            return;
        }
    };

    while let Some(update) = updates.recv().await {
        let event = match update {
            PvUpdate::Value {
                value,
                timestamp_ms,
                status,
            } => SourceEvent::ValueChanged {
                name: name.clone(),
                subscription: Some(handle),
                value,
                timestamp_ms,
                status,
            },
            PvUpdate::Connection(state) => connection(handle, &name, state),
        };
        if tx.send(event).await.is_err() {
            return;
        }
    }

    debug!(channel = %name, "monitor stream ended");
    let _ = tx
        .send(connection(handle, &name, ConnectionState::Disconnected))
        .await;
}

/// Sample `n` of the fake waveform.
pub fn fake_sample(n: u64) -> f64 {
    let phase = (n % FAKE_WAVE_SAMPLES) as f64 / FAKE_WAVE_SAMPLES as f64;
    (2.0 * PI * phase).sin()
}

async fn run_fake(
    handle: SubscriptionHandle,
    name: String,
    period: Option<Duration>,
    tx: mpsc::Sender<SourceEvent>,
) {
    if tx
        .send(connection(handle, &name, ConnectionState::Connected))
        .await
        .is_err()
    {
        return;
    }

    let Some(period) = period else {
        let _ = tx.send(fake_value(handle, &name, 0)).await;
        // Stay subscribed but silent until aborted.
        std::future::pending::<()>().await;
        return;
    };

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut n = 0u64;
    loop {
        ticker.tick().await;
        if tx.send(fake_value(handle, &name, n)).await.is_err() {
            return;
        }
        n = n.wrapping_add(1);
    }
}

fn fake_value(handle: SubscriptionHandle, name: &str, n: u64) -> SourceEvent {
    SourceEvent::ValueChanged {
        name: name.to_string(),
        subscription: Some(handle),
        value: Value::double(fake_sample(n)),
        timestamp_ms: epoch_millis(),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::LoopbackProvider;

    fn adapter(provider: Arc<LoopbackProvider>) -> SourceAdapter {
        SourceAdapter::new(provider, 64)
    }

    #[tokio::test(start_paused = true)]
    async fn fake_source_connects_then_ticks() {
        let mut source = adapter(Arc::new(LoopbackProvider::new()));
        source.subscribe(
            "FakePV",
            &SourceKind::Fake {
                update_period: Some(Duration::from_millis(100)),
            },
        );

        match source.next_event().await {
            Some(SourceEvent::ConnectionChanged { name, state, .. }) => {
                assert_eq!(name, "FakePV");
                assert_eq!(state, ConnectionState::Connected);
            }
            other => panic!("expected connection event, got {other:?}"),
        }

        for n in 0..3 {
            match source.next_event().await {
                Some(SourceEvent::ValueChanged { value, .. }) => {
                    assert_eq!(value.as_double(), Some(fake_sample(n)));
                }
                other => panic!("expected value, got {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fake_source_without_period_emits_once() {
        let mut source = adapter(Arc::new(LoopbackProvider::new()));
        source.subscribe("Once", &SourceKind::Fake { update_period: None });

        assert!(matches!(
            source.next_event().await,
            Some(SourceEvent::ConnectionChanged { .. })
        ));
        assert!(matches!(
            source.next_event().await,
            Some(SourceEvent::ValueChanged { .. })
        ));

        let more = tokio::time::timeout(Duration::from_secs(60), source.next_event()).await;
        assert!(more.is_err());
    }

    #[tokio::test]
    async fn unknown_live_pv_reports_disconnected() {
        let mut source = adapter(Arc::new(LoopbackProvider::new()));
        source.subscribe("SIM:Missing", &SourceKind::Live);

        match source.next_event().await {
            Some(SourceEvent::ConnectionChanged { name, state, .. }) => {
                assert_eq!(name, "SIM:Missing");
                assert_eq!(state, ConnectionState::Disconnected);
            }
            other => panic!("expected disconnect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn live_values_keep_provider_timestamps() {
        let provider = Arc::new(LoopbackProvider::new());
        provider.add_pv("SIM:Temp", 1.0);
        let mut source = adapter(provider.clone());
        source.subscribe("SIM:Temp", &SourceKind::Live);

        source.next_event().await;
        source.next_event().await;

        provider.put_at("SIM:Temp", 2.0, 42).unwrap();
        match source.next_event().await {
            Some(SourceEvent::ValueChanged {
                value, timestamp_ms, ..
            }) => {
                assert_eq!(value, Value::double(2.0));
                assert_eq!(timestamp_ms, 42);
            }
            other => panic!("expected value, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_stops_events() {
        let mut source = adapter(Arc::new(LoopbackProvider::new()));
        let handle = source.subscribe(
            "X",
            &SourceKind::Fake {
                update_period: Some(Duration::from_millis(10)),
            },
        );
        source.next_event().await;
        source.next_event().await;

        source.unsubscribe(handle);
        assert_eq!(source.active(), 0);

        // Drain whatever was queued before the abort landed.
        while let Ok(Some(_)) =
            tokio::time::timeout(Duration::from_millis(1), source.next_event()).await
        {}

        let more = tokio::time::timeout(Duration::from_secs(1), source.next_event()).await;
        assert!(more.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn events_carry_their_subscription() {
        let provider = Arc::new(LoopbackProvider::new());
        provider.add_pv("SIM:Temp", 1.0);
        let mut source = adapter(provider);

        let live = source.subscribe("SIM:Temp", &SourceKind::Live);
        let first = source.next_event().await.unwrap();
        assert_eq!(first.subscription(), Some(live));
        source.unsubscribe(live);
        while let Ok(Some(_)) =
            tokio::time::timeout(Duration::from_millis(1), source.next_event()).await
        {}

        let fake = source.subscribe("SIM:Temp", &SourceKind::Fake { update_period: None });
        assert_ne!(fake, live);
        let next = source.next_event().await.unwrap();
        assert_eq!(next.subscription(), Some(fake));
    }

    #[test]
    fn fake_waveform_is_periodic() {
        assert_eq!(fake_sample(0), 0.0);
        assert_eq!(fake_sample(7), fake_sample(7 + FAKE_WAVE_SAMPLES));
        assert!((fake_sample(FAKE_WAVE_SAMPLES / 4) - 1.0).abs() < 1e-12);
    }
}
