//! Channel subscription registry.
//!
//! The registry is the single source of truth for "what is currently
//! forwarded":
//! - Maps channel name -> [`Channel`], no duplicates.
//! - Iterates in insertion order, so snapshots are reproducible within
//!   one process run.
//! - Turns [`SourceEvent`]s into [`Record`]s, enforcing the per-channel
//!   value-kind invariant.
//! - Produces idle republishes on request.
//!
//! It is owned by exactly one task (the controller loop); nothing here
//! is synchronized.

use indexmap::IndexMap;
use tokio::time::Instant;
use tracing::debug;

use crate::channel::{Channel, ChannelConfig, SubscriptionHandle};
use crate::error::ForwarderError;
use crate::messages::{ConnectionState, Record, SourceEvent, StatusEvent, ValueUpdate};

/// Result of [`Registry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The channel was not registered before.
    Inserted,

    /// The channel existed; its config was replaced. `source_changed`
    /// tells the caller whether the subscription must be re-established.
    Updated { source_changed: bool },
}

#[derive(Debug, Default)]
pub struct Registry {
    channels: IndexMap<String, Channel>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Register `name`, or update its config if already present.
    ///
    /// Updating keeps the last value, timestamps, connection state and
    /// observed kind.
    pub fn add(&mut self, name: &str, config: ChannelConfig) -> AddOutcome {
        match self.channels.get_mut(name) {
            Some(channel) => {
                let source_changed = channel.config().source != config.source;
                channel.reconfigure(config);
                AddOutcome::Updated { source_changed }
            }
            None => {
                self.channels
                    .insert(name.to_string(), Channel::new(name, config));
                AddOutcome::Inserted
            }
        }
    }

    /// Remove `name`. Unknown names are a no-op and return `None`.
    pub fn remove(&mut self, name: &str) -> Option<Channel> {
        self.channels.shift_remove(name)
    }

    /// Remove every channel, returning them in insertion order.
    pub fn clear(&mut self) -> Vec<Channel> {
        self.channels.drain(..).map(|(_, channel)| channel).collect()
    }

    /// All channels in insertion order.
    pub fn snapshot(&self) -> Vec<&Channel> {
        self.channels.values().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Record which source subscription feeds `name`.
    pub fn set_subscription(
        &mut self,
        name: &str,
        handle: Option<SubscriptionHandle>,
    ) -> Result<(), ForwarderError> {
        let channel = self
            .channels
            .get_mut(name)
            .ok_or_else(|| ForwarderError::UnknownChannel(name.to_string()))?;
        channel.subscription = handle;
        Ok(())
    }

    /// Apply one source event and return the records to publish.
    ///
    /// - Events for unregistered channels fail with `UnknownChannel`
    ///   (typically stale events from a just-removed subscription).
    /// - Events stamped with a subscription other than the channel's
    ///   current one are dropped, so a stopped and re-added channel never
    ///   sees values from its previous source.
    /// - The first value of a different kind marks the channel degraded
    ///   and fails with `TypeMismatch`; later wrong-kind values on a
    ///   degraded channel are dropped silently.
    /// - Connection changes produce a status record only on transition.
    pub fn process_event(
        &mut self,
        event: SourceEvent,
        now: Instant,
    ) -> Result<Vec<Record>, ForwarderError> {
        let channel = self
            .channels
            .get_mut(event.name())
            .ok_or_else(|| ForwarderError::UnknownChannel(event.name().to_string()))?;

        if let Some(from) = event.subscription() {
            if channel.subscription != Some(from) {
                debug!(channel = %event.name(), subscription = from.0, "dropping event from retired subscription");
                return Ok(Vec::new());
            }
        }

        match event {
            SourceEvent::ValueChanged {
                name,
                value,
                timestamp_ms,
                status,
                ..
            } => {
                let found = value.kind();
                if let Some(expected) = channel.kind {
                    if expected != found {
                        if channel.degraded {
                            debug!(channel = %name, %expected, %found, "dropping value on degraded channel");
                            return Ok(Vec::new());
                        }
                        channel.degraded = true;
                        return Err(ForwarderError::TypeMismatch {
                            channel: name,
                            expected,
                            found,
                        });
                    }
                } else {
                    channel.kind = Some(found);
                }

                channel.last_value = Some(value.clone());
                channel.last_status = status;
                channel.last_update_ms = Some(timestamp_ms);
                channel.last_update_at = Some(now);
                channel.idle.on_published(now);

                Ok(vec![Record::ValueUpdate(ValueUpdate {
                    source_name: name,
                    value,
                    timestamp_ms,
                    status,
                })])
            }
            SourceEvent::ConnectionChanged {
                name,
                state,
                timestamp_ms,
                ..
            } => {
                if channel.state == state {
                    return Ok(Vec::new());
                }

                let event = match (channel.state, state) {
                    (ConnectionState::Unknown, ConnectionState::Disconnected)
                        if channel.last_value.is_none() =>
                    {
                        StatusEvent::NeverConnected
                    }
                    (_, state) => StatusEvent::from(state),
                };
                channel.state = state;

                Ok(vec![Record::connection_status(name, event, timestamp_ms)])
            }
        }
    }

    /// Idle republishes due at `now`, stamped with `now_ms`.
    pub fn idle_updates(&mut self, now: Instant, now_ms: u64) -> Vec<Record> {
        let mut records = Vec::new();

        for channel in self.channels.values_mut() {
            if !channel.idle.is_due(now) {
                continue;
            }
            let Some(value) = channel.last_value.clone() else {
                continue;
            };

            channel.idle.on_forced(now);
            records.push(Record::ValueUpdate(ValueUpdate {
                source_name: channel.name().to_string(),
                value,
                timestamp_ms: now_ms,
                status: channel.last_status,
            }));
        }

        records
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::SourceKind;
    use crate::idle_policy::IdleConfig;
    use crate::value::{Scalar, Value, ValueKind};

    fn value_event(name: &str, value: Value, timestamp_ms: u64) -> SourceEvent {
        SourceEvent::ValueChanged {
            name: name.to_string(),
            subscription: None,
            value,
            timestamp_ms,
            status: None,
        }
    }

    fn connection_event(name: &str, state: ConnectionState) -> SourceEvent {
        SourceEvent::ConnectionChanged {
            name: name.to_string(),
            subscription: None,
            state,
            timestamp_ms: 1,
        }
    }

    fn idle_config(secs: u64) -> ChannelConfig {
        ChannelConfig {
            idle: IdleConfig {
                idle_period: Some(Duration::from_secs(secs)),
                update_period: Duration::ZERO,
            },
            ..ChannelConfig::default()
        }
    }

    #[test]
    fn add_existing_keeps_history() {
        let mut registry = Registry::new();
        let now = Instant::now();

        assert_eq!(registry.add("PV:A", ChannelConfig::default()), AddOutcome::Inserted);
        registry
            .process_event(value_event("PV:A", Value::double(1.5), 100), now)
            .unwrap();

        let outcome = registry.add("PV:A", idle_config(5));
        assert_eq!(outcome, AddOutcome::Updated { source_changed: false });

        let channel = registry.get("PV:A").unwrap();
        assert_eq!(channel.last_value(), Some(&Value::double(1.5)));
        assert_eq!(channel.last_update_ms(), Some(100));
        assert_eq!(channel.config().idle.idle_period, Some(Duration::from_secs(5)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn add_reports_source_change() {
        let mut registry = Registry::new();
        registry.add("PV:A", ChannelConfig::default());

        let fake = ChannelConfig {
            source: SourceKind::Fake { update_period: None },
            ..ChannelConfig::default()
        };
        assert_eq!(
            registry.add("PV:A", fake),
            AddOutcome::Updated { source_changed: true }
        );
    }

    #[test]
    fn remove_unknown_is_noop() {
        let mut registry = Registry::new();
        registry.add("PV:A", ChannelConfig::default());

        assert!(registry.remove("PV:B").is_none());
        assert_eq!(registry.names(), vec!["PV:A".to_string()]);
    }

    #[test]
    fn snapshot_is_insertion_ordered() {
        let mut registry = Registry::new();
        for name in ["c", "a", "b"] {
            registry.add(name, ChannelConfig::default());
        }
        registry.remove("a");
        registry.add("d", ChannelConfig::default());

        let names: Vec<&str> = registry.snapshot().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["c", "b", "d"]);
    }

    #[test]
    fn value_for_unknown_channel_is_rejected() {
        let mut registry = Registry::new();
        let err = registry
            .process_event(value_event("ghost", Value::double(0.0), 1), Instant::now())
            .unwrap_err();
        assert_eq!(err, ForwarderError::UnknownChannel("ghost".to_string()));
    }

    #[test]
    fn events_from_a_replaced_subscription_are_dropped() {
        let mut registry = Registry::new();
        let now = Instant::now();
        registry.add("PV:A", ChannelConfig::default());
        registry
            .set_subscription("PV:A", Some(SubscriptionHandle(2)))
            .unwrap();

        let stale = SourceEvent::ValueChanged {
            name: "PV:A".to_string(),
            subscription: Some(SubscriptionHandle(1)),
            value: Value::double(1.0),
            timestamp_ms: 1,
            status: None,
        };
        assert!(registry.process_event(stale, now).unwrap().is_empty());

        let stale_connect = SourceEvent::ConnectionChanged {
            name: "PV:A".to_string(),
            subscription: Some(SubscriptionHandle(1)),
            state: ConnectionState::Connected,
            timestamp_ms: 1,
        };
        assert!(registry.process_event(stale_connect, now).unwrap().is_empty());

        let channel = registry.get("PV:A").unwrap();
        assert_eq!(channel.kind(), None);
        assert_eq!(channel.state(), ConnectionState::Unknown);

        // The current subscription fixes the kind as usual.
        let current = SourceEvent::ValueChanged {
            name: "PV:A".to_string(),
            subscription: Some(SubscriptionHandle(2)),
            value: Value::Scalar(Scalar::Int32(4)),
            timestamp_ms: 2,
            status: None,
        };
        assert_eq!(registry.process_event(current, now).unwrap().len(), 1);
        assert_eq!(
            registry.get("PV:A").unwrap().kind(),
            Some(ValueKind::Scalar(crate::value::ScalarKind::Int32))
        );
    }

    #[test]
    fn type_change_degrades_channel_once() {
        let mut registry = Registry::new();
        let now = Instant::now();
        registry.add("PV:A", ChannelConfig::default());

        registry
            .process_event(value_event("PV:A", Value::double(1.0), 1), now)
            .unwrap();

        let err = registry
            .process_event(value_event("PV:A", Value::Scalar(Scalar::Int32(7)), 2), now)
            .unwrap_err();
        assert!(matches!(
            err,
            ForwarderError::TypeMismatch {
                expected: ValueKind::Scalar(_),
                ..
            }
        ));
        assert!(registry.get("PV:A").unwrap().is_degraded());

        // Second wrong-kind value: dropped, not re-reported.
        let records = registry
            .process_event(value_event("PV:A", Value::Scalar(Scalar::Int32(8)), 3), now)
            .unwrap();
        assert!(records.is_empty());

        // Values of the original kind still flow.
        let records = registry
            .process_event(value_event("PV:A", Value::double(2.0), 4), now)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(registry.get("PV:A").unwrap().last_value(), Some(&Value::double(2.0)));
    }

    #[test]
    fn connection_records_only_on_transition() {
        let mut registry = Registry::new();
        let now = Instant::now();
        registry.add("PV:A", ChannelConfig::default());

        let first = registry
            .process_event(connection_event("PV:A", ConnectionState::Connected), now)
            .unwrap();
        assert_eq!(first.len(), 1);

        let repeat = registry
            .process_event(connection_event("PV:A", ConnectionState::Connected), now)
            .unwrap();
        assert!(repeat.is_empty());

        let lost = registry
            .process_event(connection_event("PV:A", ConnectionState::Disconnected), now)
            .unwrap();
        assert_eq!(
            lost,
            vec![Record::connection_status("PV:A", StatusEvent::Disconnected, 1)]
        );
    }

    #[test]
    fn first_disconnect_without_value_is_never_connected() {
        let mut registry = Registry::new();
        registry.add("PV:A", ChannelConfig::default());

        let records = registry
            .process_event(
                connection_event("PV:A", ConnectionState::Disconnected),
                Instant::now(),
            )
            .unwrap();
        assert_eq!(
            records,
            vec![Record::connection_status("PV:A", StatusEvent::NeverConnected, 1)]
        );
    }

    #[test]
    fn idle_updates_republish_last_value() {
        let mut registry = Registry::new();
        let start = Instant::now();
        registry.add("with-value", idle_config(2));
        registry.add("no-value", idle_config(2));

        registry
            .process_event(value_event("with-value", Value::double(3.25), 10), start)
            .unwrap();

        assert!(registry.idle_updates(start + Duration::from_secs(1), 1_000).is_empty());

        let records = registry.idle_updates(start + Duration::from_secs(2), 2_000);
        assert_eq!(records, vec![Record::value_update("with-value", Value::double(3.25), 2_000)]);

        // Republishing does not count as a real update.
        assert_eq!(registry.get("with-value").unwrap().last_update_ms(), Some(10));
    }
}
