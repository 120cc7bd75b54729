//! Log transport: the partitioned, append-only broker the forwarder reads
//! commands from and publishes records to.
//!
//! The forwarder only needs a handful of primitives, captured by
//! [`LogTransport`]. [`MemoryBroker`] implements them in-process and is
//! what the binary and the tests run against. [`LogConsumer`] builds
//! polling on top of any transport.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

use forwarder_core::ForwarderError;

use crate::types::epoch_millis;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("broker unreachable")]
    Unreachable,

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("unknown partition {partition} of topic {topic}")]
    UnknownPartition { topic: String, partition: u32 },
}

impl From<TransportError> for ForwarderError {
    fn from(err: TransportError) -> Self {
        ForwarderError::Transport(err.to_string())
    }
}

/// One message as stored in a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub timestamp_ms: u64,
}

/// Low / high offsets of a partition (`high` is the next offset to be written).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub low: u64,
    pub high: u64,
}

impl Watermarks {
    pub fn available(&self) -> u64 {
        self.high - self.low
    }
}

/// Acknowledgement of a produced message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    pub partition: u32,
    pub offset: u64,
}

/// Broker primitives used by the forwarder.
pub trait LogTransport: Send + Sync {
    /// Create `topic` if missing. Existing topics are left as they are.
    fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), TransportError>;

    fn topic_exists(&self, topic: &str) -> Result<bool, TransportError>;

    fn partition_count(&self, topic: &str) -> Result<u32, TransportError>;

    /// Append a message; keyed messages always land on the same partition.
    fn produce(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: &[u8],
    ) -> Result<Delivered, TransportError>;

    /// Up to `max` messages of one partition starting at `offset`.
    fn fetch(
        &self,
        topic: &str,
        partition: u32,
        offset: u64,
        max: usize,
    ) -> Result<Vec<LogMessage>, TransportError>;

    fn watermarks(&self, topic: &str, partition: u32) -> Result<Watermarks, TransportError>;

    /// Notified whenever anything is produced.
    fn notifier(&self) -> Arc<Notify>;
}

pub type SharedTransport = Arc<dyn LogTransport>;

// ============================================================================
// In-memory broker
// ============================================================================

type Partitions = Vec<Vec<LogMessage>>;

/// In-process broker.
///
/// Topics are auto-created on first produce with `default_partitions`.
/// `set_available(false)` makes every call fail with `Unreachable`,
/// which is how tests simulate a broker outage.
#[derive(Debug)]
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, Partitions>>,
    default_partitions: u32,
    available: AtomicBool,
    round_robin: AtomicU32,
    notify: Arc<Notify>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        MemoryBroker::with_default_partitions(1)
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker::default()
    }

    pub fn with_default_partitions(partitions: u32) -> Self {
        MemoryBroker {
            topics: Mutex::new(HashMap::new()),
            default_partitions: partitions.max(1),
            available: AtomicBool::new(true),
            round_robin: AtomicU32::new(0),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), TransportError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Unreachable)
        }
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, Partitions>> {
        // A panic while holding the lock cannot leave a partition half-written.
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn partition_for(&self, key: Option<&[u8]>, partitions: u32) -> u32 {
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % partitions as u64) as u32
            }
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % partitions,
        }
    }
}

impl LogTransport for MemoryBroker {
    fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), TransportError> {
        self.check_available()?;
        self.topics()
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1) as usize]);
        Ok(())
    }

    fn topic_exists(&self, topic: &str) -> Result<bool, TransportError> {
        self.check_available()?;
        Ok(self.topics().contains_key(topic))
    }

    fn partition_count(&self, topic: &str) -> Result<u32, TransportError> {
        self.check_available()?;
        self.topics()
            .get(topic)
            .map(|parts| parts.len() as u32)
            .ok_or_else(|| TransportError::UnknownTopic(topic.to_string()))
    }

    fn produce(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: &[u8],
    ) -> Result<Delivered, TransportError> {
        self.check_available()?;

        let delivered = {
            let mut topics = self.topics();
            let parts = topics
                .entry(topic.to_string())
                .or_insert_with(|| vec![Vec::new(); self.default_partitions as usize]);

            let partition = self.partition_for(key, parts.len() as u32);
            let log = &mut parts[partition as usize];
            let offset = log.len() as u64;
            log.push(LogMessage {
                topic: topic.to_string(),
                partition,
                offset,
                key: key.map(Bytes::copy_from_slice),
                payload: Bytes::copy_from_slice(payload),
                timestamp_ms: epoch_millis(),
            });
            Delivered { partition, offset }
        };

        self.notify.notify_waiters();
        Ok(delivered)
    }

    fn fetch(
        &self,
        topic: &str,
        partition: u32,
        offset: u64,
        max: usize,
    ) -> Result<Vec<LogMessage>, TransportError> {
        self.check_available()?;

        let topics = self.topics();
        let parts = topics
            .get(topic)
            .ok_or_else(|| TransportError::UnknownTopic(topic.to_string()))?;
        let log = parts
            .get(partition as usize)
            .ok_or_else(|| TransportError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })?;

        let start = (offset as usize).min(log.len());
        let end = start.saturating_add(max).min(log.len());
        Ok(log[start..end].to_vec())
    }

    fn watermarks(&self, topic: &str, partition: u32) -> Result<Watermarks, TransportError> {
        self.check_available()?;

        let topics = self.topics();
        let log = topics
            .get(topic)
            .and_then(|parts| parts.get(partition as usize))
            .ok_or_else(|| TransportError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })?;

        Ok(Watermarks {
            low: 0,
            high: log.len() as u64,
        })
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Where a new consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    Earliest,
    Latest,
}

impl FromStr for StartOffset {
    type Err = ForwarderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" => Ok(StartOffset::Earliest),
            "latest" => Ok(StartOffset::Latest),
            other => Err(ForwarderError::Config(format!(
                "start offset must be earliest or latest, got {other:?}"
            ))),
        }
    }
}

const FETCH_BATCH: usize = 64;

/// A consumer assigned to every partition of one topic.
pub struct LogConsumer {
    transport: SharedTransport,
    topic: String,
    positions: Vec<u64>,
    next_partition: usize,
    buffered: VecDeque<LogMessage>,
}

impl LogConsumer {
    /// Assign all partitions of `topic`, positioned per `start`.
    pub fn assign(
        transport: SharedTransport,
        topic: &str,
        start: StartOffset,
    ) -> Result<Self, TransportError> {
        let partitions = transport.partition_count(topic)?;
        let positions = (0..partitions)
            .map(|p| {
                let marks = transport.watermarks(topic, p)?;
                Ok(match start {
                    StartOffset::Earliest => marks.low,
                    StartOffset::Latest => marks.high,
                })
            })
            .collect::<Result<Vec<_>, TransportError>>()?;

        Ok(LogConsumer {
            transport,
            topic: topic.to_string(),
            positions,
            next_partition: 0,
            buffered: VecDeque::new(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next offset to be read from `partition`.
    pub fn position(&self, partition: u32) -> Option<u64> {
        self.positions.get(partition as usize).copied()
    }

    /// Next message if one is already available; never waits.
    pub fn try_poll(&mut self) -> Result<Option<LogMessage>, TransportError> {
        if let Some(msg) = self.buffered.pop_front() {
            return Ok(Some(msg));
        }

        for _ in 0..self.positions.len() {
            let partition = self.next_partition;
            self.next_partition = (self.next_partition + 1) % self.positions.len();

            let batch = self.transport.fetch(
                &self.topic,
                partition as u32,
                self.positions[partition],
                FETCH_BATCH,
            )?;
            if let Some(last) = batch.last() {
                self.positions[partition] = last.offset + 1;
                self.buffered.extend(batch);
                return Ok(self.buffered.pop_front());
            }
        }

        Ok(None)
    }

    /// Wait up to `timeout` for the next message.
    pub async fn poll(&mut self, timeout: Duration) -> Result<Option<LogMessage>, TransportError> {
        let deadline = Instant::now() + timeout;
        let notify = self.transport.notifier();

        loop {
            // Register for wakeups before looking, so a produce in between is not missed.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(msg) = self.try_poll()? {
                return Ok(Some(msg));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_poll();
            }
        }
    }

    /// Everything currently between this consumer's positions and the
    /// high watermarks.
    pub fn drain_available(&mut self) -> Result<Vec<LogMessage>, TransportError> {
        let mut messages: Vec<LogMessage> = self.buffered.drain(..).collect();
        while let Some(msg) = self.try_poll()? {
            messages.push(msg);
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(partitions: u32) -> Arc<MemoryBroker> {
        Arc::new(MemoryBroker::with_default_partitions(partitions))
    }

    #[test]
    fn keyed_messages_stay_on_one_partition() {
        let broker = broker(4);
        broker.create_topic("data", 4).unwrap();

        let first = broker.produce("data", Some(b"PV:A"), b"1").unwrap();
        for i in 0..20u8 {
            let d = broker.produce("data", Some(b"PV:A"), &[i]).unwrap();
            assert_eq!(d.partition, first.partition);
        }
        let marks = broker.watermarks("data", first.partition).unwrap();
        assert_eq!(marks.available(), 21);
    }

    #[test]
    fn unavailable_broker_fails_every_call() {
        let broker = broker(1);
        broker.create_topic("data", 1).unwrap();
        broker.set_available(false);

        assert_eq!(broker.produce("data", None, b"x"), Err(TransportError::Unreachable));
        assert_eq!(broker.topic_exists("data"), Err(TransportError::Unreachable));

        broker.set_available(true);
        assert_eq!(broker.topic_exists("data"), Ok(true));
    }

    #[test]
    fn latest_consumer_skips_existing_messages() {
        let broker = broker(1);
        broker.produce("cmds", None, b"old").unwrap();

        let transport: SharedTransport = broker.clone();
        let mut latest = LogConsumer::assign(transport.clone(), "cmds", StartOffset::Latest).unwrap();
        let mut earliest = LogConsumer::assign(transport, "cmds", StartOffset::Earliest).unwrap();

        broker.produce("cmds", None, b"new").unwrap();

        let got: Vec<Bytes> = latest.drain_available().unwrap().into_iter().map(|m| m.payload).collect();
        assert_eq!(got, vec![Bytes::from_static(b"new")]);
        assert_eq!(earliest.drain_available().unwrap().len(), 2);
    }

    #[test]
    fn assign_to_missing_topic_fails() {
        let transport: SharedTransport = broker(1);
        let err = LogConsumer::assign(transport, "nope", StartOffset::Earliest).err();
        assert_eq!(err, Some(TransportError::UnknownTopic("nope".to_string())));
    }

    #[tokio::test]
    async fn poll_wakes_on_produce() {
        let broker = broker(2);
        broker.create_topic("data", 2).unwrap();
        let transport: SharedTransport = broker.clone();
        let mut consumer = LogConsumer::assign(transport, "data", StartOffset::Earliest).unwrap();

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.produce("data", Some(b"k"), b"hello").unwrap();
        });

        let msg = consumer.poll(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(msg.payload, Bytes::from_static(b"hello"));
        assert_eq!(msg.key, Some(Bytes::from_static(b"k")));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_times_out_when_nothing_arrives() {
        let broker = broker(1);
        broker.create_topic("data", 1).unwrap();
        let transport: SharedTransport = broker;
        let mut consumer = LogConsumer::assign(transport, "data", StartOffset::Earliest).unwrap();

        assert_eq!(consumer.poll(Duration::from_millis(500)).await.unwrap(), None);
    }

    #[test]
    fn start_offset_parses() {
        assert_eq!("Earliest".parse::<StartOffset>().unwrap(), StartOffset::Earliest);
        assert_eq!(" latest ".parse::<StartOffset>().unwrap(), StartOffset::Latest);
        assert!("middle".parse::<StartOffset>().is_err());
    }
}
