//! Forwarding publisher.
//!
//! Records are encoded on the caller's side and handed, in call order, to
//! a single delivery task over a bounded queue. One delivery task means
//! records for the same channel reach the transport in the order they
//! were published.
//!
//! Each record is retried with a fixed backoff up to `retry_budget` extra
//! attempts. A record that still fails is dropped and logged; the
//! forwarder keeps going.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use forwarder_core::{ForwarderError, Record};
use forwarder_protocol::encode_to_vec;

use crate::transport::{Delivered, SharedTransport};

#[derive(Debug, Clone, Copy)]
pub struct PublisherConfig {
    /// Extra attempts after the first failed produce.
    pub retry_budget: u32,
    pub retry_backoff: Duration,
    pub queue_capacity: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        PublisherConfig {
            retry_budget: 3,
            retry_backoff: Duration::from_millis(100),
            queue_capacity: 1024,
        }
    }
}

/// Resolves once the transport acknowledged the record or it was dropped.
pub type DeliveryFuture = oneshot::Receiver<Result<Delivered, ForwarderError>>;

/// Snapshot of publisher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub published: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Shared {
    published: AtomicU64,
    dropped: AtomicU64,
    outstanding: AtomicUsize,
    settled: Notify,
}

impl Shared {
    fn settle_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.settled.notify_waiters();
        }
    }
}

#[derive(Debug)]
struct Delivery {
    topic: String,
    key: String,
    payload: Vec<u8>,
    ack: oneshot::Sender<Result<Delivered, ForwarderError>>,
}

pub struct Publisher {
    tx: mpsc::Sender<Delivery>,
    shared: Arc<Shared>,
    default_topic: String,
    task: JoinHandle<()>,
}

impl Publisher {
    /// Spawn the delivery task. `default_topic` is used for records
    /// published without a topic override.
    pub fn spawn(
        transport: SharedTransport,
        default_topic: impl Into<String>,
        config: PublisherConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shared = Arc::new(Shared::default());
        let task = tokio::spawn(run_delivery_loop(transport, rx, shared.clone(), config));

        Publisher {
            tx,
            shared,
            default_topic: default_topic.into(),
            task,
        }
    }

    pub fn default_topic(&self) -> &str {
        &self.default_topic
    }

    /// Encode `record` and queue it for delivery, keyed by its channel.
    ///
    /// Waits for queue space when the delivery task is behind.
    pub async fn publish(
        &self,
        record: &Record,
        topic: Option<&str>,
    ) -> Result<DeliveryFuture, ForwarderError> {
        let payload = encode_to_vec(record)?;
        let (ack, delivery) = oneshot::channel();

        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        let sent = self
            .tx
            .send(Delivery {
                topic: topic.unwrap_or(&self.default_topic).to_string(),
                key: record.source_name().to_string(),
                payload,
                ack,
            })
            .await;

        if sent.is_err() {
            self.shared.settle_one();
            return Err(ForwarderError::Internal("publisher task has stopped".to_string()));
        }
        Ok(delivery)
    }

    /// Records queued or in flight.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PublishStats {
        PublishStats {
            published: self.shared.published.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }

    /// Wait until everything queued so far is settled, or `timeout`
    /// passes. Returns the number of records still unacknowledged.
    pub async fn flush(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;

        loop {
            let settled = self.shared.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            let outstanding = self.outstanding();
            if outstanding == 0 {
                return 0;
            }
            if tokio::time::timeout_at(deadline, settled).await.is_err() {
                let left = self.outstanding();
                warn!(unacknowledged = left, "flush timed out");
                return left;
            }
        }
    }

    /// Stop accepting records and wait for the delivery task to finish
    /// what is already queued.
    pub async fn close(self) -> PublishStats {
        let Publisher {
            tx, shared, task, ..
        } = self;
        drop(tx);
        if let Err(err) = task.await {
            error!(error = %err, "publisher task failed");
        }
        PublishStats {
            published: shared.published.load(Ordering::Relaxed),
            dropped: shared.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop the delivery task without waiting for queued records.
    pub async fn abort(self) -> PublishStats {
        let Publisher { shared, task, .. } = self;
        task.abort();
        // Cancellation is the expected outcome here.
        let _ = task.await;
        PublishStats {
            published: shared.published.load(Ordering::Relaxed),
            dropped: shared.dropped.load(Ordering::Relaxed),
        }
    }
}

async fn run_delivery_loop(
    transport: SharedTransport,
    mut rx: mpsc::Receiver<Delivery>,
    shared: Arc<Shared>,
    config: PublisherConfig,
) {
    while let Some(delivery) = rx.recv().await {
        let result = deliver(&transport, &delivery, &config).await;

        match &result {
            Ok(delivered) => {
                shared.published.fetch_add(1, Ordering::Relaxed);
                debug!(
                    channel = %delivery.key,
                    topic = %delivery.topic,
                    partition = delivered.partition,
                    offset = delivered.offset,
                    "record delivered"
                );
            }
            Err(err) => {
                shared.dropped.fetch_add(1, Ordering::Relaxed);
                error!(
                    channel = %delivery.key,
                    topic = %delivery.topic,
                    error = %err,
                    "dropping record after exhausting retries"
                );
            }
        }

        // The caller may have dropped the future; that is fine.
        let _ = delivery.ack.send(result);
        shared.settle_one();
    }

    debug!("delivery loop shutting down (queue closed)");
}

async fn deliver(
    transport: &SharedTransport,
    delivery: &Delivery,
    config: &PublisherConfig,
) -> Result<Delivered, ForwarderError> {
    let mut attempt = 0u32;
    loop {
        match transport.produce(&delivery.topic, Some(delivery.key.as_bytes()), &delivery.payload) {
            Ok(delivered) => return Ok(delivered),
            Err(err) if attempt < config.retry_budget => {
                attempt += 1;
                warn!(
                    channel = %delivery.key,
                    attempt,
                    error = %err,
                    "produce failed, retrying"
                );
                tokio::time::sleep(config.retry_backoff).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LogTransport, MemoryBroker};
    use forwarder_core::Value;
    use forwarder_protocol::decode;

    fn setup() -> (Arc<MemoryBroker>, Publisher) {
        let broker = Arc::new(MemoryBroker::new());
        broker.create_topic("data", 1).unwrap();
        let publisher = Publisher::spawn(broker.clone(), "data", PublisherConfig::default());
        (broker, publisher)
    }

    #[tokio::test]
    async fn publish_is_acknowledged_in_order() {
        let (broker, publisher) = setup();

        let mut futures = Vec::new();
        for i in 0..5 {
            let record = Record::value_update("PV:A", Value::double(i as f64), i);
            futures.push(publisher.publish(&record, None).await.unwrap());
        }

        let mut offsets = Vec::new();
        for f in futures {
            offsets.push(f.await.unwrap().unwrap().offset);
        }
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);

        let stored = broker.fetch("data", 0, 0, 10).unwrap();
        let values: Vec<f64> = stored
            .iter()
            .map(|m| decode(&m.payload).unwrap().as_value_update().unwrap().value.as_double().unwrap())
            .collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(stored[0].key.as_deref(), Some(&b"PV:A"[..]));
    }

    #[tokio::test]
    async fn topic_override_is_honoured() {
        let (broker, publisher) = setup();
        let record = Record::value_update("PV:B", Value::double(1.0), 1);

        publisher.publish(&record, Some("other")).await.unwrap().await.unwrap().unwrap();

        assert_eq!(broker.topic_exists("other"), Ok(true));
        assert_eq!(broker.watermarks("data", 0).unwrap().high, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_record_is_dropped_after_retries() {
        let (broker, publisher) = setup();
        broker.set_available(false);

        let record = Record::value_update("PV:C", Value::double(1.0), 1);
        let result = publisher.publish(&record, None).await.unwrap().await.unwrap();
        assert!(matches!(result, Err(ForwarderError::Transport(_))));
        assert_eq!(publisher.stats(), PublishStats { published: 0, dropped: 1 });

        broker.set_available(true);
        let ok = publisher.publish(&record, None).await.unwrap().await.unwrap();
        assert!(ok.is_ok());
        assert_eq!(publisher.stats().published, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn record_succeeds_when_broker_recovers_within_budget() {
        let (broker, publisher) = setup();
        broker.set_available(false);

        let record = Record::value_update("PV:D", Value::double(1.0), 1);
        let delivery = publisher.publish(&record, None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        broker.set_available(true);

        assert!(delivery.await.unwrap().is_ok());
        assert_eq!(publisher.stats().dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_reports_unacknowledged_on_timeout() {
        let (broker, publisher) = setup();
        broker.set_available(false);

        let record = Record::value_update("PV:E", Value::double(1.0), 1);
        let _delivery = publisher.publish(&record, None).await.unwrap();

        assert_eq!(publisher.flush(Duration::from_millis(10)).await, 1);
        assert_eq!(publisher.flush(Duration::from_secs(5)).await, 0);
        assert_eq!(publisher.stats().dropped, 1);
    }

    #[tokio::test]
    async fn close_returns_final_stats() {
        let (_broker, publisher) = setup();
        let record = Record::value_update("PV:F", Value::double(1.0), 1);
        publisher.publish(&record, None).await.unwrap();
        publisher.publish(&record, None).await.unwrap();

        let stats = publisher.close().await;
        assert_eq!(stats, PublishStats { published: 2, dropped: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn abort_gives_up_on_queued_records() {
        let (broker, publisher) = setup();
        broker.set_available(false);
        let record = Record::value_update("PV:G", Value::double(1.0), 1);
        let delivery = publisher.publish(&record, None).await.unwrap();

        let stats = publisher.abort().await;
        assert_eq!(stats, PublishStats::default());
        assert!(delivery.await.is_err());
    }
}
