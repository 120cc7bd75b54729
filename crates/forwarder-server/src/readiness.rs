//! Startup readiness waits: bounded attempts with a fixed backoff.

use std::time::Duration;

use tracing::{info, warn};

use forwarder_core::ForwarderError;

use crate::transport::{SharedTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 10,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Wait until the broker answers at all.
pub async fn wait_until_broker_ready(
    transport: &SharedTransport,
    policy: RetryPolicy,
) -> Result<(), ForwarderError> {
    // Any topic name works as a probe; only reachability matters here.
    retry(policy, "broker", || transport.topic_exists("__probe").map(|_| true)).await
}

/// Wait until `topic` exists.
pub async fn wait_until_topic_ready(
    transport: &SharedTransport,
    topic: &str,
    policy: RetryPolicy,
) -> Result<(), ForwarderError> {
    retry(policy, topic, || transport.topic_exists(topic)).await
}

async fn retry<F>(policy: RetryPolicy, what: &str, mut check: F) -> Result<(), ForwarderError>
where
    F: FnMut() -> Result<bool, TransportError>,
{
    let attempts = policy.attempts.max(1);
    let mut last = String::from("not ready");

    for attempt in 1..=attempts {
        match check() {
            Ok(true) => {
                info!(target_name = what, attempt, "ready");
                return Ok(());
            }
            Ok(false) => last = format!("{what} does not exist yet"),
            Err(err) => last = err.to_string(),
        }

        if attempt < attempts {
            warn!(target_name = what, attempt, reason = %last, "not ready, retrying");
            tokio::time::sleep(policy.backoff).await;
        }
    }

    Err(ForwarderError::Transport(format!(
        "{what} not ready after {attempts} attempts: {last}"
    )))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::transport::{LogTransport, MemoryBroker};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_broker_fails_after_budget() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_available(false);
        let transport: SharedTransport = broker;

        let start = tokio::time::Instant::now();
        let err = wait_until_broker_ready(&transport, policy()).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn topic_appearing_later_is_picked_up() {
        let broker = Arc::new(MemoryBroker::new());
        let transport: SharedTransport = broker.clone();

        let creator = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            creator.create_topic("cmds", 1).unwrap();
        });

        wait_until_topic_ready(&transport, "cmds", policy()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn missing_topic_is_a_transport_error() {
        let transport: SharedTransport = Arc::new(MemoryBroker::new());
        let err = wait_until_topic_ready(&transport, "cmds", policy()).await.unwrap_err();
        assert!(matches!(err, ForwarderError::Transport(msg) if msg.contains("cmds")));
    }
}
