//! Command-log consumer.
//!
//! Polls the command topic, parses each payload and forwards the result
//! to the controller. Malformed payloads are logged and skipped. Transport
//! failures are retried per the readiness policy; when that budget is
//! spent the controller receives `ControlInput::Fatal`.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use forwarder_core::{Command, ForwarderError};
use forwarder_protocol::parse_command;

use crate::readiness::RetryPolicy;
use crate::transport::LogConsumer;
use crate::types::{ControlInput, ControlTx};

/// Run until `Exit` is seen, the controller goes away, or the transport
/// fails for good.
pub async fn run_command_consumer(
    mut consumer: LogConsumer,
    control_tx: ControlTx,
    poll_timeout: Duration,
    retry: RetryPolicy,
) {
    let mut failures = 0u32;

    loop {
        let msg = match consumer.poll(poll_timeout).await {
            Ok(Some(msg)) => {
                failures = 0;
                msg
            }
            Ok(None) => {
                failures = 0;
                if control_tx.is_closed() {
                    break;
                }
                continue;
            }
            Err(err) => {
                failures += 1;
                if failures >= retry.attempts.max(1) {
                    error!(topic = consumer.topic(), error = %err, "command log unavailable, giving up");
                    let _ = control_tx
                        .send(ControlInput::Fatal(ForwarderError::from(err)))
                        .await;
                    break;
                }
                warn!(topic = consumer.topic(), attempt = failures, error = %err, "command poll failed");
                tokio::time::sleep(retry.backoff).await;
                continue;
            }
        };

        let cmd = match parse_command(&msg.payload) {
            Ok(cmd) => cmd,
            Err(err) => {
                warn!(
                    partition = msg.partition,
                    offset = msg.offset,
                    error = %err,
                    "skipping malformed command"
                );
                continue;
            }
        };

        debug!(partition = msg.partition, offset = msg.offset, ?cmd, "command received");
        let is_exit = cmd == Command::Exit;

        if control_tx.send(ControlInput::Command(cmd)).await.is_err() {
            info!("controller gone, command consumer stopping");
            break;
        }
        if is_exit {
            break;
        }
    }

    debug!("command consumer shutting down");
}
