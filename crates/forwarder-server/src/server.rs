//! Top-level forwarder wiring.
//!
//! This module:
//! - creates the control and state channels,
//! - spawns the controller task (which spawns the command consumer,
//!   the publisher and the source subscriptions),
//! - hands back a [`ForwarderHandle`] to observe and steer it.
//!
//! [`join_or_interrupt`] waits for a forwarder to stop and turns ctrl-c
//! or SIGTERM into an `Exit` command.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use forwarder_core::{Command, ForwarderError};

use crate::config::Config;
use crate::controller::run_forwarder;
use crate::provider::PvProvider;
use crate::transport::SharedTransport;
use crate::types::{ControlInput, ControlTx, ForwarderReport, ServiceState, StateRx};

/// Handle to a running forwarder.
pub struct ForwarderHandle {
    state: StateRx,
    control: ControlTx,
    join: JoinHandle<Result<ForwarderReport, ForwarderError>>,
}

impl ForwarderHandle {
    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// A receiver that follows the lifecycle.
    pub fn subscribe_state(&self) -> StateRx {
        self.state.clone()
    }

    /// Wait until the forwarder reaches `target`. Fails if it stops first.
    pub async fn wait_for_state(&mut self, target: ServiceState) -> Result<(), ForwarderError> {
        let reached = self
            .state
            .wait_for(|s| *s == target || *s == ServiceState::Stopped)
            .await
            .map_err(|_| ForwarderError::Internal("forwarder state channel closed".to_string()))?;

        if *reached == target {
            Ok(())
        } else {
            Err(ForwarderError::Internal(format!(
                "forwarder stopped before reaching {target}"
            )))
        }
    }

    /// Inject a command directly, bypassing the command log.
    pub async fn send(&self, cmd: Command) -> Result<(), ForwarderError> {
        self.control
            .send(ControlInput::Command(cmd))
            .await
            .map_err(|_| ForwarderError::Internal("forwarder is not running".to_string()))
    }

    /// Wait for the forwarder to stop.
    pub async fn join(self) -> Result<ForwarderReport, ForwarderError> {
        let ForwarderHandle { control, join, .. } = self;
        drop(control);
        join.await
            .map_err(|e| ForwarderError::Internal(format!("forwarder task failed: {e}")))?
    }
}

/// Spawn the forwarder on the current runtime.
pub fn spawn(
    config: Config,
    transport: SharedTransport,
    provider: Arc<dyn PvProvider>,
) -> ForwarderHandle {
    let (control_tx, control_rx) = mpsc::channel(config.queue_capacity.max(1));
    let (state_tx, state_rx) = watch::channel(ServiceState::Initializing);

    let join = tokio::spawn(run_forwarder(
        config,
        transport,
        provider,
        control_tx.clone(),
        control_rx,
        state_tx,
    ));

    ForwarderHandle {
        state: state_rx,
        control: control_tx,
        join,
    }
}

/// Wait for `handle` to stop, turning ctrl-c or SIGTERM into an `Exit`
/// command.
pub async fn join_or_interrupt(handle: ForwarderHandle) -> Result<ForwarderReport, ForwarderError> {
    join_until(handle, shutdown_signal()).await
}

/// Wait for `handle` to stop. When `shutdown` completes first the
/// forwarder is told to exit and drains as usual.
pub async fn join_until<F>(
    handle: ForwarderHandle,
    shutdown: F,
) -> Result<ForwarderReport, ForwarderError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let signal_tx = handle.control.clone();

    let signal_task = tokio::spawn(async move {
        shutdown.await;
        info!("shutdown requested, draining");
        let _ = signal_tx.send(ControlInput::Command(Command::Exit)).await;
    });

    let result = handle.join().await;
    signal_task.abort();
    result
}

/// Completes on ctrl-c, or on SIGTERM where available.
///
/// A signal that cannot be registered is logged and never fires.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("interrupt received"),
        _ = terminate => info!("SIGTERM received"),
    }
}
