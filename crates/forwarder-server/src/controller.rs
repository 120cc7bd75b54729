//! Central controller loop.
//!
//! This task owns the `Registry`, the `SourceAdapter` and the `Publisher`
//! and is the only writer to any of them. It selects over:
//! - control inputs (commands from the command log, ctrl-c, fatal errors),
//! - source events from every subscription,
//! - the idle tick.
//!
//! Lifecycle: `Initializing -> Running -> Draining -> Stopped`, published
//! on a watch channel.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use forwarder_core::{
    AddOutcome, Channel, ChannelSpec, Command, ForwarderError, Record, Registry, SourceEvent,
    StatusEvent,
};

use crate::command_consumer::run_command_consumer;
use crate::config::{load_channel_file, Config};
use crate::provider::PvProvider;
use crate::publisher::Publisher;
use crate::readiness::{wait_until_broker_ready, wait_until_topic_ready};
use crate::source::SourceAdapter;
use crate::transport::{LogConsumer, SharedTransport};
use crate::types::{
    epoch_millis, ControlInput, ControlRx, ControlTx, ForwarderReport, ServiceState, StateTx,
};

/// Run the forwarder until `Exit`, a closed control channel, or a fatal
/// error. The state is `Stopped` when this returns, whatever the outcome.
pub async fn run_forwarder(
    config: Config,
    transport: SharedTransport,
    provider: Arc<dyn PvProvider>,
    control_tx: ControlTx,
    mut control_rx: ControlRx,
    state_tx: StateTx,
) -> Result<ForwarderReport, ForwarderError> {
    let result = run_to_completion(
        config,
        transport,
        provider,
        control_tx,
        &mut control_rx,
        &state_tx,
    )
    .await;

    state_tx.send_replace(ServiceState::Stopped);
    match &result {
        Ok(report) => info!(?report, "forwarder stopped"),
        Err(err) => error!(error = %err, "forwarder stopped with error"),
    }
    result
}

async fn run_to_completion(
    config: Config,
    transport: SharedTransport,
    provider: Arc<dyn PvProvider>,
    control_tx: ControlTx,
    control_rx: &mut ControlRx,
    state_tx: &StateTx,
) -> Result<ForwarderReport, ForwarderError> {
    let mut controller =
        Controller::initialize(config, transport, provider, control_tx, state_tx).await?;
    let outcome = controller.run_loop(control_rx).await;
    let report = controller.drain(state_tx).await;
    outcome.map(|()| report)
}

enum Step {
    Control(Option<ControlInput>),
    Event(SourceEvent),
    Tick,
}

struct Controller {
    config: Config,
    registry: Registry,
    source: SourceAdapter,
    publisher: Publisher,
    consumer_task: JoinHandle<()>,
}

impl Controller {
    async fn initialize(
        config: Config,
        transport: SharedTransport,
        provider: Arc<dyn PvProvider>,
        control_tx: ControlTx,
        state_tx: &StateTx,
    ) -> Result<Self, ForwarderError> {
        state_tx.send_replace(ServiceState::Initializing);
        info!(
            command_topic = %config.command_topic,
            data_topic = %config.data_topic,
            "forwarder initializing"
        );

        let policy = config.startup_policy();
        wait_until_broker_ready(&transport, policy).await?;
        wait_until_topic_ready(&transport, &config.command_topic, policy).await?;
        transport.create_topic(&config.data_topic, config.data_partitions)?;

        let initial = match &config.channels_file {
            Some(path) => {
                let specs = load_channel_file(path)?;
                info!(path = %path.display(), channels = specs.len(), "loaded channel file");
                specs
            }
            None => Vec::new(),
        };

        let consumer = LogConsumer::assign(
            transport.clone(),
            &config.command_topic,
            config.command_offset,
        )?;

        let publisher = Publisher::spawn(
            transport,
            config.data_topic.clone(),
            config.publisher_config(),
        );
        let source = SourceAdapter::new(provider, config.queue_capacity);

        let consumer_task = tokio::spawn(run_command_consumer(
            consumer,
            control_tx,
            config.command_poll_timeout,
            policy,
        ));

        let mut controller = Controller {
            config,
            registry: Registry::new(),
            source,
            publisher,
            consumer_task,
        };

        if !initial.is_empty() {
            controller.start_channels(initial);
        }

        state_tx.send_replace(ServiceState::Running);
        info!(channels = controller.registry.len(), "forwarder running");
        Ok(controller)
    }

    async fn run_loop(&mut self, control_rx: &mut ControlRx) -> Result<(), ForwarderError> {
        let mut ticker = tokio::time::interval(self.config.idle_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            let step = tokio::select! {
                input = control_rx.recv() => Step::Control(input),
                Some(event) = self.source.next_event() => Step::Event(event),
                _ = ticker.tick() => Step::Tick,
            };

            match step {
                Step::Control(None) => {
                    info!("control channel closed");
                    return Ok(());
                }
                Step::Control(Some(ControlInput::Command(Command::Exit))) => {
                    info!("exit requested");
                    return Ok(());
                }
                Step::Control(Some(ControlInput::Command(cmd))) => self.apply_command(cmd).await,
                Step::Control(Some(ControlInput::Fatal(err))) => {
                    error!(error = %err, "fatal error, draining");
                    return Err(err);
                }
                Step::Event(event) => self.handle_event(event).await,
                Step::Tick => self.publish_idle_updates().await,
            }
        }
    }

    async fn apply_command(&mut self, cmd: Command) {
        match cmd {
            Command::StartChannels(specs) => self.start_channels(specs),
            Command::StopChannels(names) => {
                for name in names {
                    match self.registry.remove(&name) {
                        Some(channel) => self.retire(channel).await,
                        None => debug!(channel = %name, "stop for channel that is not forwarded"),
                    }
                }
            }
            Command::StopAll => {
                let channels = self.registry.clear();
                info!(channels = channels.len(), "stopping all channels");
                for channel in channels {
                    self.retire(channel).await;
                }
            }
            // Handled by the loop.
            Command::Exit => {}
        }
    }

    fn start_channels(&mut self, specs: Vec<ChannelSpec>) {
        for ChannelSpec { name, config } in specs {
            let kind = config.source;
            let outcome = self.registry.add(&name, config);

            let resubscribe = match outcome {
                AddOutcome::Inserted => {
                    info!(channel = %name, ?kind, "channel started");
                    true
                }
                AddOutcome::Updated { source_changed } => {
                    info!(channel = %name, source_changed, "channel reconfigured");
                    if source_changed {
                        if let Some(old) = self.registry.get(&name).and_then(Channel::subscription) {
                            self.source.unsubscribe(old);
                        }
                    }
                    source_changed
                }
            };

            if resubscribe {
                let handle = self.source.subscribe(&name, &kind);
                if let Err(err) = self.registry.set_subscription(&name, Some(handle)) {
                    warn!(channel = %name, error = %err, "could not record subscription");
                    self.source.unsubscribe(handle);
                }
            }
        }
    }

    /// Tear down a channel that has already left the registry.
    async fn retire(&mut self, channel: Channel) {
        if let Some(handle) = channel.subscription() {
            self.source.unsubscribe(handle);
        }
        info!(channel = %channel.name(), "channel stopped");

        let record = Record::connection_status(channel.name(), StatusEvent::Destroyed, epoch_millis());
        self.publish(&record, channel.config().topic.as_deref()).await;
    }

    async fn handle_event(&mut self, event: SourceEvent) {
        let topic = self
            .registry
            .get(event.name())
            .and_then(|channel| channel.config().topic.clone());

        match self.registry.process_event(event, Instant::now()) {
            Ok(records) => {
                for record in records {
                    self.publish(&record, topic.as_deref()).await;
                }
            }
            Err(ForwarderError::UnknownChannel(name)) => {
                debug!(channel = %name, "dropping event for channel that is not forwarded");
            }
            Err(ForwarderError::TypeMismatch {
                channel,
                expected,
                found,
            }) => {
                warn!(%channel, %expected, %found, "type mismatch, channel degraded");
                let record =
                    Record::connection_status(channel, StatusEvent::TypeMismatch, epoch_millis());
                self.publish(&record, topic.as_deref()).await;
            }
            Err(err) => warn!(error = %err, "could not apply source event"),
        }
    }

    async fn publish_idle_updates(&mut self) {
        let records = self.registry.idle_updates(Instant::now(), epoch_millis());
        if records.is_empty() {
            return;
        }
        debug!(count = records.len(), "publishing idle updates");

        for record in records {
            let topic = self
                .registry
                .get(record.source_name())
                .and_then(|channel| channel.config().topic.clone());
            self.publish(&record, topic.as_deref()).await;
        }
    }

    async fn publish(&self, record: &Record, topic: Option<&str>) {
        // Delivery outcome is tracked by the publisher's stats.
        if let Err(err) = self.publisher.publish(record, topic).await {
            error!(channel = %record.source_name(), error = %err, "could not queue record");
        }
    }

    async fn drain(self, state_tx: &StateTx) -> ForwarderReport {
        state_tx.send_replace(ServiceState::Draining);
        info!(channels = self.registry.len(), "forwarder draining");

        let Controller {
            config,
            mut registry,
            mut source,
            publisher,
            consumer_task,
        } = self;

        consumer_task.abort();
        source.unsubscribe_all();
        registry.clear();

        let unacknowledged = publisher.flush(config.drain_timeout).await;
        let stats = if unacknowledged == 0 {
            publisher.close().await
        } else {
            warn!(unacknowledged, "drain timeout expired with records in flight");
            publisher.abort().await
        };

        ForwarderReport {
            published: stats.published,
            dropped: stats.dropped,
            unacknowledged,
        }
    }
}
