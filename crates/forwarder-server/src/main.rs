//! PV forwarder binary.
//!
//! Runs the forwarder against an in-process broker and a loopback PV
//! provider. Commands come from `--command-file` (JSON, one per line),
//! which is fed into the command topic once the forwarder is running.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use forwarder_core::Value;
use forwarder_server::config::Config;
use forwarder_server::provider::LoopbackProvider;
use forwarder_server::transport::{LogTransport, MemoryBroker, SharedTransport};
use forwarder_server::{server, ServiceState};

#[derive(Debug, Parser)]
#[command(name = "pv-forwarder", about = "Forward PV updates to a data log")]
struct Cli {
    /// Command topic (overrides FORWARDER_COMMAND_TOPIC).
    #[arg(long)]
    command_topic: Option<String>,

    /// Default data topic (overrides FORWARDER_DATA_TOPIC).
    #[arg(long)]
    data_topic: Option<String>,

    /// Static channel file (TOML, `[[channel]]` tables).
    #[arg(long)]
    channels: Option<PathBuf>,

    /// JSON commands, one per line, published to the command topic at startup.
    #[arg(long)]
    command_file: Option<PathBuf>,

    /// Loopback PV to declare, as NAME=VALUE (VALUE parsed as a double).
    #[arg(long = "pv", value_name = "NAME=VALUE")]
    pvs: Vec<String>,

    /// Idle-update tick in milliseconds.
    #[arg(long)]
    idle_tick_ms: Option<u64>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let mut config = Config::from_env()?;
    if let Some(topic) = &cli.command_topic {
        config.command_topic = topic.clone();
    }
    if let Some(topic) = &cli.data_topic {
        config.data_topic = topic.clone();
    }
    if let Some(path) = &cli.channels {
        config.channels_file = Some(path.clone());
    }
    if let Some(ms) = cli.idle_tick_ms {
        if ms == 0 {
            bail!("--idle-tick-ms must be positive");
        }
        config.idle_tick = Duration::from_millis(ms);
    }

    let provider = Arc::new(LoopbackProvider::new());
    for pv in &cli.pvs {
        let (name, value) = parse_pv(pv)?;
        provider.add_pv(name, value);
    }

    let broker = Arc::new(MemoryBroker::new());
    broker.create_topic(&config.command_topic, 1)?;
    let transport: SharedTransport = broker.clone();

    let commands = match &cli.command_file {
        Some(path) => read_command_lines(path)?,
        None => Vec::new(),
    };

    info!(
        command_topic = %config.command_topic,
        data_topic = %config.data_topic,
        "starting pv-forwarder"
    );

    let command_topic = config.command_topic.clone();
    let mut handle = server::spawn(config, transport, provider);

    if !commands.is_empty() {
        handle.wait_for_state(ServiceState::Running).await?;
        for line in &commands {
            broker.produce(&command_topic, None, line.as_bytes())?;
        }
        info!(count = commands.len(), "queued startup commands");
    }

    let report = server::join_or_interrupt(handle).await?;
    info!(
        published = report.published,
        dropped = report.dropped,
        unacknowledged = report.unacknowledged,
        "pv-forwarder finished"
    );

    Ok(())
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .init();
}

fn parse_pv(arg: &str) -> anyhow::Result<(&str, Value)> {
    let (name, value) = arg
        .split_once('=')
        .with_context(|| format!("--pv expects NAME=VALUE, got {arg:?}"))?;
    let value: f64 = value
        .trim()
        .parse()
        .with_context(|| format!("--pv {name}: value is not a number"))?;
    Ok((name.trim(), Value::double(value)))
}

fn read_command_lines(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading command file {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
