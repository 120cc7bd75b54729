//! Configuration for the forwarder service.
//!
//! Use defaults or override via environment variables:
//!
//! - `FORWARDER_COMMAND_TOPIC`       (default: "TEST_forwarderConfig")
//! - `FORWARDER_DATA_TOPIC`          (default: "TEST_forwarderData")
//! - `FORWARDER_DATA_PARTITIONS`     (default: "1")
//! - `FORWARDER_COMMAND_OFFSET`      (default: "latest")
//! - `FORWARDER_IDLE_TICK_MS`        (default: "1000")
//! - `FORWARDER_QUEUE_CAPACITY`      (default: "1024")
//! - `FORWARDER_RETRY_BUDGET`        (default: "3")
//! - `FORWARDER_RETRY_BACKOFF_MS`    (default: "100")
//! - `FORWARDER_STARTUP_ATTEMPTS`    (default: "10")
//! - `FORWARDER_STARTUP_BACKOFF_MS`  (default: "500")
//! - `FORWARDER_DRAIN_TIMEOUT_MS`    (default: "5000")
//! - `FORWARDER_COMMAND_POLL_MS`     (default: "200")
//! - `FORWARDER_CHANNELS_FILE`       (default: unset)
//!
//! The optional channel file is TOML with one `[[channel]]` table per
//! stream, using the same fields as an `add` command stream:
//!
//! ```toml
//! [[channel]]
//! channel = "SIM:Temp"
//! idle_period_ms = 2000
//!
//! [[channel]]
//! channel = "FakePV"
//! source = "fake"
//! fake_period_ms = 100
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use forwarder_core::{ChannelSpec, ForwarderError, DEFAULT_IDLE_TICK};
use forwarder_protocol::StreamConfig;

use crate::publisher::PublisherConfig;
use crate::readiness::RetryPolicy;
use crate::transport::StartOffset;

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Topic carrying JSON commands.
    pub command_topic: String,

    /// Default topic for data records.
    pub data_topic: String,

    /// Partitions to create the data topic with, if missing.
    pub data_partitions: u32,

    /// Where the command consumer starts reading.
    pub command_offset: StartOffset,

    /// Cadence of the idle-update check.
    pub idle_tick: Duration,

    /// Capacity of every internal queue.
    pub queue_capacity: usize,

    pub retry_budget: u32,
    pub retry_backoff: Duration,

    pub startup_attempts: u32,
    pub startup_backoff: Duration,

    /// How long `Draining` waits for outstanding deliveries.
    pub drain_timeout: Duration,

    pub command_poll_timeout: Duration,

    /// Static channel list applied before the first command.
    pub channels_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            command_topic: "TEST_forwarderConfig".to_string(),
            data_topic: "TEST_forwarderData".to_string(),
            data_partitions: 1,
            command_offset: StartOffset::Latest,
            idle_tick: DEFAULT_IDLE_TICK,
            queue_capacity: 1024,
            retry_budget: 3,
            retry_backoff: Duration::from_millis(100),
            startup_attempts: 10,
            startup_backoff: Duration::from_millis(500),
            drain_timeout: Duration::from_millis(5000),
            command_poll_timeout: Duration::from_millis(200),
            channels_file: None,
        }
    }
}

impl Config {
    /// Construct a `Config` from environment variables, falling back
    /// to the defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Config::default();

        let command_offset = match env::var("FORWARDER_COMMAND_OFFSET") {
            Ok(val) => val
                .parse::<StartOffset>()
                .context("FORWARDER_COMMAND_OFFSET")?,
            Err(_) => defaults.command_offset,
        };

        Ok(Config {
            command_topic: env::var("FORWARDER_COMMAND_TOPIC").unwrap_or(defaults.command_topic),
            data_topic: env::var("FORWARDER_DATA_TOPIC").unwrap_or(defaults.data_topic),
            data_partitions: read_env_or_default("FORWARDER_DATA_PARTITIONS", defaults.data_partitions)?,
            command_offset,
            idle_tick: read_millis_or_default("FORWARDER_IDLE_TICK_MS", defaults.idle_tick)?,
            queue_capacity: read_env_or_default("FORWARDER_QUEUE_CAPACITY", defaults.queue_capacity)?,
            retry_budget: read_env_or_default("FORWARDER_RETRY_BUDGET", defaults.retry_budget)?,
            retry_backoff: read_millis_or_default("FORWARDER_RETRY_BACKOFF_MS", defaults.retry_backoff)?,
            startup_attempts: read_env_or_default("FORWARDER_STARTUP_ATTEMPTS", defaults.startup_attempts)?,
            startup_backoff: read_millis_or_default("FORWARDER_STARTUP_BACKOFF_MS", defaults.startup_backoff)?,
            drain_timeout: read_millis_or_default("FORWARDER_DRAIN_TIMEOUT_MS", defaults.drain_timeout)?,
            command_poll_timeout: read_millis_or_default(
                "FORWARDER_COMMAND_POLL_MS",
                defaults.command_poll_timeout,
            )?,
            channels_file: env::var_os("FORWARDER_CHANNELS_FILE").map(PathBuf::from),
        })
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            retry_budget: self.retry_budget,
            retry_backoff: self.retry_backoff,
            queue_capacity: self.queue_capacity,
        }
    }

    pub fn startup_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.startup_attempts,
            backoff: self.startup_backoff,
        }
    }
}

fn read_env_or_default<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(val) => val.trim().parse::<T>().with_context(|| format!("invalid {key}: {val:?}")),
        Err(_) => Ok(default),
    }
}

fn read_millis_or_default(key: &str, default: Duration) -> anyhow::Result<Duration> {
    let ms = read_env_or_default(key, default.as_millis() as u64)?;
    if ms == 0 {
        anyhow::bail!("{key} must be positive");
    }
    Ok(Duration::from_millis(ms))
}

#[derive(Debug, Deserialize)]
struct ChannelFile {
    #[serde(default)]
    channel: Vec<StreamConfig>,
}

/// Parse a channel file's contents.
pub fn parse_channel_file(text: &str) -> Result<Vec<ChannelSpec>, ForwarderError> {
    let file: ChannelFile =
        toml::from_str(text).map_err(|e| ForwarderError::Config(e.to_string()))?;

    file.channel
        .into_iter()
        .map(|stream| {
            stream
                .into_spec()
                .map_err(|e| ForwarderError::Config(e.to_string()))
        })
        .collect()
}

/// Read and parse the channel file at `path`.
pub fn load_channel_file(path: &Path) -> Result<Vec<ChannelSpec>, ForwarderError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ForwarderError::Config(format!("{}: {e}", path.display())))?;
    parse_channel_file(&text)
}

#[cfg(test)]
mod tests {
    use forwarder_core::SourceKind;

    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.command_topic, "TEST_forwarderConfig");
        assert_eq!(config.idle_tick, Duration::from_secs(1));
        assert_eq!(config.command_offset, StartOffset::Latest);
        assert!(config.channels_file.is_none());
    }

    #[test]
    fn channel_file_parses_streams() {
        let specs = parse_channel_file(
            r#"
            [[channel]]
            channel = "SIM:Temp"
            idle_period_ms = 2000

            [[channel]]
            name = "FakePV"
            source = "fake"
            fake_period_ms = 100
            topic = "fake_data"
            "#,
        )
        .unwrap();

        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "SIM:Temp");
        assert_eq!(specs[0].config.source, SourceKind::Live);
        assert_eq!(specs[0].config.idle.idle_period, Some(Duration::from_secs(2)));
        assert_eq!(specs[1].name, "FakePV");
        assert_eq!(
            specs[1].config.source,
            SourceKind::Fake {
                update_period: Some(Duration::from_millis(100))
            }
        );
        assert_eq!(specs[1].config.topic.as_deref(), Some("fake_data"));
    }

    #[test]
    fn empty_channel_file_is_fine() {
        assert!(parse_channel_file("").unwrap().is_empty());
    }

    #[test]
    fn invalid_channel_file_is_a_config_error() {
        let err = parse_channel_file("[[channel]]\nchannel = \"A\"\nidle_period_ms = 0\n").unwrap_err();
        assert!(matches!(err, ForwarderError::Config(_)));

        let err = parse_channel_file("[[channel]\n").unwrap_err();
        assert!(matches!(err, ForwarderError::Config(_)));
    }

    #[test]
    fn missing_channel_file_is_a_config_error() {
        let err = load_channel_file(Path::new("/nonexistent/channels.toml")).unwrap_err();
        assert!(matches!(err, ForwarderError::Config(msg) if msg.contains("channels.toml")));
    }
}
