//! JSON command codec.
//!
//! Commands arrive on the command log as JSON objects tagged by `cmd`:
//!
//! - Start / reconfigure channels:
//!   `{"cmd": "add", "streams": [{"channel": "FakePV", "source": "fake", "fake_period_ms": 100, "idle_period_ms": 2000}]}`
//!
//! - Stop channels (`channel` for one, `channels` for several, or both):
//!   `{"cmd": "stop_channel", "channels": ["X", "Y"]}`
//!
//! - Stop everything:
//!   `{"cmd": "stop_all"}`
//!
//! - Drain and exit:
//!   `{"cmd": "exit"}`
//!
//! Stream fields other than `channel` are optional. `source` is `"ca"`
//! (live channel access, default) or `"fake"`. Periods are milliseconds
//! and must be positive when present; `update_period_ms` may be 0.
//!
//! The same [`StreamConfig`] shape is used by the static channel file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use forwarder_core::{ChannelConfig, ChannelSpec, Command, IdleConfig, SourceKind};

use crate::schema_codec::ProtocolError;
use crate::wire_types::validate_source_name_len;

/// Wire form of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum CommandMessage {
    Add {
        streams: Vec<StreamConfig>,
    },
    StopChannel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        channels: Vec<String>,
    },
    StopAll,
    Exit,
}

/// Which update source a stream uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceName {
    #[default]
    Ca,
    Fake,
}

/// One stream entry of an `add` command (or of the channel file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// PV name.
    #[serde(alias = "name")]
    pub channel: String,

    #[serde(default)]
    pub source: SourceName,

    /// Cadence of the fake generator; absent means "one value, then silence".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fake_period_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_period_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_period_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

impl StreamConfig {
    /// Validate and convert into a core [`ChannelSpec`].
    pub fn into_spec(self) -> Result<ChannelSpec, ProtocolError> {
        if !validate_source_name_len(self.channel.len()) {
            return Err(ProtocolError::InvalidCommand(format!(
                "invalid channel name {:?}",
                self.channel
            )));
        }

        let source = match self.source {
            SourceName::Ca => {
                if self.fake_period_ms.is_some() {
                    return Err(ProtocolError::InvalidCommand(format!(
                        "fake_period_ms given for live channel {}",
                        self.channel
                    )));
                }
                SourceKind::Live
            }
            SourceName::Fake => SourceKind::Fake {
                update_period: positive_millis("fake_period_ms", self.fake_period_ms)?,
            },
        };

        let idle = IdleConfig {
            idle_period: positive_millis("idle_period_ms", self.idle_period_ms)?,
            update_period: Duration::from_millis(self.update_period_ms.unwrap_or(0)),
        };

        if let Some(topic) = &self.topic {
            if topic.trim().is_empty() {
                return Err(ProtocolError::InvalidCommand("empty topic".to_string()));
            }
        }

        Ok(ChannelSpec::new(
            self.channel,
            ChannelConfig {
                source,
                idle,
                topic: self.topic,
            },
        ))
    }
}

impl From<&ChannelSpec> for StreamConfig {
    fn from(spec: &ChannelSpec) -> Self {
        let (source, fake_period_ms) = match spec.config.source {
            SourceKind::Live => (SourceName::Ca, None),
            SourceKind::Fake { update_period } => (
                SourceName::Fake,
                update_period.map(|p| p.as_millis() as u64),
            ),
        };
        let update_period_ms = match spec.config.idle.update_period {
            p if p.is_zero() => None,
            p => Some(p.as_millis() as u64),
        };

        StreamConfig {
            channel: spec.name.clone(),
            source,
            fake_period_ms,
            idle_period_ms: spec.config.idle.idle_period.map(|p| p.as_millis() as u64),
            update_period_ms,
            topic: spec.config.topic.clone(),
        }
    }
}

fn positive_millis(field: &str, ms: Option<u64>) -> Result<Option<Duration>, ProtocolError> {
    match ms {
        None => Ok(None),
        Some(0) => Err(ProtocolError::InvalidCommand(format!("{field} must be positive"))),
        Some(ms) => Ok(Some(Duration::from_millis(ms))),
    }
}

/// Parse a command payload.
///
/// The payload must already have any placeholders resolved by its
/// producer.
pub fn parse_command(payload: &[u8]) -> Result<Command, ProtocolError> {
    let msg: CommandMessage = serde_json::from_slice(payload)
        .map_err(|e| ProtocolError::InvalidCommand(e.to_string()))?;
    msg.try_into()
}

/// Encode a command as a JSON payload.
pub fn encode_command(cmd: &Command) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(&CommandMessage::from(cmd))
        .map_err(|e| ProtocolError::InvalidCommand(e.to_string()))
}

impl TryFrom<CommandMessage> for Command {
    type Error = ProtocolError;

    fn try_from(msg: CommandMessage) -> Result<Self, Self::Error> {
        match msg {
            CommandMessage::Add { streams } => {
                if streams.is_empty() {
                    return Err(ProtocolError::InvalidCommand("add without streams".to_string()));
                }
                let specs = streams
                    .into_iter()
                    .map(StreamConfig::into_spec)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Command::StartChannels(specs))
            }
            CommandMessage::StopChannel { channel, mut channels } => {
                if let Some(one) = channel {
                    channels.insert(0, one);
                }
                if channels.is_empty() {
                    return Err(ProtocolError::InvalidCommand(
                        "stop_channel without channel".to_string(),
                    ));
                }
                Ok(Command::StopChannels(channels))
            }
            CommandMessage::StopAll => Ok(Command::StopAll),
            CommandMessage::Exit => Ok(Command::Exit),
        }
    }
}

impl From<&Command> for CommandMessage {
    fn from(cmd: &Command) -> Self {
        match cmd {
            Command::StartChannels(specs) => CommandMessage::Add {
                streams: specs.iter().map(StreamConfig::from).collect(),
            },
            Command::StopChannels(names) => CommandMessage::StopChannel {
                channel: None,
                channels: names.clone(),
            },
            Command::StopAll => CommandMessage::StopAll,
            Command::Exit => CommandMessage::Exit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fake_add_command() {
        let payload = br#"{"cmd": "add", "streams": [
            {"channel": "FakePV", "source": "fake", "fake_period_ms": 100, "idle_period_ms": 2000}
        ]}"#;

        let cmd = parse_command(payload).unwrap();
        let Command::StartChannels(specs) = cmd else {
            panic!("expected StartChannels");
        };
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "FakePV");
        assert_eq!(
            specs[0].config.source,
            SourceKind::Fake {
                update_period: Some(Duration::from_millis(100))
            }
        );
        assert_eq!(specs[0].config.idle.idle_period, Some(Duration::from_secs(2)));
        assert_eq!(specs[0].config.idle.update_period, Duration::ZERO);
    }

    #[test]
    fn live_is_the_default_source() {
        let cmd = parse_command(br#"{"cmd":"add","streams":[{"channel":"SIM:Temp"}]}"#).unwrap();
        assert_eq!(
            cmd,
            Command::StartChannels(vec![ChannelSpec::new("SIM:Temp", ChannelConfig::default())])
        );
    }

    #[test]
    fn stop_accepts_single_and_list_forms() {
        assert_eq!(
            parse_command(br#"{"cmd":"stop_channel","channel":"X"}"#).unwrap(),
            Command::StopChannels(vec!["X".to_string()])
        );
        assert_eq!(
            parse_command(br#"{"cmd":"stop_channel","channel":"X","channels":["Y"]}"#).unwrap(),
            Command::StopChannels(vec!["X".to_string(), "Y".to_string()])
        );
        assert!(parse_command(br#"{"cmd":"stop_channel"}"#).is_err());
    }

    #[test]
    fn stop_all_and_exit() {
        assert_eq!(parse_command(br#"{"cmd":"stop_all"}"#).unwrap(), Command::StopAll);
        assert_eq!(parse_command(br#"{"cmd":"exit"}"#).unwrap(), Command::Exit);
    }

    #[test]
    fn malformed_commands_are_rejected() {
        let bad: [&[u8]; 6] = [
            b"not json",
            br#"{"cmd":"launch"}"#,
            br#"{"cmd":"add","streams":[]}"#,
            br#"{"cmd":"add","streams":[{"channel":""}]}"#,
            br#"{"cmd":"add","streams":[{"channel":"A","idle_period_ms":0}]}"#,
            br#"{"cmd":"add","streams":[{"channel":"A","fake_period_ms":10}]}"#,
        ];
        for payload in bad {
            assert!(
                matches!(parse_command(payload), Err(ProtocolError::InvalidCommand(_))),
                "accepted {:?}",
                String::from_utf8_lossy(payload)
            );
        }
    }

    #[test]
    fn encoded_commands_parse_back() {
        let cmd = Command::StartChannels(vec![ChannelSpec::new(
            "PV:1",
            ChannelConfig {
                source: SourceKind::Fake { update_period: None },
                idle: IdleConfig {
                    idle_period: Some(Duration::from_secs(3)),
                    update_period: Duration::from_millis(500),
                },
                topic: Some("alt_topic".to_string()),
            },
        )]);

        let bytes = encode_command(&cmd).unwrap();
        assert_eq!(parse_command(&bytes).unwrap(), cmd);
    }
}
