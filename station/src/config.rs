//! config.rs — station configuration
//!
//! One TOML file describes the whole deployment: the broker, the sample
//! store, per-command deadlines, every chain (serial port) this station
//! drives, and the event log outputs. Anything malformed here is fatal at
//! startup — exit code 1, before any I/O is opened.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::reader::Op;
use crate::sink::{Level, LevelWindow};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed configuration: {0}")]
    Malformed(#[from] toml::de::Error),
    #[error("no [[chains]] configured")]
    NoChains,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub broker: BrokerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub deadlines: Deadlines,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&text)?;
        if config.chains.is_empty() {
            return Err(ConfigError::NoChains);
        }
        Ok(config)
    }
}

// ── Broker ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// e.g. `redis://127.0.0.1:6379`
    pub url: String,
    #[serde(default = "default_command_topic")]
    pub command_topic: String,
    #[serde(default = "default_event_topic")]
    pub event_topic: String,
}

fn default_command_topic() -> String {
    "sram/commands".to_string()
}

fn default_event_topic() -> String {
    "sram/events".to_string()
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// Without a URL the station keeps samples in memory — enough for bench
/// work, useless for a harvest campaign.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    pub url: Option<String>,
}

// ── Deadlines ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Deadlines {
    /// Discovery: per-hop wait for the next `ACK` before the chain is
    /// considered fully walked.
    pub ping_hop_ms: u64,
    /// Any single-block exchange.
    pub block_ms: u64,
    /// Power-cycle settle time before the port is reopened.
    pub power_settle_ms: u64,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            ping_hop_ms: 2000,
            block_ms: 2000,
            power_settle_ms: 500,
        }
    }
}

impl Deadlines {
    pub fn ping_hop(&self) -> Duration {
        Duration::from_millis(self.ping_hop_ms)
    }

    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn power_settle(&self) -> Duration {
        Duration::from_millis(self.power_settle_ms)
    }
}

// ── Chains ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Dispatcher name; becomes the `source_name` of every event.
    pub name: String,
    /// Serial device of the chain head, e.g. `/dev/ttyACM0`.
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Free-form board label stored with every sample, e.g. `nucleo-f446re`.
    pub board_kind: String,
    /// Restrict the capability set for boards that cannot run the full
    /// command surface. Absent means everything.
    pub commands: Option<Vec<Op>>,
}

fn default_baud() -> u32 {
    115_200
}

// ── Log outputs ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputConfig {
    Terminal {
        #[serde(default)]
        level: Level,
        max_level: Option<Level>,
    },
    File {
        path: PathBuf,
        #[serde(default = "default_max_bytes")]
        max_bytes: u64,
        #[serde(default = "default_backups")]
        backups: u32,
        #[serde(default)]
        level: Level,
        max_level: Option<Level>,
    },
    TimedFile {
        path: PathBuf,
        #[serde(default)]
        level: Level,
        max_level: Option<Level>,
    },
    Broker {
        /// Defaults to the broker's `event_topic`.
        routing_key: Option<String>,
        #[serde(default)]
        level: Level,
        max_level: Option<Level>,
    },
    Mailer {
        endpoint: String,
        token: String,
        from: String,
        to: String,
        #[serde(default = "default_alert_level")]
        level: Level,
        max_level: Option<Level>,
    },
    Chat {
        endpoint: String,
        chat_id: String,
        #[serde(default = "default_alert_level")]
        level: Level,
        max_level: Option<Level>,
    },
}

fn default_max_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_backups() -> u32 {
    5
}

fn default_alert_level() -> Level {
    Level::Error
}

impl OutputConfig {
    pub fn window(&self) -> LevelWindow {
        let (min, max) = match self {
            OutputConfig::Terminal { level, max_level }
            | OutputConfig::File {
                level, max_level, ..
            }
            | OutputConfig::TimedFile {
                level, max_level, ..
            }
            | OutputConfig::Broker {
                level, max_level, ..
            }
            | OutputConfig::Mailer {
                level, max_level, ..
            }
            | OutputConfig::Chat {
                level, max_level, ..
            } => (*level, *max_level),
        };
        LevelWindow { min, max }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [broker]
            url = "redis://127.0.0.1:6379"

            [[chains]]
            name = "chain-a"
            port = "/dev/ttyACM0"
            board_kind = "nucleo-f446re"
            "#,
        )
        .unwrap();
        assert_eq!(config.broker.command_topic, "sram/commands");
        assert_eq!(config.chains[0].baud, 115_200);
        assert!(config.store.url.is_none());
        assert_eq!(config.deadlines.ping_hop_ms, 2000);
    }

    #[test]
    fn outputs_parse_with_levels() {
        let config: Config = toml::from_str(
            r#"
            [broker]
            url = "redis://localhost"

            [[chains]]
            name = "chain-a"
            port = "/dev/ttyACM0"
            board_kind = "disco-l152re"
            commands = ["ping", "read", "status", "power_on", "power_off"]

            [[outputs]]
            kind = "terminal"
            level = "DEBUG"
            max_level = "ERROR"

            [[outputs]]
            kind = "file"
            path = "logs/station.log"

            [[outputs]]
            kind = "chat"
            endpoint = "https://api.telegram.org/botTOKEN/sendMessage"
            chat_id = "-100200300"
            "#,
        )
        .unwrap();
        assert_eq!(config.outputs.len(), 3);
        let window = config.outputs[0].window();
        assert!(window.admits(Level::Debug));
        assert!(!window.admits(Level::Error));
        // Alert outputs default to ERROR-and-up.
        assert!(!config.outputs[2].window().admits(Level::Warning));
        let commands = config.chains[0].commands.as_ref().unwrap();
        assert!(commands.contains(&Op::Ping));
        assert!(commands.contains(&Op::PowerOn));
    }
}
