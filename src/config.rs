//! Configuration module for the frameload harness.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::frame::{ChecksumKind, MAX_PAYLOAD_LEN};
use crate::harness::{HarnessConfig, DEFAULT_READ_CHUNK_SIZE};
use bytes::Bytes;
use clap::Parser;
use rand::Rng;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the load-test harness
#[derive(Parser, Debug, Default)]
#[command(name = "frameload")]
#[command(author = "frameload authors")]
#[command(version = "0.1.0")]
#[command(about = "Concurrent TCP load tester for a checksum-framed protocol", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Target host
    #[arg(long)]
    pub host: Option<String>,

    /// Target port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Exact number of connections (default: random in 1..=max-connections)
    #[arg(short = 'n', long)]
    pub connections: Option<usize>,

    /// Upper bound for the random connection count
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Message each connection sends once
    #[arg(long)]
    pub payload: Option<String>,

    /// Checksum variant; must match the server
    #[arg(long, value_enum)]
    pub checksum: Option<ChecksumKind>,

    /// Bytes drained per read call
    #[arg(long)]
    pub read_chunk_size: Option<usize>,

    /// Verify server replies as frames
    #[arg(long)]
    pub decode_responses: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub harness: HarnessSection,
    #[serde(default)]
    pub frame: FrameConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server under test
#[derive(Debug, Deserialize)]
pub struct TargetConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Connection pool and timing
#[derive(Debug, Deserialize)]
pub struct HarnessSection {
    /// Fixed connection count; random when absent
    pub connections: Option<usize>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_payload")]
    pub payload: String,
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_run_deadline_ms")]
    pub run_deadline_ms: u64,
    #[serde(default)]
    pub decode_responses: bool,
}

impl Default for HarnessSection {
    fn default() -> Self {
        Self {
            connections: None,
            max_connections: default_max_connections(),
            payload: default_payload(),
            read_chunk_size: default_read_chunk_size(),
            poll_interval_ms: default_poll_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            run_deadline_ms: default_run_deadline_ms(),
            decode_responses: false,
        }
    }
}

/// Wire format settings shared with the server
#[derive(Debug, Deserialize)]
pub struct FrameConfig {
    #[serde(default)]
    pub checksum: ChecksumKind,
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            checksum: ChecksumKind::default(),
            max_payload_size: default_max_payload_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    32450
}

fn default_max_connections() -> usize {
    512
}

fn default_payload() -> String {
    "GET /index.html HTTP/1.0\r\n\r\n".to_string()
}

fn default_read_chunk_size() -> usize {
    DEFAULT_READ_CHUNK_SIZE
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_connection_timeout_ms() -> u64 {
    60_000
}

fn default_run_deadline_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_max_payload_size() -> usize {
    MAX_PAYLOAD_LEN
}

fn default_log_level() -> String {
    "info".to_string()
}

/// How many connections to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionCount {
    Fixed(usize),
    /// Uniform in `1..=max`.
    Random { max: usize },
}

impl ConnectionCount {
    pub fn resolve(self) -> usize {
        match self {
            ConnectionCount::Fixed(n) => n,
            ConnectionCount::Random { max } => rand::thread_rng().gen_range(1..=max),
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub connections: ConnectionCount,
    pub payload: Bytes,
    pub read_chunk_size: usize,
    pub checksum: ChecksumKind,
    pub max_payload_size: usize,
    pub decode_responses: bool,
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub connection_timeout: Duration,
    pub run_deadline: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let harness = toml_config.harness;
        let max_connections = cli.max_connections.unwrap_or(harness.max_connections);
        let connections = match cli.connections.or(harness.connections) {
            Some(n) => ConnectionCount::Fixed(n),
            None => ConnectionCount::Random {
                max: max_connections,
            },
        };

        let config = Config {
            host: cli.host.unwrap_or(toml_config.target.host),
            port: cli.port.unwrap_or(toml_config.target.port),
            connections,
            payload: Bytes::from(cli.payload.unwrap_or(harness.payload)),
            read_chunk_size: cli.read_chunk_size.unwrap_or(harness.read_chunk_size),
            checksum: cli.checksum.unwrap_or(toml_config.frame.checksum),
            max_payload_size: toml_config.frame.max_payload_size,
            decode_responses: cli.decode_responses || harness.decode_responses,
            poll_interval: Duration::from_millis(harness.poll_interval_ms),
            connect_timeout: Duration::from_millis(harness.connect_timeout_ms),
            connection_timeout: Duration::from_millis(harness.connection_timeout_ms),
            run_deadline: Duration::from_millis(harness.run_deadline_ms),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate(max_connections)?;
        Ok(config)
    }

    fn validate(&self, max_connections: usize) -> Result<(), ConfigError> {
        if max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".into(),
            ));
        }
        if let ConnectionCount::Fixed(n) = self.connections {
            if n == 0 || n > max_connections {
                return Err(ConfigError::Invalid(format!(
                    "connections must be in 1..={max_connections}, got {n}"
                )));
            }
        }
        if self.read_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "read_chunk_size must be non-zero".into(),
            ));
        }
        if self.max_payload_size > i32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_payload_size {} does not fit the 32-bit size field",
                self.max_payload_size
            )));
        }
        if self.payload.len() > self.max_payload_size {
            return Err(ConfigError::Invalid(format!(
                "payload of {} bytes exceeds max_payload_size {}",
                self.payload.len(),
                self.max_payload_size
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Harness parameters for a run with `connections` connections.
    pub fn harness_config(&self, connections: usize) -> HarnessConfig {
        let mut harness = HarnessConfig::new(self.host.clone(), self.port, connections);
        harness.payload = self.payload.clone();
        harness.read_chunk_size = self.read_chunk_size;
        harness.checksum = self.checksum;
        harness.max_payload = self.max_payload_size;
        harness.decode_responses = self.decode_responses;
        harness.poll_interval = self.poll_interval;
        harness.connect_timeout = self.connect_timeout;
        harness.connection_timeout = self.connection_timeout;
        harness.run_deadline = self.run_deadline;
        harness
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> CliArgs {
        CliArgs {
            log_level: "info".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.target.host, "127.0.0.1");
        assert_eq!(config.target.port, 32450);
        assert_eq!(config.harness.max_connections, 512);
        assert_eq!(config.harness.read_chunk_size, 8192);
        assert_eq!(config.frame.checksum, ChecksumKind::Crc32c);
        assert!(config.harness.connections.is_none());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [target]
            host = "10.0.0.5"
            port = 9000

            [harness]
            connections = 16
            payload = "ping"
            read_chunk_size = 4096
            run_deadline_ms = 1500
            decode_responses = true

            [frame]
            checksum = "crc32"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.target.host, "10.0.0.5");
        assert_eq!(config.target.port, 9000);
        assert_eq!(config.harness.connections, Some(16));
        assert_eq!(config.harness.payload, "ping");
        assert_eq!(config.harness.read_chunk_size, 4096);
        assert_eq!(config.harness.run_deadline_ms, 1500);
        assert!(config.harness.decode_responses);
        assert_eq!(config.frame.checksum, ChecksumKind::Crc32);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [target]
            port = 9000
            [harness]
            connections = 16
            [frame]
            checksum = "crc32"
            "#,
        )
        .unwrap();

        let args = CliArgs {
            port: Some(7000),
            connections: Some(3),
            checksum: Some(ChecksumKind::Crc32c),
            ..cli()
        };

        let config = Config::merge(args, toml_config).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.connections, ConnectionCount::Fixed(3));
        assert_eq!(config.checksum, ChecksumKind::Crc32c);
    }

    #[test]
    fn test_random_count_within_bounds() {
        let args = CliArgs {
            max_connections: Some(4),
            ..cli()
        };
        let config = Config::merge(args, TomlConfig::default()).unwrap();
        assert_eq!(config.connections, ConnectionCount::Random { max: 4 });
        for _ in 0..100 {
            let n = config.connections.resolve();
            assert!((1..=4).contains(&n));
        }
    }

    #[test]
    fn test_rejects_invalid_values() {
        let zero = CliArgs {
            connections: Some(0),
            ..cli()
        };
        assert!(matches!(
            Config::merge(zero, TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));

        let too_many = CliArgs {
            connections: Some(10),
            max_connections: Some(5),
            ..cli()
        };
        assert!(Config::merge(too_many, TomlConfig::default()).is_err());

        let no_chunk = CliArgs {
            read_chunk_size: Some(0),
            ..cli()
        };
        assert!(Config::merge(no_chunk, TomlConfig::default()).is_err());

        let mut small = TomlConfig::default();
        small.frame.max_payload_size = 2;
        let big_payload = CliArgs {
            payload: Some("hello".into()),
            ..cli()
        };
        assert!(Config::merge(big_payload, small).is_err());
    }

    #[test]
    fn test_harness_config_carries_settings() {
        let args = CliArgs {
            host: Some("localhost".into()),
            connections: Some(2),
            payload: Some("hello,kitty".into()),
            decode_responses: true,
            ..cli()
        };
        let config = Config::merge(args, TomlConfig::default()).unwrap();
        let harness = config.harness_config(2);

        assert_eq!(harness.host, "localhost");
        assert_eq!(harness.connections, 2);
        assert_eq!(&harness.payload[..], b"hello,kitty");
        assert!(harness.decode_responses);
        assert_eq!(harness.run_deadline, Duration::from_secs(300));
    }
}
