//! Configuration module for the pooled echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::listener::DEFAULT_BACKLOG;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "pooled-echo")]
#[command(author = "pooled-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A stream echo server backed by a bounded worker pool", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on (e.g., 127.0.0.1:7777, [::]:7777, unix:/tmp/echo.sock)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listen backlog for pending connections
    #[arg(short = 'b', long)]
    pub backlog: Option<i32>,

    /// Number of worker threads
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of accepted connections waiting for a worker
    #[arg(short = 'q', long)]
    pub queue_capacity: Option<usize>,

    /// Read buffer size per connection in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Per-connection read/write timeout in seconds (0 = no timeout)
    #[arg(short = 't', long)]
    pub io_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Deserialize)]
pub struct PoolSection {
    /// Number of worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Read buffer size
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// I/O timeout in seconds
    #[serde(default)]
    pub io_timeout_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            buffer_size: default_buffer_size(),
            io_timeout_secs: 0,
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

fn default_listen() -> String {
    "127.0.0.1:7777".to_string()
}

fn default_backlog() -> i32 {
    DEFAULT_BACKLOG
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    4
}

fn default_buffer_size() -> usize {
    crate::handler::DEFAULT_BUFFER_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: i32,
    pub workers: usize,
    pub queue_capacity: usize,
    pub buffer_size: usize,
    pub io_timeout: Option<Duration>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::parse_from(["pooled-echo"]), TomlConfig::default())
    }
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

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args over TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let io_timeout_secs = cli.io_timeout.unwrap_or(toml_config.pool.io_timeout_secs);

        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            workers: cli.workers.unwrap_or(toml_config.pool.workers),
            queue_capacity: cli
                .queue_capacity
                .unwrap_or(toml_config.pool.queue_capacity),
            buffer_size: cli.buffer_size.unwrap_or(toml_config.pool.buffer_size),
            io_timeout: (io_timeout_secs > 0).then(|| Duration::from_secs(io_timeout_secs)),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Reject values the pool cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1"));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be at least 1"));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be positive"));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:7777");
        assert_eq!(config.server.backlog, 10);
        assert_eq!(config.pool.workers, 4);
        assert_eq!(config.pool.queue_capacity, 4);
        assert_eq!(config.pool.io_timeout_secs, 0);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "[::]:7000"
            backlog = 128

            [pool]
            workers = 8
            queue_capacity = 16
            buffer_size = 8192
            io_timeout_secs = 30

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "[::]:7000");
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.pool.workers, 8);
        assert_eq!(config.pool.queue_capacity, 16);
        assert_eq!(config.pool.buffer_size, 8192);
        assert_eq!(config.pool.io_timeout_secs, 30);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let cli = CliArgs::parse_from([
            "pooled-echo",
            "--listen",
            "unix:/tmp/echo.sock",
            "--workers",
            "2",
            "--io-timeout",
            "5",
        ]);
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:9000"
            [pool]
            workers = 16
            queue_capacity = 32
        "#,
        )
        .unwrap();

        let config = Config::merge(cli, toml_config);
        assert_eq!(config.listen, "unix:/tmp/echo.sock");
        assert_eq!(config.workers, 2);
        assert_eq!(config.queue_capacity, 32);
        assert_eq!(config.io_timeout, Some(Duration::from_secs(5)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.workers = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.workers = 1;
        config.queue_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
