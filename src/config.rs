//! Configuration module for the kecho server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "kecho")]
#[command(author = "kecho authors")]
#[command(version = "0.1.0")]
#[command(about = "A concurrent TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:12345)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Length of the pending-connection queue
    #[arg(short = 'b', long)]
    pub backlog: Option<i32>,

    /// Per-connection read buffer size in bytes
    #[arg(short = 's', long)]
    pub buffer_size: Option<usize>,

    /// Maximum number of live connection workers (unbounded if unset)
    #[arg(short = 'w', long)]
    pub max_workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub echo: EchoConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Maximum number of live connection workers
    pub max_workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            max_workers: None,
        }
    }
}

/// Echo worker configuration
#[derive(Debug, Deserialize)]
pub struct EchoConfig {
    /// Bytes read per receive call
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
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
    "127.0.0.1:12345".to_string()
}

fn default_backlog() -> i32 {
    128
}

fn default_buffer_size() -> usize {
    crate::runtime::DEFAULT_BUFFER_SIZE
}

/// Largest accepted per-connection buffer.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: i32,
    pub buffer_size: usize,
    pub max_workers: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

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
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            buffer_size: cli.buffer_size.unwrap_or(toml_config.echo.buffer_size),
            max_workers: cli.max_workers.or(toml_config.server.max_workers),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be greater than 0"));
        }
        if self.buffer_size > MAX_BUFFER_SIZE {
            return Err(ConfigError::Invalid("buffer_size must be at most 16 MiB"));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be greater than 0"));
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

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("kecho").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:12345");
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.server.max_workers, None);
        assert_eq!(config.echo.buffer_size, 4096);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:7"
            backlog = 16
            max_workers = 64

            [echo]
            buffer_size = 1024

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:7");
        assert_eq!(config.server.backlog, 16);
        assert_eq!(config.server.max_workers, Some(64));
        assert_eq!(config.echo.buffer_size, 1024);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:7"
            max_workers = 8

            [echo]
            buffer_size = 1024
        "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["-l", "127.0.0.1:9000", "-s", "512", "--log-level", "trace"]),
            toml_config,
        )
        .unwrap();

        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.buffer_size, 512);
        assert_eq!(config.max_workers, Some(8));
        assert_eq!(config.backlog, 128);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_cli_log_level_info_beats_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [logging]
            level = "debug"
        "#,
        )
        .unwrap();

        let config = Config::merge(cli(&["--log-level", "info"]), toml_config).unwrap();
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_log_level_used_without_cli() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [logging]
            level = "warn"
        "#,
        )
        .unwrap();

        let config = Config::merge(cli(&[]), toml_config).unwrap();
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let err = Config::merge(cli(&["-s", "0"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_huge_buffer_rejected() {
        let err = Config::merge(cli(&["-s", "18446744073709551615"]), TomlConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let over = (MAX_BUFFER_SIZE + 1).to_string();
        let err = Config::merge(cli(&["-s", over.as_str()]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let at_limit = MAX_BUFFER_SIZE.to_string();
        let config = Config::merge(cli(&["-s", at_limit.as_str()]), TomlConfig::default()).unwrap();
        assert_eq!(config.buffer_size, MAX_BUFFER_SIZE);
    }

    #[test]
    fn test_non_positive_backlog_rejected() {
        let err = Config::merge(cli(&["-b", "0"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::merge(cli(&["--backlog=-1"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let toml_config: TomlConfig = toml::from_str("[server]\nbacklog = 0\n").unwrap();
        let err = Config::merge(cli(&[]), toml_config).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
