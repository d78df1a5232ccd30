//! Configuration module for vcalc-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the vector summation server
#[derive(Parser, Debug)]
#[command(name = "vcalc-server")]
#[command(author = "vcalc-server authors")]
#[command(version = "0.1.0")]
#[command(about = "Authenticated vector summation server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Authentication file with `login:password` lines (default: ./vcalc.conf)
    #[arg(short, long)]
    pub auth: Option<PathBuf>,

    /// Log file (default: ./log/vcalc.log)
    #[arg(short, long)]
    pub log: Option<PathBuf>,

    /// Port number (default: 33333)
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,

    /// Address to bind to (default: 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Per-read deadline in seconds
    #[arg(long)]
    pub read_timeout: Option<u64>,

    /// Per-write deadline in seconds
    #[arg(long)]
    pub write_timeout: Option<u64>,

    /// Maximum number of connections served at once
    #[arg(long)]
    pub max_connections: Option<usize>,

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
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Seconds
    #[serde(default = "default_timeout")]
    pub read_timeout: u64,
    /// Seconds
    #[serde(default = "default_timeout")]
    pub write_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            read_timeout: default_timeout(),
            write_timeout: default_timeout(),
        }
    }
}

/// Credential file configuration
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_file")]
    pub file: PathBuf,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            file: default_auth_file(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_file")]
    pub file: PathBuf,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: default_log_file(),
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    33333
}

fn default_max_connections() -> usize {
    1024
}

fn default_timeout() -> u64 {
    30
}

fn default_auth_file() -> PathBuf {
    PathBuf::from("./vcalc.conf")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("./log/vcalc.log")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub auth_file: PathBuf,
    pub log_file: PathBuf,
    pub host: String,
    pub port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_connections: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let read_timeout = cli.read_timeout.unwrap_or(toml_config.server.read_timeout);
        let write_timeout = cli
            .write_timeout
            .unwrap_or(toml_config.server.write_timeout);
        if read_timeout == 0 || write_timeout == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }

        let max_connections = cli
            .max_connections
            .unwrap_or(toml_config.server.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".into(),
            ));
        }

        Ok(Config {
            auth_file: cli.auth.unwrap_or(toml_config.auth.file),
            log_file: cli.log.unwrap_or(toml_config.logging.file),
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            read_timeout: Duration::from_secs(read_timeout),
            write_timeout: Duration::from_secs(write_timeout),
            max_connections,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// Address string handed to the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
