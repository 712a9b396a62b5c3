//! Configuration module for the tailsock server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the streaming server
#[derive(Parser, Debug, Default)]
#[command(name = "tailsock")]
#[command(author = "tailsock authors")]
#[command(version = "0.1.0")]
#[command(
    about = "Streams a followed file as chunked HTTP over a Unix domain socket",
    long_about = None
)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Filesystem path of the listening socket (e.g., /tmp/test_socket.sock)
    #[arg(short, long)]
    pub socket: Option<PathBuf>,

    /// File whose appended lines are streamed to clients
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Program used to follow the file (its arguments come from the config file)
    #[arg(long)]
    pub tail_program: Option<String>,

    /// Pending connection queue depth
    #[arg(long)]
    pub backlog: Option<i32>,

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
    pub tail: TailConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listening endpoint configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Socket path to bind
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Permission bits applied to the socket file after binding
    pub socket_mode: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            backlog: default_backlog(),
            socket_mode: None,
        }
    }
}

/// Line source configuration
#[derive(Debug, Deserialize)]
pub struct TailConfig {
    /// File to follow
    #[serde(default = "default_tail_file")]
    pub file: PathBuf,
    /// Follower program
    #[serde(default = "default_tail_program")]
    pub program: String,
    /// Arguments placed before the file path
    #[serde(default = "default_tail_args")]
    pub args: Vec<String>,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            file: default_tail_file(),
            program: default_tail_program(),
            args: default_tail_args(),
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

fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/test_socket.sock")
}

fn default_backlog() -> i32 {
    1
}

fn default_tail_file() -> PathBuf {
    PathBuf::from("/tmp/test_output.txt")
}

fn default_tail_program() -> String {
    "tail".to_string()
}

fn default_tail_args() -> Vec<String> {
    vec!["-f".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub socket_path: PathBuf,
    pub backlog: i32,
    pub socket_mode: Option<u32>,
    pub tail_file: PathBuf,
    pub tail_program: String,
    pub tail_args: Vec<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve configuration from already-parsed CLI args.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
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

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            socket_path: cli.socket.unwrap_or(toml_config.server.socket_path),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            socket_mode: toml_config.server.socket_mode,
            tail_file: cli.file.unwrap_or(toml_config.tail.file),
            tail_program: cli.tail_program.unwrap_or(toml_config.tail.program),
            tail_args: toml_config.tail.args,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog < 1 {
            return Err(ConfigError::Invalid(format!(
                "backlog must be at least 1, got {}",
                self.backlog
            )));
        }
        if self.tail_program.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "tail program must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.socket_path, PathBuf::from("/tmp/test_socket.sock"));
        assert_eq!(config.server.backlog, 1);
        assert_eq!(config.server.socket_mode, None);
        assert_eq!(config.tail.file, PathBuf::from("/tmp/test_output.txt"));
        assert_eq!(config.tail.program, "tail");
        assert_eq!(config.tail.args, vec!["-f".to_string()]);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            socket_path = "/run/tailsock.sock"
            backlog = 4
            socket_mode = 0o600

            [tail]
            file = "/var/log/app.log"
            program = "/usr/bin/tail"
            args = ["-n", "0", "-F"]

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.socket_path, PathBuf::from("/run/tailsock.sock"));
        assert_eq!(config.server.backlog, 4);
        assert_eq!(config.server.socket_mode, Some(0o600));
        assert_eq!(config.tail.file, PathBuf::from("/var/log/app.log"));
        assert_eq!(config.tail.program, "/usr/bin/tail");
        assert_eq!(config.tail.args, vec!["-n", "0", "-F"]);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nsocket_path = \"/from/file.sock\"\n[logging]\nlevel = \"warn\""
        )
        .unwrap();

        let cli = CliArgs::parse_from([
            "tailsock",
            "--config",
            file.path().to_str().unwrap(),
            "--socket",
            "/from/cli.sock",
        ]);
        let config = Config::from_cli(cli).unwrap();

        assert_eq!(config.socket_path, PathBuf::from("/from/cli.sock"));
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.backlog, 1);
    }

    #[test]
    fn test_zero_backlog_rejected() {
        let cli = CliArgs::parse_from(["tailsock", "--backlog", "0"]);
        match Config::from_cli(cli) {
            Err(ConfigError::Invalid(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs::parse_from(["tailsock", "--config", "/nonexistent/tailsock.toml"]);
        match Config::from_cli(cli) {
            Err(ConfigError::FileRead(path, _)) => {
                assert_eq!(path, PathBuf::from("/nonexistent/tailsock.toml"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
