use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::{Error, Result};

const ENV_PREFIX: &str = "ALERT_EXEC_";

lazy_static! {
    static ref DURATION_SEGMENT: Regex =
        Regex::new(r"(\d+(?:\.\d*)?|\.\d+)(ns|us|µs|ms|s|m|h)").expect("valid duration regex");
}

/// Command-line flags. Anything set here wins over file and environment.
#[derive(Debug, Default, Clone, Parser)]
#[command(name = "alert-exec", version, about = "Run a command for every Alertmanager notification")]
pub struct CliArgs {
    /// Path to config file (YAML)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Address to listen on, e.g. :9095
    #[arg(long)]
    pub listen: Option<String>,
    /// Command to execute
    #[arg(long)]
    pub command: Option<String>,
    /// Shared secret token expected in requests
    #[arg(long)]
    pub token: Option<String>,
    /// Command timeout, e.g. 5s, 1m
    #[arg(long)]
    pub timeout: Option<String>,
    /// Log level: debug, info, warn, error
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen() -> String {
    ":9095".to_string()
}

fn default_command() -> String {
    "/usr/local/bin/send-evolution".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if raw.is_empty() {
        return Ok(default_timeout());
    }
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            token: String::new(),
            command: default_command(),
            args: Vec::new(),
            timeout: default_timeout(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the following precedence:
    /// 1. Defaults
    /// 2. Config file (if provided)
    /// 3. Environment variables (`ALERT_EXEC_*`)
    ///
    /// Command-line flags are applied on top with [`Config::apply_overrides`].
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();

        let mut config = match config_file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        // An empty document means "all defaults"
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Overlay `ALERT_EXEC_*` variables resolved through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(listen) = var("LISTEN") {
            self.listen = listen;
        }
        if let Some(token) = var("TOKEN") {
            self.token = token;
        }
        if let Some(command) = var("COMMAND") {
            self.command = command;
        }
        if let Some(args) = var("ARGS") {
            self.args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(timeout) = var("TIMEOUT") {
            self.timeout = parse_duration(&timeout)?;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, cli: &CliArgs) -> Result<()> {
        if let Some(listen) = non_empty(&cli.listen) {
            self.listen = listen.to_string();
        }
        if let Some(command) = non_empty(&cli.command) {
            self.command = command.to_string();
        }
        if let Some(token) = non_empty(&cli.token) {
            self.token = token.to_string();
        }
        if let Some(timeout) = non_empty(&cli.timeout) {
            self.timeout = parse_duration(timeout)
                .map_err(|e| Error::Config(format!("invalid timeout flag {timeout:?}: {e}")))?;
        }
        if let Some(level) = non_empty(&cli.log_level) {
            self.log_level = level.to_string();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            return Err(Error::Config("listen address cannot be empty".to_string()));
        }
        if self.command.is_empty() {
            return Err(Error::Config("command cannot be empty".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("timeout must be greater than zero".to_string()));
        }
        Ok(())
    }

    pub fn has_token(&self) -> bool {
        !self.token.is_empty()
    }

    /// Socket address to bind. A bare `:port` listens on all interfaces.
    pub fn listen_addr(&self) -> String {
        if self.listen.starts_with(':') {
            format!("0.0.0.0{}", self.listen)
        } else {
            self.listen.clone()
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Parse a duration written like `5s`, `100ms`, `1m30s` or `1.5h`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let s = raw.trim();
    let invalid = || Error::Config(format!("invalid duration {raw:?}"));

    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total_nanos = 0f64;
    let mut cursor = 0;
    for caps in DURATION_SEGMENT.captures_iter(s) {
        let whole = caps.get(0).ok_or_else(invalid)?;
        if whole.start() != cursor {
            return Err(invalid());
        }
        cursor = whole.end();

        let value: f64 = caps[1].parse().map_err(|_| invalid())?;
        let unit_nanos = match &caps[2] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        total_nanos += value * unit_nanos;
    }
    if cursor != s.len() {
        return Err(invalid());
    }

    let total_nanos = total_nanos.round();
    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(Duration::from_nanos(total_nanos as u64))
}
