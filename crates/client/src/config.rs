//! Configuration management for telbridge.
//!
//! Connection settings come from three layers, highest precedence first:
//! command-line flags, `TELBRIDGE_*` environment variables, and a TOML file
//! (default `~/.config/telbridge/config.toml`). Whatever the source, the raw
//! values end up in [`ConnectionArgs`], whose validation reports every
//! violation at once and is the only way to obtain a [`SessionConfig`].

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{PromptPattern, DEFAULT_PROMPT};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default TELNET port.
pub const DEFAULT_PORT: i64 = 23;

/// Default connect and command timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: i64 = 2500;

/// Default window during which option negotiation may settle.
pub const DEFAULT_NEGOTIATION_GRACE_MS: i64 = 200;

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Remote host and port of a TELNET-style service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A single problem found while validating configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigViolation {
    /// Host is empty or whitespace.
    EmptyHost,
    /// Port is outside 1..=65535.
    PortOutOfRange(i64),
    /// A duration field is zero or negative.
    NotPositive { field: &'static str, value: i64 },
    /// A numeric value could not be parsed.
    NotAnInteger { field: &'static str, value: String },
    /// The prompt is empty or the regex does not compile.
    InvalidPrompt { field: &'static str, reason: String },
    /// Unknown log level.
    InvalidLogLevel(String),
}

impl ConfigViolation {
    /// Name of the offending field.
    pub fn field(&self) -> &'static str {
        match self {
            ConfigViolation::EmptyHost => "host",
            ConfigViolation::PortOutOfRange(_) => "port",
            ConfigViolation::NotPositive { field, .. }
            | ConfigViolation::NotAnInteger { field, .. }
            | ConfigViolation::InvalidPrompt { field, .. } => field,
            ConfigViolation::InvalidLogLevel(_) => "log_level",
        }
    }
}

impl fmt::Display for ConfigViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigViolation::EmptyHost => write!(f, "host must be a non-empty string"),
            ConfigViolation::PortOutOfRange(port) => {
                write!(f, "port must be between 1 and 65535, got {}", port)
            }
            ConfigViolation::NotPositive { field, value } => {
                write!(f, "{} must be greater than 0, got {}", field, value)
            }
            ConfigViolation::NotAnInteger { field, value } => {
                write!(f, "{} must be an integer, got {:?}", field, value)
            }
            ConfigViolation::InvalidPrompt { field, reason } => {
                write!(f, "{} is not a usable prompt: {}", field, reason)
            }
            ConfigViolation::InvalidLogLevel(level) => write!(
                f,
                "log_level must be one of: {}; got {}",
                VALID_LOG_LEVELS.join(", "),
                level
            ),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// One or more fields are invalid. Every violation is listed.
    #[error("invalid initialisation configuration: {}", format_violations(.0))]
    Invalid(Vec<ConfigViolation>),
}

impl ConfigError {
    /// All violations carried by this error.
    pub fn violations(&self) -> &[ConfigViolation] {
        match self {
            ConfigError::Invalid(violations) => violations,
        }
    }

    /// Returns `true` if some violation names `field`.
    pub fn names_field(&self, field: &str) -> bool {
        self.violations().iter().any(|v| v.field() == field)
    }
}

fn format_violations(violations: &[ConfigViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{} @ {}", v, v.field()))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Unvalidated connection settings as they arrive from flags, env, or file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionArgs {
    pub host: String,
    pub port: i64,
    /// Connect timeout in milliseconds. Also the command timeout unless
    /// `command_timeout_ms` is set.
    pub timeout_ms: i64,
    pub command_timeout_ms: Option<i64>,
    pub negotiation_grace_ms: i64,
    pub prompt: String,
    pub prompt_regex: Option<String>,
}

impl ConnectionArgs {
    /// Arguments for `host` with the default port, timeouts and prompt.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            command_timeout_ms: None,
            negotiation_grace_ms: DEFAULT_NEGOTIATION_GRACE_MS,
            prompt: DEFAULT_PROMPT.to_string(),
            prompt_regex: None,
        }
    }

    pub fn port(mut self, port: i64) -> Self {
        self.port = port;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn command_timeout_ms(mut self, command_timeout_ms: i64) -> Self {
        self.command_timeout_ms = Some(command_timeout_ms);
        self
    }

    pub fn negotiation_grace_ms(mut self, negotiation_grace_ms: i64) -> Self {
        self.negotiation_grace_ms = negotiation_grace_ms;
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn prompt_regex(mut self, pattern: impl Into<String>) -> Self {
        self.prompt_regex = Some(pattern.into());
        self
    }

    /// Validate every field and build a [`SessionConfig`].
    ///
    /// All violations are collected before returning, not just the first.
    pub fn validate(&self) -> Result<SessionConfig, ConfigError> {
        let mut violations = Vec::new();
        self.check(&mut violations);
        if !violations.is_empty() {
            return Err(ConfigError::Invalid(violations));
        }
        self.build().map_err(|v| ConfigError::Invalid(vec![v]))
    }

    fn check(&self, violations: &mut Vec<ConfigViolation>) {
        if self.host.trim().is_empty() {
            violations.push(ConfigViolation::EmptyHost);
        }
        if u16::try_from(self.port).map_or(true, |p| p == 0) {
            violations.push(ConfigViolation::PortOutOfRange(self.port));
        }
        check_positive("timeout", self.timeout_ms, violations);
        if let Some(command_timeout) = self.command_timeout_ms {
            check_positive("command_timeout", command_timeout, violations);
        }
        check_positive("negotiation_grace", self.negotiation_grace_ms, violations);
        if let Err(v) = self.prompt_pattern() {
            violations.push(v);
        }
    }

    fn prompt_pattern(&self) -> Result<PromptPattern, ConfigViolation> {
        match &self.prompt_regex {
            Some(pattern) => {
                PromptPattern::regex(pattern).map_err(|e| ConfigViolation::InvalidPrompt {
                    field: "prompt_regex",
                    reason: e.to_string(),
                })
            }
            None => PromptPattern::literal(self.prompt.as_bytes()).map_err(|e| {
                ConfigViolation::InvalidPrompt {
                    field: "prompt",
                    reason: e.to_string(),
                }
            }),
        }
    }

    fn build(&self) -> Result<SessionConfig, ConfigViolation> {
        let port =
            u16::try_from(self.port).map_err(|_| ConfigViolation::PortOutOfRange(self.port))?;
        let connect_timeout = millis(self.timeout_ms);
        Ok(SessionConfig {
            endpoint: Endpoint::new(self.host.trim(), port),
            connect_timeout,
            command_timeout: self.command_timeout_ms.map_or(connect_timeout, millis),
            negotiation_grace: millis(self.negotiation_grace_ms),
            prompt: self.prompt_pattern()?,
        })
    }
}

fn check_positive(field: &'static str, value: i64, violations: &mut Vec<ConfigViolation>) {
    if value <= 0 {
        violations.push(ConfigViolation::NotPositive { field, value });
    }
}

fn millis(value: i64) -> Duration {
    Duration::from_millis(value.max(0) as u64)
}

/// Validated settings for one session.
///
/// Only obtainable through [`ConnectionArgs::validate`], so every duration
/// is non-zero and the host is non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    endpoint: Endpoint,
    connect_timeout: Duration,
    command_timeout: Duration,
    negotiation_grace: Duration,
    prompt: PromptPattern,
}

impl SessionConfig {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    pub fn negotiation_grace(&self) -> Duration {
        self.negotiation_grace
    }

    pub fn prompt(&self) -> &PromptPattern {
        &self.prompt
    }
}

/// Main configuration structure, as stored in the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Remote endpoint and connect timeout.
    pub connection: ConnectionSection,

    /// Command execution settings.
    pub session: SessionSection,

    /// Session pooling.
    pub pool: PoolSection,

    /// Logging output.
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionSection {
    pub host: String,
    pub port: i64,
    pub timeout_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSection {
    /// Falls back to `connection.timeout_ms` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_timeout_ms: Option<i64>,
    pub negotiation_grace_ms: i64,
    pub prompt: String,
    /// Takes precedence over `prompt` when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_regex: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolSection {
    /// Keep one live session per endpoint between commands.
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSection {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Also write logs to this file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            command_timeout_ms: None,
            negotiation_grace_ms: DEFAULT_NEGOTIATION_GRACE_MS,
            prompt: DEFAULT_PROMPT.to_string(),
            prompt_regex: None,
        }
    }
}

impl Default for PoolSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("telbridge")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported variables (empty values are ignored):
    /// - TELBRIDGE_HOST
    /// - TELBRIDGE_PORT
    /// - TELBRIDGE_TIMEOUT (milliseconds)
    /// - TELBRIDGE_LOG_LEVEL
    ///
    /// Numeric variables that do not parse are reported as violations.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        let mut violations = Vec::new();

        if let Some(host) = env_value("TELBRIDGE_HOST") {
            tracing::debug!("Overriding host from environment: {}", host);
            self.connection.host = host;
        }

        if let Some(port) = env_value("TELBRIDGE_PORT") {
            match port.parse() {
                Ok(port) => self.connection.port = port,
                Err(_) => violations.push(ConfigViolation::NotAnInteger {
                    field: "port",
                    value: port,
                }),
            }
        }

        if let Some(timeout) = env_value("TELBRIDGE_TIMEOUT") {
            match timeout.parse() {
                Ok(timeout) => self.connection.timeout_ms = timeout,
                Err(_) => violations.push(ConfigViolation::NotAnInteger {
                    field: "timeout",
                    value: timeout,
                }),
            }
        }

        if let Some(level) = env_value("TELBRIDGE_LOG_LEVEL") {
            tracing::debug!("Overriding log_level from environment: {}", level);
            self.logging.level = level;
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(violations))
        }
    }

    /// Raw connection arguments described by this configuration.
    pub fn connection_args(&self) -> ConnectionArgs {
        ConnectionArgs {
            host: self.connection.host.clone(),
            port: self.connection.port,
            timeout_ms: self.connection.timeout_ms,
            command_timeout_ms: self.session.command_timeout_ms,
            negotiation_grace_ms: self.session.negotiation_grace_ms,
            prompt: self.session.prompt.clone(),
            prompt_regex: self.session.prompt_regex.clone(),
        }
    }

    /// Validate the whole configuration and build the session settings.
    ///
    /// Every violation is reported, including the log level.
    pub fn validate(&self) -> Result<SessionConfig, ConfigError> {
        let mut violations = Vec::new();

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            violations.push(ConfigViolation::InvalidLogLevel(
                self.logging.level.clone(),
            ));
        }

        match self.connection_args().validate() {
            Ok(session) if violations.is_empty() => Ok(session),
            Ok(_) => Err(ConfigError::Invalid(violations)),
            Err(ConfigError::Invalid(mut more)) => {
                more.extend(violations);
                Err(ConfigError::Invalid(more))
            }
        }
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
