//! Client configuration.
//!
//! Configuration is read from an optional YAML file with environment
//! variable overrides on top, falling back to defaults for anything left
//! unspecified. Durations are written in human-readable form ("5s",
//! "250ms"). Validation happens synchronously when the configuration is
//! handed to a client, before any network interaction.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use pushlink_session::BackoffPolicy;

use crate::error::ClientError;

/// Everything a [`crate::PushClient`] needs to open sessions.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, `host:port`
    pub server_address: String,
    /// Adapter set requested at session create
    pub adapter_set: String,
    /// Optional credentials
    pub user: Option<String>,
    /// Optional credentials
    pub password: Option<String>,
    /// Keep-alive interval requested from the server
    pub keepalive: Duration,
    /// Reverse-heartbeat period; zero disables the idle timer
    pub reverse_heartbeat_interval: Duration,
    /// Inbound silence before the session is reported stalled
    pub stall_timeout: Duration,
    /// Further silence after stalling before recovery starts
    pub recovery_grace: Duration,
    /// First recovery backoff delay
    pub recovery_initial: Duration,
    /// Recovery backoff ceiling; jittered delays never exceed it
    pub recovery_ceiling: Duration,
    /// Recovery attempt budget
    pub recovery_limit: u32,
    /// Control-request retransmission budget
    pub request_retry_limit: u32,
    /// Per-request time budget
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "localhost:8080".to_string(),
            adapter_set: "DEFAULT".to_string(),
            user: None,
            password: None,
            keepalive: Duration::from_secs(5),
            reverse_heartbeat_interval: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(10),
            recovery_grace: Duration::from_secs(5),
            recovery_initial: Duration::from_millis(500),
            recovery_ceiling: Duration::from_secs(30),
            recovery_limit: 8,
            request_retry_limit: 4,
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// File representation (durations as humantime strings).
#[derive(Debug, Deserialize)]
struct FileConfig {
    server: Option<String>,
    adapter_set: Option<String>,
    user: Option<String>,
    password: Option<String>,
    keepalive: Option<String>,
    reverse_heartbeat: Option<String>,
    stall_timeout: Option<String>,
    recovery_grace: Option<String>,
    recovery: Option<FileRecovery>,
    request: Option<FileRequest>,
}

#[derive(Debug, Deserialize)]
struct FileRecovery {
    initial: Option<String>,
    ceiling: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FileRequest {
    retry_limit: Option<u32>,
    timeout: Option<String>,
}

impl ClientConfig {
    /// Load configuration from a YAML file, then apply environment
    /// overrides. A missing file falls back to defaults with a warning.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => {
                let file: FileConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("parsing {:?}", config_path.as_ref()))?;
                config.apply_file_config(file)?;
                info!("loaded configuration from {:?}", config_path.as_ref());
            }
            Err(_) => {
                warn!(
                    "config file {:?} not found, using defaults",
                    config_path.as_ref()
                );
            }
        }

        config.apply_environment_overrides()?;
        Ok(config)
    }

    fn apply_file_config(&mut self, file: FileConfig) -> Result<()> {
        if let Some(server) = file.server {
            self.server_address = server;
        }
        if let Some(adapter_set) = file.adapter_set {
            self.adapter_set = adapter_set;
        }
        if file.user.is_some() {
            self.user = file.user;
        }
        if file.password.is_some() {
            self.password = file.password;
        }
        if let Some(raw) = file.keepalive {
            self.keepalive = parse_duration("keepalive", &raw)?;
        }
        if let Some(raw) = file.reverse_heartbeat {
            self.reverse_heartbeat_interval = parse_duration("reverse_heartbeat", &raw)?;
        }
        if let Some(raw) = file.stall_timeout {
            self.stall_timeout = parse_duration("stall_timeout", &raw)?;
        }
        if let Some(raw) = file.recovery_grace {
            self.recovery_grace = parse_duration("recovery_grace", &raw)?;
        }
        if let Some(recovery) = file.recovery {
            if let Some(raw) = recovery.initial {
                self.recovery_initial = parse_duration("recovery.initial", &raw)?;
            }
            if let Some(raw) = recovery.ceiling {
                self.recovery_ceiling = parse_duration("recovery.ceiling", &raw)?;
            }
            if let Some(limit) = recovery.limit {
                self.recovery_limit = limit;
            }
        }
        if let Some(request) = file.request {
            if let Some(retry_limit) = request.retry_limit {
                self.request_retry_limit = retry_limit;
            }
            if let Some(raw) = request.timeout {
                self.request_timeout = parse_duration("request.timeout", &raw)?;
            }
        }
        Ok(())
    }

    fn apply_environment_overrides(&mut self) -> Result<()> {
        if let Ok(server) = std::env::var("PUSHLINK_SERVER") {
            info!("server address overridden by environment: {}", server);
            self.server_address = server;
        }
        if let Ok(adapter_set) = std::env::var("PUSHLINK_ADAPTER_SET") {
            info!("adapter set overridden by environment: {}", adapter_set);
            self.adapter_set = adapter_set;
        }
        if let Ok(user) = std::env::var("PUSHLINK_USER") {
            self.user = Some(user);
        }
        if let Ok(password) = std::env::var("PUSHLINK_PASSWORD") {
            self.password = Some(password);
        }
        if let Ok(raw) = std::env::var("PUSHLINK_KEEPALIVE") {
            self.keepalive = parse_duration("PUSHLINK_KEEPALIVE", &raw)?;
        }
        Ok(())
    }

    /// Check the configuration is usable; called by the client constructor
    /// so invalid arguments fail before any network interaction.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.server_address.trim().is_empty() {
            return Err(ClientError::Configuration(
                "server address must not be empty".to_string(),
            ));
        }
        if !self.server_address.contains(':') {
            return Err(ClientError::Configuration(format!(
                "server address {:?} must be host:port",
                self.server_address
            )));
        }
        if self.adapter_set.trim().is_empty() {
            return Err(ClientError::Configuration(
                "adapter set must not be empty".to_string(),
            ));
        }
        if self.keepalive.is_zero() {
            return Err(ClientError::Configuration(
                "keepalive must be positive".to_string(),
            ));
        }
        if self.stall_timeout.is_zero() {
            return Err(ClientError::Configuration(
                "stall timeout must be positive".to_string(),
            ));
        }
        if self.recovery_limit == 0 {
            return Err(ClientError::Configuration(
                "recovery limit must be at least 1".to_string(),
            ));
        }
        if self.recovery_initial > self.recovery_ceiling {
            return Err(ClientError::Configuration(
                "recovery initial delay exceeds the ceiling".to_string(),
            ));
        }
        Ok(())
    }

    /// Recovery pacing derived from this configuration.
    pub fn recovery_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: self.recovery_initial,
            ceiling: self.recovery_ceiling,
            max_attempts: self.recovery_limit,
        }
    }

    /// Control-request retry pacing derived from this configuration.
    pub fn request_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(200),
            ceiling: Duration::from_secs(4),
            max_attempts: self.request_retry_limit,
        }
    }
}

fn parse_duration(field: &str, raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw).with_context(|| format!("invalid duration for {}: {:?}", field, raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.adapter_set, "DEFAULT");
        assert_eq!(config.recovery_limit, 8);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
server: push.example.com:8080
adapter_set: QUOTES
user: trader
keepalive: 8s
reverse_heartbeat: 20s
stall_timeout: 12s
recovery:
  initial: 250ms
  ceiling: 10s
  limit: 5
request:
  retry_limit: 2
  timeout: 30s
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = ClientConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.server_address, "push.example.com:8080");
        assert_eq!(config.adapter_set, "QUOTES");
        assert_eq!(config.user.as_deref(), Some("trader"));
        assert_eq!(config.keepalive, Duration::from_secs(8));
        assert_eq!(config.reverse_heartbeat_interval, Duration::from_secs(20));
        assert_eq!(config.stall_timeout, Duration::from_secs(12));
        assert_eq!(config.recovery_initial, Duration::from_millis(250));
        assert_eq!(config.recovery_ceiling, Duration::from_secs(10));
        assert_eq!(config.recovery_limit, 5);
        assert_eq!(config.request_retry_limit, 2);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_duration_is_rejected() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"keepalive: whenever\n").unwrap();
        assert!(ClientConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_validation_catches_bad_arguments() {
        let mut config = ClientConfig::default();
        config.server_address = "no-port".to_string();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.adapter_set = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.recovery_initial = Duration::from_secs(60);
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.recovery_limit = 0;
        assert!(config.validate().is_err());
    }
}
