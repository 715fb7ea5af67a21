//! Client configuration
//!
//! Loaded from TOML. Secrets are never stored in the file: the password is
//! named by an environment variable and resolved at connect time.

use crate::comms::BufferOptions;
use crate::session::DEFAULT_MAX_IN_FLIGHT;
use crate::transport::tcp::parse_server_uri;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Upper bound on an encoded client identifier
pub const MAX_CLIENT_ID_BYTES: usize = 65535;

/// Top-level client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub connection: ConnectionSection,
    #[serde(default)]
    pub persistence: PersistenceSection,
    #[serde(default)]
    pub buffer: BufferOptions,
}

/// `[connection]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSection {
    /// Server URI, e.g. `tcp://broker.local:1883`
    pub server_uri: String,
    /// Client identifier; empty means generate one
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u16,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u16,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_quiesce_timeout_ms")]
    pub quiesce_timeout_ms: u64,
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
    /// Defer PUBACK / PUBCOMP until the application acknowledges
    #[serde(default)]
    pub manual_acks: bool,
    pub username: Option<String>,
    /// Environment variable containing the password
    pub password_env: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_keep_alive_secs() -> u16 {
    60
}

fn default_max_in_flight() -> u16 {
    DEFAULT_MAX_IN_FLIGHT
}

fn default_connection_timeout_secs() -> u64 {
    30
}

fn default_quiesce_timeout_ms() -> u64 {
    30_000
}

fn default_disconnect_timeout_ms() -> u64 {
    10_000
}

/// Durable store backing the session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceKind {
    #[default]
    Memory,
    File,
}

/// `[persistence]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PersistenceSection {
    #[serde(default)]
    pub kind: PersistenceKind,
    /// Base directory for the file store
    pub directory: Option<PathBuf>,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid client ID: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Configuration with defaults for everything but the server
    pub fn new(server_uri: impl Into<String>) -> Self {
        Self {
            connection: ConnectionSection {
                server_uri: server_uri.into(),
                client_id: String::new(),
                clean_session: true,
                keep_alive_secs: default_keep_alive_secs(),
                max_in_flight: default_max_in_flight(),
                connection_timeout_secs: default_connection_timeout_secs(),
                quiesce_timeout_ms: default_quiesce_timeout_ms(),
                disconnect_timeout_ms: default_disconnect_timeout_ms(),
                manual_acks: false,
                username: None,
                password_env: None,
            },
            persistence: PersistenceSection::default(),
            buffer: BufferOptions::default(),
        }
    }

    /// Load, complete and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse, complete and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: ClientConfig = toml::from_str(content)?;
        config.ensure_client_id();
        config.validate()?;
        Ok(config)
    }

    /// Generate a client id when none was configured
    pub fn ensure_client_id(&mut self) {
        if self.connection.client_id.is_empty() {
            self.connection.client_id = generate_client_id();
        }
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_client_id(&self.connection.client_id)?;

        if self.connection.max_in_flight == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_in_flight must be between 1 and 65535".to_string(),
            ));
        }

        parse_server_uri(&self.connection.server_uri)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        if self.persistence.kind == PersistenceKind::File && self.persistence.directory.is_none() {
            return Err(ConfigError::InvalidConfig(
                "file persistence requires [persistence] directory".to_string(),
            ));
        }

        if self.buffer.enabled && self.buffer.size == 0 {
            return Err(ConfigError::InvalidConfig(
                "buffer size must be greater than zero when buffering is enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Password from the configured environment variable
    pub fn password(&self) -> Result<Option<String>, ConfigError> {
        match &self.connection.password_env {
            Some(name) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.clone())),
            None => Ok(None),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(u64::from(self.connection.keep_alive_secs))
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.connection_timeout_secs)
    }

    pub fn quiesce_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.quiesce_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.disconnect_timeout_ms)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[connection]
server_uri = "tcp://localhost:1883"
client_id = "test-client"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// `mqtt-` followed by a random UUID
pub fn generate_client_id() -> String {
    format!("mqtt-{}", uuid::Uuid::new_v4().simple())
}

fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    if client_id.is_empty() {
        return Err(ConfigError::InvalidClientId(
            "client ID must not be empty".to_string(),
        ));
    }
    if client_id.len() > MAX_CLIENT_ID_BYTES {
        return Err(ConfigError::InvalidClientId(format!(
            "client ID is {} bytes, limit is {MAX_CLIENT_ID_BYTES}",
            client_id.len()
        )));
    }
    if client_id.contains('\0') {
        return Err(ConfigError::InvalidClientId(
            "client ID must not contain NUL".to_string(),
        ));
    }
    Ok(())
}
