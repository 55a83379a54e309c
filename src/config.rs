//! # Configuration Management
//!
//! Centralized configuration for RPC servers and clients.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables via `from_env()`
//! - Direct instantiation with defaults
//!
//! ## Security Considerations
//! - Encryption is on by default for both sides; a client that requires it
//!   refuses to talk to a plaintext server
//! - The default call deadline (10 s) bounds how long a pending call can pin
//!   resources on a silent peer

use crate::core::serialization::SerializationFormat;
use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Whether to negotiate encryption by default
pub const ENABLE_ENCRYPTION: bool = true;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RpcConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RpcConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `UNI_RPC_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("UNI_RPC_SERVER_NAME") {
            config.server.name = name;
        }

        if let Ok(addr) = std::env::var("UNI_RPC_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(flag) = std::env::var("UNI_RPC_USE_CRYPTO") {
            let use_crypto = parse_bool(&flag).ok_or_else(|| {
                ProtocolError::ConfigError(format!("UNI_RPC_USE_CRYPTO is not a boolean: {flag}"))
            })?;
            config.server.use_crypto = use_crypto;
            config.client.use_crypto = use_crypto;
        }

        if let Ok(ms) = std::env::var("UNI_RPC_DEFAULT_TIMEOUT_MS") {
            let ms = ms.parse::<u64>().map_err(|e| {
                ProtocolError::ConfigError(format!("UNI_RPC_DEFAULT_TIMEOUT_MS: {e}"))
            })?;
            config.client.default_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.logging.validate());

        if self.server.serialization != self.client.serialization {
            errors.push(format!(
                "Server and client serialization differ ({} vs {})",
                self.server.serialization.name(),
                self.client.serialization.name()
            ));
        }

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Name advertised to clients during the handshake
    pub name: String,

    /// Address advertised to clients (and bound by the TCP transport)
    pub address: String,

    /// Require clients to negotiate a session key
    pub use_crypto: bool,

    /// Packet encoding
    #[serde(default)]
    pub serialization: SerializationFormat,

    /// Timeout for graceful server shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: String::from("uni-rpc"),
            address: String::from("127.0.0.1:9000"),
            use_crypto: ENABLE_ENCRYPTION,
            serialization: SerializationFormat::default(),
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.is_empty() {
            errors.push("Server name cannot be empty".to_string());
        }

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if !self.use_crypto {
            errors.push(
                "WARNING: Encryption is disabled - not recommended for production".to_string(),
            );
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Deadline applied to `fire` calls that do not set one
    #[serde(with = "duration_serde")]
    pub default_timeout: Duration,

    /// Offer a public key and refuse plaintext servers
    pub use_crypto: bool,

    /// Packet encoding
    #[serde(default)]
    pub serialization: SerializationFormat,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: timeout::DEFAULT_TIMEOUT,
            use_crypto: ENABLE_ENCRYPTION,
            serialization: SerializationFormat::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.default_timeout.as_millis() < 10 {
            errors.push("Default timeout too short (minimum: 10ms)".to_string());
        } else if self.default_timeout.as_secs() > 3600 {
            errors.push("Default timeout too long (maximum: 1 hour)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("uni-rpc"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Durations as milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        level.as_str().to_lowercase().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Level::from_str(&raw)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {raw}")))
    }
}
