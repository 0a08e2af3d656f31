//! Relay configuration.
//!
//! Configuration is loaded from environment variables. The transport
//! password is redacted in Debug output.

use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use thiserror::Error;

/// Default transport host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default port of the publish connection.
pub const DEFAULT_PUB_PORT: u16 = 6379;

/// Default port of the subscribe connection.
pub const DEFAULT_SUB_PORT: u16 = 6379;

/// Default topic key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "room-relay";

/// Default number of envelopes waiting to be published.
pub const DEFAULT_PUBLISH_QUEUE_CAPACITY: usize = 1024;

/// Separator between the key prefix and the origin id in a topic key.
pub const TOPIC_SEPARATOR: char = '#';

/// Relay configuration.
#[derive(Clone)]
pub struct Config {
    /// Transport host (default: "127.0.0.1").
    pub host: String,

    /// Port of the publish connection (default: 6379).
    pub pub_port: u16,

    /// Port of the subscribe connection (default: 6379).
    pub sub_port: u16,

    /// Topic key prefix shared by all instances (default: "room-relay").
    pub key_prefix: String,

    /// Unique identifier of this process instance, stamped on every
    /// published envelope.
    pub origin_id: String,

    /// Optional transport password.
    pub password: Option<SecretString>,

    /// Envelopes that may wait for the publisher task before new ones are
    /// rejected (default: 1024).
    pub publish_queue_capacity: usize,
}

/// Custom Debug implementation that redacts the password.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("pub_port", &self.pub_port)
            .field("sub_port", &self.sub_port)
            .field("key_prefix", &self.key_prefix)
            .field("origin_id", &self.origin_id)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("publish_queue_capacity", &self.publish_queue_capacity)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            pub_port: DEFAULT_PUB_PORT,
            sub_port: DEFAULT_SUB_PORT,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            origin_id: generate_origin_id(),
            password: None,
            publish_queue_capacity: DEFAULT_PUBLISH_QUEUE_CAPACITY,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let host = vars
            .get("RELAY_HOST")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HOST.to_string());

        let pub_port = parse_port(vars, "RELAY_PUB_PORT", DEFAULT_PUB_PORT)?;
        let sub_port = parse_port(vars, "RELAY_SUB_PORT", DEFAULT_SUB_PORT)?;

        let key_prefix = vars
            .get("RELAY_KEY_PREFIX")
            .cloned()
            .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());

        if key_prefix.is_empty() || key_prefix.contains(TOPIC_SEPARATOR) {
            return Err(ConfigError::InvalidValue(format!(
                "RELAY_KEY_PREFIX must be non-empty and must not contain '{TOPIC_SEPARATOR}'"
            )));
        }

        let origin_id = vars
            .get("RELAY_ORIGIN_ID")
            .cloned()
            .unwrap_or_else(generate_origin_id);

        if origin_id.is_empty() {
            return Err(ConfigError::InvalidValue(
                "RELAY_ORIGIN_ID must not be empty".to_string(),
            ));
        }

        let password = vars
            .get("RELAY_REDIS_PASSWORD")
            .map(|p| SecretString::from(p.clone()));

        let publish_queue_capacity = match vars.get("RELAY_PUBLISH_QUEUE_CAPACITY") {
            Some(value) => value.parse::<usize>().ok().filter(|c| *c > 0).ok_or_else(|| {
                ConfigError::InvalidValue(format!(
                    "RELAY_PUBLISH_QUEUE_CAPACITY={value} must be a positive integer"
                ))
            })?,
            None => DEFAULT_PUBLISH_QUEUE_CAPACITY,
        };

        Ok(Config {
            host,
            pub_port,
            sub_port,
            key_prefix,
            origin_id,
            password,
            publish_queue_capacity,
        })
    }

    /// Topic key this instance publishes on: `<prefix>#<origin_id>`.
    #[must_use]
    pub fn publish_channel(&self) -> String {
        format!("{}{TOPIC_SEPARATOR}{}", self.key_prefix, self.origin_id)
    }

    /// Pattern every instance subscribes to: `<prefix>#*`.
    #[must_use]
    pub fn subscribe_pattern(&self) -> String {
        format!("{}{TOPIC_SEPARATOR}*", self.key_prefix)
    }
}

/// Generate a fresh origin id (12 hex chars of a v4 UUID).
#[must_use]
pub fn generate_origin_id() -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    simple.get(..12).unwrap_or(&simple).to_string()
}

fn parse_port(
    vars: &HashMap<String, String>,
    name: &str,
    default: u16,
) -> Result<u16, ConfigError> {
    match vars.get(name) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={value} is not a valid port"))),
        None => Ok(default),
    }
}
