//! Redis pub/sub transport.
//!
//! Publishing goes through a `MultiplexedConnection`, which is cheap to
//! clone and safe to use concurrently, so no locking is needed. Each
//! subscription opens its own dedicated pub/sub connection and uses
//! PSUBSCRIBE, so every instance sees every other instance's channel as
//! well as its own.
//!
//! Connection parameters are built as a `ConnectionInfo` rather than a URL,
//! so passwords with reserved characters need no escaping.
//!
//! Reconnection is not handled here: a dropped subscription ends its
//! stream and the relay's receive loop logs and exits.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, error, instrument, warn};

use super::{MessageStream, Publisher, Subscriber, TransportMessage};
use crate::config::Config;
use crate::errors::RelayError;

/// Publish handle backed by a multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisPublisher {
    connection: MultiplexedConnection,
}

impl RedisPublisher {
    /// Connect to Redis on the configured publish port.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Transport` if the client cannot be opened or
    /// the connection fails.
    pub async fn connect(config: &Config) -> Result<Self, RelayError> {
        let client = open_client(connection_info(
            &config.host,
            config.pub_port,
            config.password.as_ref(),
        ))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(
                    target: "relay.transport",
                    error = %e,
                    "Failed to connect publisher to Redis"
                );
                RelayError::Transport(format!("Failed to connect to Redis: {e}"))
            })?;

        debug!(target: "relay.transport", "Redis publisher connected");
        Ok(Self { connection })
    }
}

#[async_trait]
impl Publisher for RedisPublisher {
    #[instrument(skip_all, fields(channel = %channel))]
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), RelayError> {
        // Clone the connection (cheap operation) for this request
        let mut conn = self.connection.clone();
        let message: &[u8] = payload.as_ref();

        let receivers: i64 = conn.publish(channel, message).await.map_err(|e| {
            warn!(
                target: "relay.transport",
                error = %e,
                channel = %channel,
                "Failed to publish envelope"
            );
            RelayError::Transport(format!("Failed to publish: {e}"))
        })?;

        debug!(
            target: "relay.transport",
            channel = %channel,
            receivers = receivers,
            bytes = payload.len(),
            "Published envelope"
        );
        Ok(())
    }
}

/// Subscribe handle; every subscription gets a dedicated connection.
#[derive(Clone)]
pub struct RedisSubscriber {
    client: Client,
}

impl RedisSubscriber {
    /// Open a client for the configured subscribe port without
    /// connecting yet.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Transport` if the client cannot be opened.
    pub fn open(config: &Config) -> Result<Self, RelayError> {
        Ok(Self {
            client: open_client(connection_info(
                &config.host,
                config.sub_port,
                config.password.as_ref(),
            ))?,
        })
    }
}

#[async_trait]
impl Subscriber for RedisSubscriber {
    #[instrument(skip_all, fields(pattern = %pattern))]
    async fn subscribe(&self, pattern: &str) -> Result<MessageStream, RelayError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(|e| {
            error!(
                target: "relay.transport",
                error = %e,
                "Failed to open Redis pub/sub connection"
            );
            RelayError::Transport(format!("Failed to open pub/sub connection: {e}"))
        })?;

        pubsub.psubscribe(pattern).await.map_err(|e| {
            error!(
                target: "relay.transport",
                error = %e,
                pattern = %pattern,
                "Failed to subscribe"
            );
            RelayError::Transport(format!("Failed to subscribe to {pattern}: {e}"))
        })?;

        debug!(
            target: "relay.transport",
            pattern = %pattern,
            "Redis subscription established"
        );

        let stream = pubsub.into_on_message().map(|msg| TransportMessage {
            channel: msg.get_channel_name().to_string(),
            payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
        });
        Ok(stream.boxed())
    }
}

fn connection_info(host: &str, port: u16, password: Option<&SecretString>) -> ConnectionInfo {
    ConnectionInfo {
        addr: ConnectionAddr::Tcp(host.to_string(), port),
        redis: RedisConnectionInfo {
            password: password.map(|p| p.expose_secret().to_string()),
            ..RedisConnectionInfo::default()
        },
    }
}

fn open_client(info: ConnectionInfo) -> Result<Client, RelayError> {
    Client::open(info).map_err(|e| {
        // Note: Do NOT log the connection info as it may contain credentials
        error!(
            target: "relay.transport",
            error = %e,
            "Failed to open Redis client"
        );
        RelayError::Transport(format!("Failed to open Redis client: {e}"))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_info_keeps_reserved_password_characters() {
        let password = SecretString::from("p@ss:/word#1".to_string());
        let info = connection_info("10.0.0.5", 6380, Some(&password));

        assert!(matches!(&info.addr, ConnectionAddr::Tcp(host, 6380) if host == "10.0.0.5"));
        assert_eq!(info.redis.password.as_deref(), Some("p@ss:/word#1"));
        assert_eq!(info.redis.db, 0);
        assert!(info.redis.username.is_none());
    }

    #[test]
    fn test_connection_info_without_password() {
        let info = connection_info("127.0.0.1", 6379, None);
        assert!(info.redis.password.is_none());
    }

    #[test]
    fn test_subscriber_uses_sub_port_and_password() {
        let config = Config {
            host: "redis.internal".to_string(),
            pub_port: 7000,
            sub_port: 7001,
            password: Some(SecretString::from("a/b@c".to_string())),
            ..Config::default()
        };

        let subscriber = RedisSubscriber::open(&config).unwrap();
        let info = subscriber.client.get_connection_info();

        assert!(matches!(&info.addr, ConnectionAddr::Tcp(host, 7001) if host == "redis.internal"));
        assert_eq!(info.redis.password.as_deref(), Some("a/b@c"));
    }

    #[tokio::test]
    async fn test_publisher_connect_fails_without_broker() {
        let config = Config {
            pub_port: 1,
            ..Config::default()
        };

        assert!(matches!(
            RedisPublisher::connect(&config).await,
            Err(RelayError::Transport(_))
        ));
    }
}
