//! Room relay error types.
//!
//! Membership operations never fail. Errors here belong to a single
//! broadcast or emit call and are returned to that call's caller; errors
//! inside the transport receive loop are logged and never surface.

use thiserror::Error;

/// Room relay error type.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The packet encoder rejected a payload.
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Delivery to a single connection failed.
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Publishing or subscribing on the pub/sub transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An envelope could not be serialized or decoded.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// A broadcast payload is not a packet object.
    #[error("Incorrect packet received: {0}")]
    IncorrectPacket(String),

    /// The relay's background tasks were already started.
    #[error("Relay already started")]
    AlreadyStarted,
}

/// Errors produced by a [`crate::delivery::PacketEncoder`].
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The payload cannot be represented on the wire.
    #[error("unencodable payload: {0}")]
    Unencodable(String),

    /// Serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors produced by a [`crate::delivery::Connection`].
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The connection closed before the packet could be queued.
    #[error("connection {0} closed")]
    Closed(String),

    /// The connection's outbound queue is full.
    #[error("connection {0} backed up")]
    BackedUp(String),

    /// Any other failure reported by the connection runtime.
    #[error("connection {connection_id}: {reason}")]
    Failed {
        connection_id: String,
        reason: String,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", RelayError::Transport("connection reset".to_string())),
            "Transport error: connection reset"
        );

        assert_eq!(
            format!(
                "{}",
                RelayError::Delivery(DeliveryError::Closed("conn-1".to_string()))
            ),
            "Delivery error: connection conn-1 closed"
        );

        assert_eq!(
            format!(
                "{}",
                RelayError::Encode(EncodeError::Unencodable("binary blob".to_string()))
            ),
            "Encode error: unencodable payload: binary blob"
        );
    }

    #[test]
    fn test_from_conversions() {
        let err: RelayError = DeliveryError::BackedUp("conn-2".to_string()).into();
        assert!(matches!(err, RelayError::Delivery(DeliveryError::BackedUp(_))));

        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: RelayError = EncodeError::from(json_err).into();
        assert!(matches!(err, RelayError::Encode(EncodeError::Serialization(_))));
    }
}
