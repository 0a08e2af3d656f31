//! Interfaces to the connection-management runtime and the packet encoder.
//!
//! The relay never owns live connections. It looks them up through a
//! [`ConnectionDirectory`] and hands them pre-encoded packets produced by a
//! [`PacketEncoder`]. Both are implemented by the embedding server.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{DeliveryError, EncodeError};

/// Per-broadcast delivery hints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastFlags {
    /// The connection may drop the packet instead of queueing it when its
    /// transport is backed up.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub volatile: bool,

    /// Hint to compress the packet on the wire.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compress: bool,
}

impl BroadcastFlags {
    #[must_use]
    pub fn volatile() -> Self {
        Self {
            volatile: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn compressed() -> Self {
        Self {
            compress: true,
            ..Self::default()
        }
    }
}

/// Options passed along with every delivery request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryOptions {
    /// The packet is already encoded; the connection must not re-encode it.
    pub pre_encoded: bool,
    pub volatile: bool,
    pub compress: bool,
}

impl From<BroadcastFlags> for DeliveryOptions {
    fn from(flags: BroadcastFlags) -> Self {
        Self {
            pre_encoded: true,
            volatile: flags.volatile,
            compress: flags.compress,
        }
    }
}

/// Output of one encode pass: one or more wire-ready parts.
///
/// Cloning is cheap; every part is reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    parts: Vec<Bytes>,
}

impl EncodedPacket {
    #[must_use]
    pub fn new(parts: Vec<Bytes>) -> Self {
        Self { parts }
    }

    #[must_use]
    pub fn single(part: impl Into<Bytes>) -> Self {
        Self {
            parts: vec![part.into()],
        }
    }

    #[must_use]
    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    /// Total encoded size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parts.iter().map(Bytes::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(Bytes::is_empty)
    }
}

/// A live connection owned by the connection-management runtime.
///
/// Both methods only enqueue; they must not block on network I/O.
pub trait Connection: Send + Sync {
    /// Queue a pre-encoded packet.
    fn deliver(&self, packet: &EncodedPacket, options: DeliveryOptions)
        -> Result<(), DeliveryError>;

    /// Emit a named event with arguments, encoded by the connection itself.
    fn emit(&self, event: &str, args: &[Value]) -> Result<(), DeliveryError>;
}

/// Lookup of live connections in one namespace.
pub trait ConnectionDirectory: Send + Sync {
    /// Returns the live connection for `connection_id`, if any.
    fn lookup(&self, connection_id: &str) -> Option<Arc<dyn Connection>>;
}

/// Serializes an application event into wire-ready parts.
pub trait PacketEncoder: Send + Sync {
    fn encode(&self, namespace: &str, payload: &Value) -> Result<EncodedPacket, EncodeError>;
}

/// Encodes packets as a single JSON text frame: `{"nsp": ..., "data": ...}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPacketEncoder;

impl PacketEncoder for JsonPacketEncoder {
    fn encode(&self, namespace: &str, payload: &Value) -> Result<EncodedPacket, EncodeError> {
        #[derive(Serialize)]
        struct Frame<'a> {
            nsp: &'a str,
            data: &'a Value,
        }

        let bytes = serde_json::to_vec(&Frame {
            nsp: namespace,
            data: payload,
        })?;
        Ok(EncodedPacket::single(bytes))
    }
}
