//! Mock packet encoders.

use std::sync::atomic::{AtomicUsize, Ordering};

use room_relay::delivery::{EncodedPacket, JsonPacketEncoder, PacketEncoder};
use room_relay::errors::EncodeError;
use serde_json::Value;

/// Encodes with `JsonPacketEncoder` and counts calls.
#[derive(Debug, Default)]
pub struct CountingEncoder {
    calls: AtomicUsize,
}

impl CountingEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PacketEncoder for CountingEncoder {
    fn encode(&self, namespace: &str, payload: &Value) -> Result<EncodedPacket, EncodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        JsonPacketEncoder.encode(namespace, payload)
    }
}

/// Rejects every payload.
#[derive(Debug, Default)]
pub struct FailingEncoder;

impl PacketEncoder for FailingEncoder {
    fn encode(&self, _namespace: &str, _payload: &Value) -> Result<EncodedPacket, EncodeError> {
        Err(EncodeError::Unencodable(
            "mock encoder rejects every payload".to_string(),
        ))
    }
}
