//! Wire envelope exchanged between relay instances.
//!
//! JSON with camelCase keys and an internal `type` tag:
//!
//! ```json
//! {"originId":"3f9c2a1b7d4e","namespace":"/","type":"broadcast",
//!  "payload":{"type":2,"data":["chat","hi"]},
//!  "selection":{"rooms":["lobby"],"except":[],"flags":{}}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broadcaster::BroadcastSelection;
use crate::errors::RelayError;
use crate::membership::ConnectionId;

/// One relayed event, stamped with the publishing instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub origin_id: String,
    pub namespace: String,
    #[serde(flatten)]
    pub event: RelayEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RelayEvent {
    Broadcast {
        payload: Value,
        #[serde(default)]
        selection: BroadcastSelection,
    },
    TargetedEmit {
        #[serde(rename = "targetId")]
        target_id: ConnectionId,
        #[serde(rename = "eventName")]
        event_name: String,
        #[serde(rename = "eventArgs", default)]
        event_args: Vec<Value>,
    },
}

impl Envelope {
    #[must_use]
    pub fn broadcast(
        origin_id: impl Into<String>,
        namespace: impl Into<String>,
        payload: Value,
        selection: BroadcastSelection,
    ) -> Self {
        Self {
            origin_id: origin_id.into(),
            namespace: namespace.into(),
            event: RelayEvent::Broadcast { payload, selection },
        }
    }

    #[must_use]
    pub fn targeted_emit(
        origin_id: impl Into<String>,
        namespace: impl Into<String>,
        target_id: impl Into<ConnectionId>,
        event_name: impl Into<String>,
        event_args: Vec<Value>,
    ) -> Self {
        Self {
            origin_id: origin_id.into(),
            namespace: namespace.into(),
            event: RelayEvent::TargetedEmit {
                target_id: target_id.into(),
                event_name: event_name.into(),
                event_args,
            },
        }
    }

    /// Bounded label used in logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self.event {
            RelayEvent::Broadcast { .. } => "broadcast",
            RelayEvent::TargetedEmit { .. } => "targeted_emit",
        }
    }

    /// Serialize to wire bytes.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::MalformedEnvelope` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, RelayError> {
        serde_json::to_vec(self)
            .map_err(|e| RelayError::MalformedEnvelope(format!("Failed to encode envelope: {e}")))
    }

    /// Parse wire bytes.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::MalformedEnvelope` for invalid JSON, missing
    /// fields or an unknown `type`.
    pub fn decode(bytes: &[u8]) -> Result<Self, RelayError> {
        serde_json::from_slice(bytes)
            .map_err(|e| RelayError::MalformedEnvelope(format!("Failed to decode envelope: {e}")))
    }
}
