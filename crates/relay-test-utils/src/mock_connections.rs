//! Mock connections for relay testing.
//!
//! `MockConnection` records every packet and event it receives and can be
//! switched into a failing state. `MockConnectionDirectory` is the lookup
//! table the relay resolves connection ids through.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use room_relay::delivery::{Connection, ConnectionDirectory, DeliveryOptions, EncodedPacket};
use room_relay::errors::DeliveryError;
use serde_json::Value;

/// A connection that records what it receives.
#[derive(Debug)]
pub struct MockConnection {
    id: String,
    packets: Mutex<Vec<(EncodedPacket, DeliveryOptions)>>,
    events: Mutex<Vec<(String, Vec<Value>)>>,
    failing: AtomicBool,
}

impl MockConnection {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            packets: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Make every subsequent delivery and emit fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    #[must_use]
    pub fn packets(&self) -> Vec<(EncodedPacket, DeliveryOptions)> {
        self.packets.lock().unwrap().clone()
    }

    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.packets.lock().unwrap().len()
    }

    #[must_use]
    pub fn events(&self) -> Vec<(String, Vec<Value>)> {
        self.events.lock().unwrap().clone()
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Decode the JSON payloads of the received packets.
    ///
    /// Assumes packets produced by `JsonPacketEncoder` (a `data` field
    /// inside a single-part frame).
    #[must_use]
    pub fn payloads(&self) -> Vec<Value> {
        self.packets
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(packet, _)| packet.parts().first())
            .map(|part| {
                let frame: Value = serde_json::from_slice(part).expect("packet is not JSON");
                frame.get("data").cloned().unwrap_or(Value::Null)
            })
            .collect()
    }
}

impl Connection for MockConnection {
    fn deliver(&self, packet: &EncodedPacket, options: DeliveryOptions) -> Result<(), DeliveryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::Failed {
                connection_id: self.id.clone(),
                reason: "mock connection set to fail".to_string(),
            });
        }
        self.packets.lock().unwrap().push((packet.clone(), options));
        Ok(())
    }

    fn emit(&self, event: &str, args: &[Value]) -> Result<(), DeliveryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::Failed {
                connection_id: self.id.clone(),
                reason: "mock connection set to fail".to_string(),
            });
        }
        self.events
            .lock()
            .unwrap()
            .push((event.to_string(), args.to_vec()));
        Ok(())
    }
}

/// Directory of mock connections.
#[derive(Debug, Default)]
pub struct MockConnectionDirectory {
    connections: Mutex<HashMap<String, Arc<MockConnection>>>,
}

impl MockConnectionDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live connection and return a handle to it.
    pub fn connect(&self, id: &str) -> Arc<MockConnection> {
        let connection = Arc::new(MockConnection::new(id));
        self.connections
            .lock()
            .unwrap()
            .insert(id.to_string(), Arc::clone(&connection));
        connection
    }

    /// Remove a connection; the relay will treat it as gone.
    pub fn disconnect(&self, id: &str) -> Option<Arc<MockConnection>> {
        self.connections.lock().unwrap().remove(id)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<MockConnection>> {
        self.connections.lock().unwrap().get(id).cloned()
    }

    /// Packets delivered across every connection.
    #[must_use]
    pub fn total_packets(&self) -> usize {
        self.connections
            .lock()
            .unwrap()
            .values()
            .map(|c| c.packet_count())
            .sum()
    }
}

impl ConnectionDirectory for MockConnectionDirectory {
    fn lookup(&self, connection_id: &str) -> Option<Arc<dyn Connection>> {
        self.get(connection_id)
            .map(|connection| connection as Arc<dyn Connection>)
    }
}
