use shared::update::Update;
use shared::DecodeError;
use std::collections::HashMap;
use std::sync::Mutex;

/// Outbound side of a client connection, as the broadcast scheduler
/// sees it. `send` hands a finished payload to the connection layer;
/// `buffered_amount` reports how many bytes that layer still has
/// queued, which is what the scheduler's backpressure check reads.
///
/// Unknown client ids are ignored: a connection can drop between
/// enqueue and flush.
pub trait Transport: Send + Sync {
    fn send(&self, client: &str, payload: String);
    fn buffered_amount(&self, client: &str) -> usize;
}

/// In-process transport that records every payload instead of writing
/// to a socket. Tests drive the engine through it and then inspect the
/// decoded traffic; the fake buffer level makes backpressure testable.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<HashMap<String, Vec<String>>>,
    buffered: Mutex<HashMap<String, usize>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretends the client's socket has this many unsent bytes.
    pub fn set_buffered(&self, client: &str, bytes: usize) {
        self.buffered
            .lock()
            .unwrap()
            .insert(client.to_string(), bytes);
    }

    /// Raw payloads sent to a client so far, oldest first.
    pub fn payloads_to(&self, client: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .get(client)
            .cloned()
            .unwrap_or_default()
    }

    /// Drains and returns the payloads sent to a client.
    pub fn take_payloads(&self, client: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .remove(client)
            .unwrap_or_default()
    }

    /// Every update sent to a client, decoded across all payloads.
    pub fn updates_to(&self, client: &str) -> Result<Vec<Update>, DecodeError> {
        let mut updates = Vec::new();
        for payload in self.payloads_to(client) {
            for unit in shared::decode_batch(&payload) {
                updates.push(unit?);
            }
        }
        Ok(updates)
    }
}

impl Transport for MemoryTransport {
    fn send(&self, client: &str, payload: String) {
        self.sent
            .lock()
            .unwrap()
            .entry(client.to_string())
            .or_default()
            .push(payload);
    }

    fn buffered_amount(&self, client: &str) -> usize {
        self.buffered
            .lock()
            .unwrap()
            .get(client)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_payloads_per_client() {
        let transport = MemoryTransport::new();
        transport.send("a", "one".to_string());
        transport.send("a", "two".to_string());
        transport.send("b", "three".to_string());

        assert_eq!(transport.payloads_to("a"), vec!["one", "two"]);
        assert_eq!(transport.payloads_to("b"), vec!["three"]);
        assert_eq!(transport.take_payloads("a").len(), 2);
        assert!(transport.payloads_to("a").is_empty());
    }

    #[test]
    fn buffer_levels_default_to_zero() {
        let transport = MemoryTransport::new();
        assert_eq!(transport.buffered_amount("ghost"), 0);
        transport.set_buffered("ghost", 9000);
        assert_eq!(transport.buffered_amount("ghost"), 9000);
    }
}
