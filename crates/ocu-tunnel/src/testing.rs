//! Testing utilities for link consumers.

use crate::framing::{PayloadType, TunnelMessage};
use crate::traits::{Link, LinkCommand, LinkError, Outbound};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Mock link recording every outbound record
pub struct MockLink {
    sent: Mutex<Vec<Outbound>>,
    connected: AtomicBool,
}

impl MockLink {
    /// Create a new connected mock link
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        }
    }

    /// Get every record sent so far
    pub fn get_sent(&self) -> Vec<Outbound> {
        self.sent.lock().clone()
    }

    /// Tunnel records only
    pub fn sent_tunnel(&self) -> Vec<TunnelMessage> {
        self.sent
            .lock()
            .iter()
            .filter_map(|o| match o {
                Outbound::Tunnel(m) => Some(m.clone()),
                Outbound::Command { .. } => None,
            })
            .collect()
    }

    /// Tunnel records of one payload type
    pub fn sent_of_type(&self, payload_type: PayloadType) -> Vec<TunnelMessage> {
        self.sent_tunnel()
            .into_iter()
            .filter(|m| m.payload_type() == payload_type)
            .collect()
    }

    /// Commands only, as `(target, command)`
    pub fn sent_commands(&self) -> Vec<(u8, LinkCommand)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|o| match o {
                Outbound::Command { target, command } => Some((*target, command.clone())),
                Outbound::Tunnel(_) => None,
            })
            .collect()
    }

    /// Clear sent records
    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Simulate disconnect
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    /// Simulate connect
    pub fn connect(&self) {
        self.connected.store(true, Ordering::Relaxed);
    }

    fn record(&self, record: Outbound) -> Result<(), LinkError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(LinkError::Disconnected);
        }
        self.sent.lock().push(record);
        Ok(())
    }
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl Link for MockLink {
    fn send_tunnel(&self, message: TunnelMessage) -> Result<(), LinkError> {
        self.record(Outbound::Tunnel(message))
    }

    fn send_command(&self, target: u8, command: LinkCommand) -> Result<(), LinkError> {
        self.record(Outbound::Command { target, command })
    }
}
