//! Link implementation backed by a bounded tokio queue.
//!
//! The receiving half belongs to whatever drives the real telemetry link; the
//! sending half is handed to the registry and the unlock engine.

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::trace;

use crate::framing::TunnelMessage;
use crate::traits::{Link, LinkCommand, LinkError, Outbound};

/// Default depth of the outbound queue.
pub const DEFAULT_LINK_QUEUE_DEPTH: usize = 64;

/// [`Link`] that pushes records onto an mpsc queue without blocking.
#[derive(Clone, Debug)]
pub struct ChannelLink {
    tx: mpsc::Sender<Outbound>,
}

impl ChannelLink {
    /// Create a link and the receiver the transport side drains.
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }

    fn push(&self, record: Outbound) -> Result<(), LinkError> {
        self.tx.try_send(record).map_err(|e| match e {
            TrySendError::Full(_) => LinkError::QueueFull,
            TrySendError::Closed(_) => LinkError::Disconnected,
        })
    }
}

impl Link for ChannelLink {
    fn send_tunnel(&self, message: TunnelMessage) -> Result<(), LinkError> {
        trace!(
            target_component = message.target_component(),
            payload_type = %message.payload_type(),
            len = message.payload_length(),
            "queue tunnel message"
        );
        self.push(Outbound::Tunnel(message))
    }

    fn send_command(&self, target: u8, command: LinkCommand) -> Result<(), LinkError> {
        trace!(target_component = target, command = ?command, "queue link command");
        self.push(Outbound::Command { target, command })
    }
}
