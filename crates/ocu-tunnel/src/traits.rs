//! Outbound link abstraction used by the registry and the unlock engine.

use crate::framing::{FramingError, TunnelMessage};

/// Command addressed to a companion component over the telemetry link.
#[derive(Clone, Debug, PartialEq)]
pub enum LinkCommand {
    /// Ask the companion to publish its capability/version record.
    RequestCompanionInfo,
    /// Reboot the companion computer (the autopilot is left alone).
    RebootCompanion,
    /// Inject an external position estimate into the companion's navigation stack.
    ExternalPositionEstimate {
        latitude: f64,
        longitude: f64,
        altitude: f32,
    },
}

/// A record handed to the link layer.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    Tunnel(TunnelMessage),
    Command { target: u8, command: LinkCommand },
}

/// Outbound half of the telemetry link.
///
/// Implementations must only enqueue: callers run on the serialization point
/// and must never block on link I/O.
pub trait Link: Send + Sync {
    /// Queue a tunnel record for delivery.
    fn send_tunnel(&self, message: TunnelMessage) -> Result<(), LinkError>;

    /// Queue a command addressed to `target`.
    fn send_command(&self, target: u8, command: LinkCommand) -> Result<(), LinkError>;
}

/// Common link error type
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("link disconnected")]
    Disconnected,

    #[error("link send queue full")]
    QueueFull,

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
}
