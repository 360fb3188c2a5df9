//! Fixed-size tunnel record and its byte layout.
//!
//! Wire layout (132 bytes):
//! `target_component (u8) || payload_type (u16 LE) || payload_length (u8) || payload[128]`
//!
//! Only the first `payload_length` bytes of the payload are significant; the
//! remainder of the buffer is zero padded on encode and ignored on decode.

use bytes::{Buf, BufMut};
use std::fmt;
use thiserror::Error;

/// Capacity of the tunnel payload buffer.
pub const TUNNEL_PAYLOAD_CAPACITY: usize = 128;

/// Size of an encoded tunnel record.
pub const TUNNEL_FRAME_SIZE: usize = 1 + 2 + 1 + TUNNEL_PAYLOAD_CAPACITY;

/// Size of the operator's signed token.
pub const SIGNED_TOKEN_SIZE: usize = 128;

/// Size of the device's blinded challenge.
pub const BLINDED_CHALLENGE_SIZE: usize = 32;

/// Size of the unlock key sent back to the device.
pub const UNLOCK_KEY_SIZE: usize = 128;

/// Framing error
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("payload too large: {0} bytes (max: {1})")]
    PayloadTooLarge(usize, usize),

    #[error("incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    #[error("invalid payload length field: {0}")]
    InvalidLength(u8),
}

/// Tunnel payload type tag.
///
/// The tunnel is shared with unrelated application traffic, so unknown tags
/// are preserved as [`PayloadType::Other`] instead of being rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PayloadType {
    /// Operator's 128-byte signed token (station -> device).
    SignedToken,
    /// Device's 32-byte blinded challenge (device -> station).
    BlindedChallenge,
    /// 128-byte unlock key derived by the security token (station -> device).
    UnlockKeyResponse,
    /// Device confirms the model is unlocked (device -> station).
    Ack,
    /// Any other tunnel payload type.
    Other(u16),
}

impl PayloadType {
    pub const SIGNED_TOKEN: u16 = 43;
    pub const BLINDED_CHALLENGE: u16 = 44;
    pub const UNLOCK_KEY_RESPONSE: u16 = 45;
    pub const ACK: u16 = 46;

    pub fn from_wire(value: u16) -> Self {
        match value {
            Self::SIGNED_TOKEN => PayloadType::SignedToken,
            Self::BLINDED_CHALLENGE => PayloadType::BlindedChallenge,
            Self::UNLOCK_KEY_RESPONSE => PayloadType::UnlockKeyResponse,
            Self::ACK => PayloadType::Ack,
            other => PayloadType::Other(other),
        }
    }

    pub fn to_wire(self) -> u16 {
        match self {
            PayloadType::SignedToken => Self::SIGNED_TOKEN,
            PayloadType::BlindedChallenge => Self::BLINDED_CHALLENGE,
            PayloadType::UnlockKeyResponse => Self::UNLOCK_KEY_RESPONSE,
            PayloadType::Ack => Self::ACK,
            PayloadType::Other(value) => value,
        }
    }

    /// Fixed payload size for the sized protocol messages.
    pub fn expected_len(self) -> Option<usize> {
        match self {
            PayloadType::SignedToken => Some(SIGNED_TOKEN_SIZE),
            PayloadType::BlindedChallenge => Some(BLINDED_CHALLENGE_SIZE),
            PayloadType::UnlockKeyResponse => Some(UNLOCK_KEY_SIZE),
            PayloadType::Ack | PayloadType::Other(_) => None,
        }
    }

    /// Whether this tag belongs to the unlock handshake.
    pub fn is_unlock_protocol(self) -> bool {
        !matches!(self, PayloadType::Other(_))
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadType::SignedToken => write!(f, "signed_token"),
            PayloadType::BlindedChallenge => write!(f, "blinded_challenge"),
            PayloadType::UnlockKeyResponse => write!(f, "unlock_key_response"),
            PayloadType::Ack => write!(f, "ack"),
            PayloadType::Other(value) => write!(f, "other({})", value),
        }
    }
}

/// A single tunnel record addressed to a companion component.
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelMessage {
    target_component: u8,
    payload_type: PayloadType,
    payload_length: u8,
    payload: [u8; TUNNEL_PAYLOAD_CAPACITY],
}

impl TunnelMessage {
    /// Build a record, rejecting payloads that do not fit the wire buffer.
    pub fn new(
        target_component: u8,
        payload_type: PayloadType,
        payload: &[u8],
    ) -> Result<Self, FramingError> {
        if payload.len() > TUNNEL_PAYLOAD_CAPACITY {
            return Err(FramingError::PayloadTooLarge(
                payload.len(),
                TUNNEL_PAYLOAD_CAPACITY,
            ));
        }

        let mut buf = [0u8; TUNNEL_PAYLOAD_CAPACITY];
        buf[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            target_component,
            payload_type,
            payload_length: payload.len() as u8,
            payload: buf,
        })
    }

    pub fn target_component(&self) -> u8 {
        self.target_component
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    pub fn payload_length(&self) -> usize {
        self.payload_length as usize
    }

    /// The significant payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_length as usize]
    }

    /// Encode into the fixed 132-byte wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TUNNEL_FRAME_SIZE);
        out.put_u8(self.target_component);
        out.put_u16_le(self.payload_type.to_wire());
        out.put_u8(self.payload_length);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a record from its wire form.
    pub fn decode(frame: &[u8]) -> Result<Self, FramingError> {
        if frame.len() < TUNNEL_FRAME_SIZE {
            return Err(FramingError::Incomplete(TUNNEL_FRAME_SIZE - frame.len()));
        }

        let mut buf = frame;
        let target_component = buf.get_u8();
        let payload_type = PayloadType::from_wire(buf.get_u16_le());
        let payload_length = buf.get_u8();
        if payload_length as usize > TUNNEL_PAYLOAD_CAPACITY {
            return Err(FramingError::InvalidLength(payload_length));
        }

        let mut payload = [0u8; TUNNEL_PAYLOAD_CAPACITY];
        payload[..payload_length as usize].copy_from_slice(&buf[..payload_length as usize]);
        Ok(Self {
            target_component,
            payload_type,
            payload_length,
            payload,
        })
    }
}

// Payloads carry key material; only the shape is printed.
impl fmt::Debug for TunnelMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelMessage")
            .field("target_component", &self.target_component)
            .field("payload_type", &self.payload_type)
            .field("payload_length", &self.payload_length)
            .finish_non_exhaustive()
    }
}
