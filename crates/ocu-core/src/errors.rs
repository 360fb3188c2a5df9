//! Error types for the companion registry and unlock engine.
//!
//! Errors fall into four groups:
//! - input validation (rejected synchronously, nothing mutated)
//! - protocol errors (the current unlock session fails and returns to Idle)
//! - external dependency errors (token or link), surfaced like protocol errors
//! - timeouts
//!
//! None of them is fatal to the process.

use ocu_token::TokenError;
use ocu_tunnel::LinkError;
use thiserror::Error;

use crate::config::ConfigError;

// ============================================================================
// Unlock Errors
// ============================================================================

/// Reasons `start` rejects a new unlock session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StartError {
    /// The registry has no current companion device
    #[error("no companion device selected")]
    NoDeviceSelected,

    /// The signed token is not exactly 128 bytes
    #[error("invalid token size: {got} bytes, expected {expected}")]
    InvalidTokenSize { got: usize, expected: usize },

    /// A session is in progress or completed and not yet reset
    #[error("unlock session already in progress")]
    SessionAlreadyActive,

    /// The link refused the signed token
    #[error("link refused signed token: {0}")]
    Link(#[from] LinkError),
}

/// Terminal failure of an unlock session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnlockFailure {
    /// Wrong message type or size while awaiting the challenge
    #[error("invalid challenge")]
    InvalidChallenge,

    /// The security token failed or returned a key of the wrong size
    #[error("key derivation failed: {reason}")]
    KeyDerivationFailed { reason: String },

    /// No completion within the session deadline
    #[error("timeout")]
    Timeout,

    /// The link refused the unlock key
    #[error("link unavailable: {0}")]
    LinkUnavailable(LinkError),

    /// The target stopped being the current device mid-session
    #[error("current companion device changed")]
    DeviceChanged,
}

impl UnlockFailure {
    /// Stable diagnostic code for operator-facing reporting.
    pub fn code(&self) -> &'static str {
        match self {
            UnlockFailure::InvalidChallenge => "invalid_challenge",
            UnlockFailure::KeyDerivationFailed { .. } => "key_derivation_failed",
            UnlockFailure::Timeout => "timeout",
            UnlockFailure::LinkUnavailable(_) => "link_unavailable",
            UnlockFailure::DeviceChanged => "device_changed",
        }
    }

    pub(crate) fn from_token(error: &TokenError) -> Self {
        UnlockFailure::KeyDerivationFailed {
            reason: error.to_string(),
        }
    }
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors from registry commands addressed to the current device.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No companion device is currently selected
    #[error("no current companion device")]
    NoCurrentDevice,

    /// The link refused the command
    #[error("link error: {0}")]
    Link(#[from] LinkError),
}

// ============================================================================
// Service Errors
// ============================================================================

/// Errors from the service handle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The service task has stopped
    #[error("companion service stopped")]
    Stopped,
}

// ============================================================================
// Unified Core Error
// ============================================================================

/// Unified error type for ocu-core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("start error: {0}")]
    Start(#[from] StartError),

    #[error("unlock failed: {0}")]
    Unlock(#[from] UnlockFailure),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("service error: {0}")]
    Service(#[from] ServiceError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("token error: {0}")]
    Token(#[from] TokenError),
}

impl CoreError {
    /// Whether the error carries detail worth a warn-level log.
    pub fn should_log_details(&self) -> bool {
        !matches!(
            self,
            CoreError::Start(StartError::SessionAlreadyActive) | CoreError::Unlock(UnlockFailure::Timeout)
        )
    }
}
