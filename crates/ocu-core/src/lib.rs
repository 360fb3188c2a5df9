//! OCU Core - Companion computer registry and model unlock for the ground station.
//!
//! This crate implements:
//! - Device registry (discovery, metadata, liveness, current selection)
//! - Unlock protocol state machine
//! - Service runtime serializing both behind one task
//! - Configuration and error types
//! - Simulated companions for tests and the demo

#![forbid(unsafe_code)]

// Core state machines
pub mod registry;
pub mod unlock;

// Runtime
pub mod service;

// Supporting modules
pub mod config;
pub mod errors;
pub mod types;
pub mod harness;

pub use config::{CompanionConfig, ConfigError};
pub use errors::{CoreError, RegistryError, ServiceError, StartError, UnlockFailure};
pub use registry::{CompanionDevice, DeviceRegistry, RegistryConfig, RegistryEvent};
pub use service::{CompanionHandle, CompanionService, ServiceEvent};
pub use types::{CompanionInfo, ComponentId, NO_DEVICE, VENDOR_MODULE_ID};
pub use unlock::{KeyRequest, UnlockEngine, UnlockEvent, UnlockState, UnlockStep};
