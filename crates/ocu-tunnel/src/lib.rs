//! Tunnel framing and outbound link abstractions for companion computers.
//!
//! This crate describes the fixed-size tunnel record carried over the
//! vehicle's telemetry link and the non-blocking outbound queue the rest of
//! the station uses to reach companion computers. The link layer itself lives
//! outside this workspace.

pub mod traits;
pub mod framing;
pub mod channel;
pub mod testing;

pub use traits::*;
pub use framing::*;
pub use channel::*;
pub use testing::*;
