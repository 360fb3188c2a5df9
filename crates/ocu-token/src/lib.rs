#![forbid(unsafe_code)]

//! Security token capability for the companion unlock handshake.
//!
//! This crate provides:
//! - The [`SecurityToken`] ECDH capability the unlock engine calls
//! - An OpenPGP card driver that performs the ECDH on a hardware token
//! - Lazy token opening with retry on the next call
//! - Test doubles for tokens and card channels

pub mod error;
pub mod token;
pub mod apdu;
pub mod openpgp;
pub mod testing;

pub use error::TokenError;
pub use openpgp::{CardChannel, LazyToken, OpenPgpToken};
pub use token::SecurityToken;
