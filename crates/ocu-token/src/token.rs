//! The ECDH capability the unlock engine depends on.

use zeroize::Zeroizing;

use crate::error::TokenError;

/// Hardware-backed key agreement.
///
/// Calls may block on card I/O or on the operator entering a PIN, so callers
/// on a latency-sensitive task must dispatch them to a worker.
pub trait SecurityToken: Send + Sync {
    /// Perform ECDH between the token's private key and `point`.
    ///
    /// `coord_size` is the curve's coordinate size in bytes (32 for P-256,
    /// 48 for P-384). The returned secret is wiped on drop.
    fn perform_ecdh(
        &self,
        point: &[u8],
        coord_size: usize,
    ) -> Result<Zeroizing<Vec<u8>>, TokenError>;
}

impl<T: SecurityToken + ?Sized> SecurityToken for std::sync::Arc<T> {
    fn perform_ecdh(
        &self,
        point: &[u8],
        coord_size: usize,
    ) -> Result<Zeroizing<Vec<u8>>, TokenError> {
        (**self).perform_ecdh(point, coord_size)
    }
}

impl<T: SecurityToken + ?Sized> SecurityToken for Box<T> {
    fn perform_ecdh(
        &self,
        point: &[u8],
        coord_size: usize,
    ) -> Result<Zeroizing<Vec<u8>>, TokenError> {
        (**self).perform_ecdh(point, coord_size)
    }
}
