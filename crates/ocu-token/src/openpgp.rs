//! OpenPGP card driver exposing the token's decryption key as an ECDH capability.
//!
//! The card is reached through a [`CardChannel`] (PC/SC or similar); this
//! module only builds the command APDUs and interprets the responses:
//!
//! 1. SELECT the OpenPGP applet
//! 2. GET DATA for the PW status bytes
//! 3. VERIFY the user PIN against PW2 and then PW1
//! 4. PSO:DECIPHER with the peer's public point wrapped in a cipher DO

use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::apdu::{split_status, Apdu};
use crate::error::TokenError;
use crate::token::SecurityToken;

/// OpenPGP applet identifier (RID + PIX prefix).
pub const OPENPGP_AID: [u8; 6] = [0xD2, 0x76, 0x00, 0x01, 0x24, 0x01];

/// PW2 reference (user PIN for decipher operations).
pub const PW2_REF: u8 = 0x82;

/// PW1 reference (user PIN for signing).
pub const PW1_REF: u8 = 0x81;

/// Uncompressed SEC1 point marker.
const UNCOMPRESSED_POINT: u8 = 0x04;

/// Raw command channel to a smart card.
pub trait CardChannel: Send {
    /// Send one APDU and return the full response including the status word.
    fn transmit(&mut self, apdu: &[u8]) -> Result<Vec<u8>, TokenError>;
}

fn select_applet() -> Apdu {
    Apdu::new(0x00, 0xA4, 0x04, 0x00).with_data(OPENPGP_AID.to_vec())
}

fn get_pw_status() -> Apdu {
    Apdu::new(0x00, 0xCA, 0x00, 0xC4).with_le(0x00)
}

fn verify_pin(reference: u8, pin: &[u8]) -> Apdu {
    Apdu::new(0x00, 0x20, 0x00, reference).with_data(pin.to_vec())
}

/// Cipher DO prefix for a public point of `point_size` coordinate bytes:
/// `A6 L1 7F49 L2 86 L3`.
fn cipher_do_prefix(point_size: usize) -> Result<[u8; 7], TokenError> {
    let point_tag_len = point_size + 1;
    let pubkey_do_len = 2 + point_tag_len;
    let outer_len = 3 + pubkey_do_len;
    if outer_len > 0x7F {
        return Err(TokenError::MalformedInput(format!(
            "point of {point_size} bytes does not fit a short cipher DO"
        )));
    }
    Ok([
        0xA6,
        outer_len as u8,
        0x7F,
        0x49,
        pubkey_do_len as u8,
        0x86,
        point_tag_len as u8,
    ])
}

/// PSO:DECIPHER as an ISO 7816 case 4 command: the trailing `00` is Le,
/// not part of the data field.
fn decipher(point: &[u8], coord_size: usize) -> Result<Apdu, TokenError> {
    let prefix = cipher_do_prefix(2 * coord_size)?;
    let mut data = Vec::with_capacity(prefix.len() + point.len());
    data.extend_from_slice(&prefix);
    data.extend_from_slice(point);
    Ok(Apdu::new(0x00, 0x2A, 0x80, 0x86).with_data(data).with_le(0x00))
}

/// An authenticated OpenPGP card session.
pub struct OpenPgpToken<C: CardChannel> {
    channel: Mutex<C>,
}

impl<C: CardChannel> std::fmt::Debug for OpenPgpToken<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenPgpToken").finish_non_exhaustive()
    }
}

impl<C: CardChannel> OpenPgpToken<C> {
    /// Select the applet and authenticate with `pin`.
    ///
    /// An empty PIN skips verification (the card may already be unlocked).
    pub fn open(mut channel: C, pin: &str) -> Result<Self, TokenError> {
        exchange(&mut channel, &select_applet(), "select openpgp")?;
        let status = exchange(&mut channel, &get_pw_status(), "get pw status")?;
        if let Some(retries) = status.get(4) {
            debug!(pw1_retries = retries, "OpenPGP PW status read");
        }

        if !pin.is_empty() {
            let pin_bytes = Zeroizing::new(pin.as_bytes().to_vec());
            for reference in [PW2_REF, PW1_REF] {
                exchange(&mut channel, &verify_pin(reference, &pin_bytes), "verify pin")
                    .map_err(|e| {
                        warn!(reference, error = %e, "PIN verification rejected");
                        TokenError::Authentication
                    })?;
            }
        }

        Ok(Self {
            channel: Mutex::new(channel),
        })
    }
}

fn exchange<C: CardChannel>(
    channel: &mut C,
    apdu: &Apdu,
    operation: &'static str,
) -> Result<Vec<u8>, TokenError> {
    let bytes = Zeroizing::new(apdu.to_bytes()?);
    trace!(operation, len = bytes.len(), "transmit apdu");
    let response = channel.transmit(&bytes)?;
    trace!(operation, len = response.len(), "apdu response");
    split_status(response, operation)
}

impl<C: CardChannel> SecurityToken for OpenPgpToken<C> {
    fn perform_ecdh(
        &self,
        point: &[u8],
        coord_size: usize,
    ) -> Result<Zeroizing<Vec<u8>>, TokenError> {
        if point.len() != 1 + 2 * coord_size {
            return Err(TokenError::MalformedInput(format!(
                "point must be {} bytes, got {}",
                1 + 2 * coord_size,
                point.len()
            )));
        }
        if point[0] != UNCOMPRESSED_POINT {
            return Err(TokenError::MalformedInput(
                "point is not in uncompressed form".into(),
            ));
        }

        let apdu = decipher(point, coord_size)?;
        let mut channel = self.channel.lock();
        let secret = Zeroizing::new(exchange(&mut *channel, &apdu, "decipher")?);
        if secret.len() != coord_size {
            return Err(TokenError::InvalidResultLength {
                expected: coord_size,
                got: secret.len(),
            });
        }
        Ok(secret)
    }
}

/// Opens the real token on first use and keeps it for later calls.
///
/// A failed open is not cached, so the next call retries (e.g. after the
/// operator inserts the token).
pub struct LazyToken<T, F>
where
    T: SecurityToken,
    F: Fn() -> Result<T, TokenError> + Send + Sync,
{
    connect: F,
    inner: Mutex<Option<T>>,
}

impl<T, F> LazyToken<T, F>
where
    T: SecurityToken,
    F: Fn() -> Result<T, TokenError> + Send + Sync,
{
    pub fn new(connect: F) -> Self {
        Self {
            connect,
            inner: Mutex::new(None),
        }
    }

    /// Whether a token session is currently open.
    pub fn is_open(&self) -> bool {
        self.inner.lock().is_some()
    }
}

impl<T, F> SecurityToken for LazyToken<T, F>
where
    T: SecurityToken,
    F: Fn() -> Result<T, TokenError> + Send + Sync,
{
    fn perform_ecdh(
        &self,
        point: &[u8],
        coord_size: usize,
    ) -> Result<Zeroizing<Vec<u8>>, TokenError> {
        let mut inner = self.inner.lock();
        if inner.is_none() {
            debug!("opening security token");
            *inner = Some((self.connect)()?);
        }
        match inner.as_ref() {
            Some(token) => token.perform_ecdh(point, coord_size),
            None => Err(TokenError::NotFound("token not open".into())),
        }
    }
}
