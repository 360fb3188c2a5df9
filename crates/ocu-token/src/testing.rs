//! Test doubles for tokens and card channels.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::error::TokenError;
use crate::openpgp::CardChannel;
use crate::token::SecurityToken;

#[derive(Clone, Debug)]
enum Behavior {
    Fixed(Vec<u8>),
    /// Repeats the input point until `len` bytes are produced.
    Expand(usize),
    Fail(TokenError),
}

/// Scriptable [`SecurityToken`] that records every call.
#[derive(Debug)]
pub struct MockToken {
    behavior: Behavior,
    delay: Duration,
    calls: Mutex<Vec<(Vec<u8>, usize)>>,
}

impl MockToken {
    /// Always return `secret`.
    pub fn fixed(secret: Vec<u8>) -> Self {
        Self::with_behavior(Behavior::Fixed(secret))
    }

    /// Derive `len` bytes by repeating the supplied point.
    pub fn expanding(len: usize) -> Self {
        Self::with_behavior(Behavior::Expand(len))
    }

    /// Always fail with `error`.
    pub fn failing(error: TokenError) -> Self {
        Self::with_behavior(Behavior::Fail(error))
    }

    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Block for `delay` on every call (simulates a slow card or a PIN prompt).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Points and coordinate sizes received so far.
    pub fn calls(&self) -> Vec<(Vec<u8>, usize)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl SecurityToken for MockToken {
    fn perform_ecdh(
        &self,
        point: &[u8],
        coord_size: usize,
    ) -> Result<Zeroizing<Vec<u8>>, TokenError> {
        self.calls.lock().push((point.to_vec(), coord_size));
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        match &self.behavior {
            Behavior::Fixed(secret) => Ok(Zeroizing::new(secret.clone())),
            Behavior::Expand(len) => {
                if point.is_empty() {
                    return Err(TokenError::MalformedInput("empty point".into()));
                }
                Ok(Zeroizing::new(
                    point.iter().copied().cycle().take(*len).collect(),
                ))
            }
            Behavior::Fail(error) => Err(error.clone()),
        }
    }
}

/// [`CardChannel`] replaying canned responses and logging every APDU.
pub struct ScriptedCard {
    responses: VecDeque<Vec<u8>>,
    log: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ScriptedCard {
    pub fn new(responses: Vec<Vec<u8>>) -> Self {
        Self {
            responses: responses.into(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle to the APDU log (kept after the card is moved).
    pub fn log(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        self.log.clone()
    }
}

impl CardChannel for ScriptedCard {
    fn transmit(&mut self, apdu: &[u8]) -> Result<Vec<u8>, TokenError> {
        self.log.lock().push(apdu.to_vec());
        self.responses
            .pop_front()
            .ok_or_else(|| TokenError::Io("card removed".into()))
    }
}
