//! Unlock protocol engine.
//!
//! Drives the three-message handshake that delivers a 128-byte model key to
//! the selected companion computer:
//!
//! ```text
//! station                              companion
//!    | -- SignedToken (128) ------------> |
//!    | <------------ BlindedChallenge (32)|
//!    |   ECDH on the security token       |
//!    | -- UnlockKeyResponse (128) ------> |
//!    | <------------------------- Ack     |
//! ```
//!
//! The engine never blocks. Key derivation is handed back to the caller as a
//! [`KeyRequest`] and its result fed in through [`UnlockEngine::on_key_derived`],
//! tagged with the session generation so late results of an abandoned session
//! are dropped. Time is supplied by the caller; the engine only stores the
//! deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ocu_token::{SecurityToken, TokenError};
use ocu_tunnel::{
    Link, PayloadType, TunnelMessage, BLINDED_CHALLENGE_SIZE, SIGNED_TOKEN_SIZE, UNLOCK_KEY_SIZE,
};
use tracing::{debug, info, trace, warn};
use zeroize::Zeroizing;

use crate::config::CompanionConfig;
use crate::errors::{StartError, UnlockFailure};
use crate::types::ComponentId;

// ============================================================================
// State
// ============================================================================

/// Unlock session states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnlockState {
    /// No session
    Idle,
    /// Signed token sent, waiting for the blinded challenge
    AwaitingChallenge,
    /// Unlock key sent (or being derived), waiting for the acknowledgement
    AwaitingFinalAck,
    /// Companion acknowledged the key
    Completed,
}

/// Terminal outcome of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnlockEvent {
    Completed,
    Failed(UnlockFailure),
}

/// Key derivation to run off the serialization point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRequest {
    pub generation: u64,
    pub challenge: [u8; BLINDED_CHALLENGE_SIZE],
    pub coord_size: usize,
}

/// What the caller must do after feeding a tunnel message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnlockStep {
    /// Nothing changed
    Ignored,
    /// Run the ECDH and report back through `on_key_derived`
    DeriveKey(KeyRequest),
    /// The session finished
    Finished(UnlockEvent),
}

/// Run the token ECDH for `request`. Blocking.
pub fn derive_unlock_key<T: SecurityToken + ?Sized>(
    token: &T,
    request: &KeyRequest,
) -> Result<Zeroizing<Vec<u8>>, TokenError> {
    token.perform_ecdh(&request.challenge, request.coord_size)
}

struct Session {
    signed_token: Zeroizing<Vec<u8>>,
    target: ComponentId,
    deadline: Option<Instant>,
    derivation_pending: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("target", &self.target)
            .field("deadline", &self.deadline)
            .field("derivation_pending", &self.derivation_pending)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Single-session unlock state machine.
pub struct UnlockEngine<L: Link> {
    link: Arc<L>,
    timeout: Duration,
    coord_size: usize,
    state: UnlockState,
    session: Option<Session>,
    generation: u64,
}

impl<L: Link> UnlockEngine<L> {
    pub fn new(link: Arc<L>) -> Self {
        Self::with_config(&CompanionConfig::default(), link)
    }

    pub fn with_config(config: &CompanionConfig, link: Arc<L>) -> Self {
        Self {
            link,
            timeout: config.unlock_timeout(),
            coord_size: config.ecdh_coord_size,
            state: UnlockState::Idle,
            session: None,
            generation: 0,
        }
    }

    /// Begin a session for `current`, sending the signed token to it.
    pub fn start(
        &mut self,
        signed_token: &[u8],
        current: Option<ComponentId>,
        now: Instant,
    ) -> Result<(), StartError> {
        let target = current.ok_or(StartError::NoDeviceSelected)?;
        if signed_token.len() != SIGNED_TOKEN_SIZE {
            return Err(StartError::InvalidTokenSize {
                got: signed_token.len(),
                expected: SIGNED_TOKEN_SIZE,
            });
        }
        if self.state != UnlockState::Idle {
            debug!(state = ?self.state, "unlock start rejected");
            return Err(StartError::SessionAlreadyActive);
        }

        let message = TunnelMessage::new(target, PayloadType::SignedToken, signed_token)
            .map_err(ocu_tunnel::LinkError::from)?;
        self.link.send_tunnel(message).map_err(|e| {
            warn!(component_id = target, error = %e, "signed token not sent");
            e
        })?;

        self.generation += 1;
        self.session = Some(Session {
            signed_token: Zeroizing::new(signed_token.to_vec()),
            target,
            deadline: Some(now + self.timeout),
            derivation_pending: false,
        });
        self.state = UnlockState::AwaitingChallenge;
        info!(component_id = target, generation = self.generation, "unlock started");
        Ok(())
    }

    /// Feed an inbound tunnel message.
    pub fn handle_message(&mut self, message: &TunnelMessage) -> UnlockStep {
        let payload_type = message.payload_type();
        if !payload_type.is_unlock_protocol() {
            return UnlockStep::Ignored;
        }

        match self.state {
            UnlockState::AwaitingChallenge => self.on_challenge_state_message(message),
            UnlockState::AwaitingFinalAck if payload_type == PayloadType::Ack => {
                info!(component_id = message.target_component(), "unlock acknowledged");
                self.disarm();
                self.state = UnlockState::Completed;
                UnlockStep::Finished(UnlockEvent::Completed)
            }
            state => {
                debug!(?state, %payload_type, "tunnel message ignored");
                UnlockStep::Ignored
            }
        }
    }

    fn on_challenge_state_message(&mut self, message: &TunnelMessage) -> UnlockStep {
        let Some(session) = self.session.as_mut() else {
            return UnlockStep::Ignored;
        };
        if session.derivation_pending {
            debug!("message ignored while key derivation is pending");
            return UnlockStep::Ignored;
        }

        let payload = message.payload();
        if message.payload_type() != PayloadType::BlindedChallenge
            || payload.len() != BLINDED_CHALLENGE_SIZE
        {
            warn!(
                payload_type = %message.payload_type(),
                len = payload.len(),
                "invalid challenge"
            );
            return UnlockStep::Finished(self.fail(UnlockFailure::InvalidChallenge));
        }

        let mut challenge = [0u8; BLINDED_CHALLENGE_SIZE];
        challenge.copy_from_slice(payload);
        trace!(challenge = %hex::encode(challenge), "blinded challenge received");

        session.derivation_pending = true;
        UnlockStep::DeriveKey(KeyRequest {
            generation: self.generation,
            challenge,
            coord_size: self.coord_size,
        })
    }

    /// Accept the result of a [`KeyRequest`].
    ///
    /// Results from an earlier generation, or arriving when no derivation is
    /// pending, are dropped.
    pub fn on_key_derived(
        &mut self,
        generation: u64,
        result: Result<Zeroizing<Vec<u8>>, TokenError>,
        now: Instant,
    ) -> Option<UnlockEvent> {
        let pending = self
            .session
            .as_ref()
            .is_some_and(|s| s.derivation_pending);
        if generation != self.generation || !pending || self.state != UnlockState::AwaitingChallenge
        {
            debug!(generation, current = self.generation, "stale key derivation discarded");
            return None;
        }
        if let Some(event) = self.poll_timeout(now) {
            return Some(event);
        }

        let key = match result {
            Ok(key) if key.len() == UNLOCK_KEY_SIZE => key,
            Ok(key) => {
                warn!(len = key.len(), expected = UNLOCK_KEY_SIZE, "derived key has wrong size");
                return Some(self.fail(UnlockFailure::KeyDerivationFailed {
                    reason: format!("token returned {} bytes, expected {UNLOCK_KEY_SIZE}", key.len()),
                }));
            }
            Err(e) => {
                warn!(error = %e, "key derivation failed");
                return Some(self.fail(UnlockFailure::from_token(&e)));
            }
        };

        let target = self.target()?;
        let message = match TunnelMessage::new(target, PayloadType::UnlockKeyResponse, &key) {
            Ok(m) => m,
            Err(e) => {
                return Some(self.fail(UnlockFailure::LinkUnavailable(e.into())));
            }
        };
        if let Err(e) = self.link.send_tunnel(message) {
            warn!(component_id = target, error = %e, "unlock key not sent");
            return Some(self.fail(UnlockFailure::LinkUnavailable(e)));
        }

        if let Some(session) = self.session.as_mut() {
            session.derivation_pending = false;
        }
        self.state = UnlockState::AwaitingFinalAck;
        debug!(component_id = target, "unlock key sent");
        None
    }

    /// Fail the session once its deadline has passed.
    pub fn poll_timeout(&mut self, now: Instant) -> Option<UnlockEvent> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        warn!(state = ?self.state, "unlock timed out");
        Some(self.fail(UnlockFailure::Timeout))
    }

    /// Drop the session because its target is no longer current.
    ///
    /// A session still awaiting a reply fails with `DeviceChanged`; a
    /// completed one is reset silently.
    pub fn abandon_for_device_change(&mut self) -> Option<UnlockEvent> {
        if self.is_unlocking() {
            return Some(self.fail(UnlockFailure::DeviceChanged));
        }
        self.reset();
        None
    }

    /// Abandon any session and return to Idle.
    pub fn reset(&mut self) {
        if self.state != UnlockState::Idle {
            debug!(state = ?self.state, "unlock reset");
            self.generation += 1;
        }
        self.session = None;
        self.state = UnlockState::Idle;
    }

    pub fn state(&self) -> UnlockState {
        self.state
    }

    /// Armed only while awaiting a challenge or the final ack.
    pub fn deadline(&self) -> Option<Instant> {
        self.session.as_ref()?.deadline
    }

    pub fn is_unlocking(&self) -> bool {
        matches!(
            self.state,
            UnlockState::AwaitingChallenge | UnlockState::AwaitingFinalAck
        )
    }

    pub fn is_unlocked(&self) -> bool {
        self.state == UnlockState::Completed
    }

    pub fn target(&self) -> Option<ComponentId> {
        self.session.as_ref().map(|s| s.target)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Size of the signed token held by the active session.
    pub fn signed_token_len(&self) -> Option<usize> {
        self.session.as_ref().map(|s| s.signed_token.len())
    }

    fn disarm(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.deadline = None;
        }
    }

    fn fail(&mut self, failure: UnlockFailure) -> UnlockEvent {
        info!(code = failure.code(), "unlock failed");
        self.generation += 1;
        self.session = None;
        self.state = UnlockState::Idle;
        UnlockEvent::Failed(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocu_token::testing::MockToken;
    use ocu_tunnel::testing::MockLink;
    use ocu_tunnel::LinkError;

    const TARGET: ComponentId = 2;

    fn engine() -> (UnlockEngine<MockLink>, Arc<MockLink>) {
        let link = Arc::new(MockLink::new());
        (UnlockEngine::new(link.clone()), link)
    }

    fn msg(payload_type: PayloadType, payload: &[u8]) -> TunnelMessage {
        TunnelMessage::new(TARGET, payload_type, payload).unwrap()
    }

    fn challenge() -> TunnelMessage {
        msg(PayloadType::BlindedChallenge, &[0x5A; 32])
    }

    fn started() -> (UnlockEngine<MockLink>, Arc<MockLink>, Instant) {
        let (mut engine, link) = engine();
        let now = Instant::now();
        engine.start(&[0xAB; 128], Some(TARGET), now).unwrap();
        (engine, link, now)
    }

    fn request(step: UnlockStep) -> KeyRequest {
        match step {
            UnlockStep::DeriveKey(request) => request,
            other => panic!("expected key request, got {other:?}"),
        }
    }

    #[test]
    fn test_happy_path() {
        let (mut engine, link, t0) = started();
        assert_eq!(engine.state(), UnlockState::AwaitingChallenge);
        assert!(engine.is_unlocking());
        assert_eq!(engine.target(), Some(TARGET));
        assert_eq!(engine.signed_token_len(), Some(128));
        assert_eq!(engine.deadline(), Some(t0 + Duration::from_secs(10)));

        let sent = link.sent_of_type(PayloadType::SignedToken);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target_component(), TARGET);
        assert_eq!(sent[0].payload(), &[0xAB; 128][..]);

        let req = request(engine.handle_message(&challenge()));
        assert_eq!(req.challenge, [0x5A; 32]);
        assert_eq!(req.coord_size, 32);

        let token = MockToken::expanding(128);
        let key = derive_unlock_key(&token, &req);
        assert_eq!(engine.on_key_derived(req.generation, key, t0 + Duration::from_secs(1)), None);
        assert_eq!(engine.state(), UnlockState::AwaitingFinalAck);
        // deadline unchanged by intermediate messages
        assert_eq!(engine.deadline(), Some(t0 + Duration::from_secs(10)));

        let responses = link.sent_of_type(PayloadType::UnlockKeyResponse);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].payload_length(), 128);
        assert_eq!(responses[0].payload(), &[0x5A; 128][..]);

        assert_eq!(
            engine.handle_message(&msg(PayloadType::Ack, &[])),
            UnlockStep::Finished(UnlockEvent::Completed)
        );
        assert!(engine.is_unlocked());
        assert!(!engine.is_unlocking());
        assert_eq!(engine.deadline(), None);
        assert_eq!(engine.poll_timeout(t0 + Duration::from_secs(60)), None);
    }

    #[test]
    fn test_start_validation() {
        let (mut engine, link) = engine();
        let now = Instant::now();

        assert_eq!(
            engine.start(&[0u8; 128], None, now),
            Err(StartError::NoDeviceSelected)
        );
        assert_eq!(
            engine.start(&[0u8; 127], Some(TARGET), now),
            Err(StartError::InvalidTokenSize {
                got: 127,
                expected: 128
            })
        );
        assert_eq!(engine.state(), UnlockState::Idle);
        assert!(link.get_sent().is_empty());
    }

    #[test]
    fn test_start_while_active_rejected() {
        let (mut engine, link, now) = started();
        assert_eq!(
            engine.start(&[1u8; 128], Some(TARGET), now),
            Err(StartError::SessionAlreadyActive)
        );
        assert_eq!(link.sent_of_type(PayloadType::SignedToken).len(), 1);
        assert_eq!(engine.deadline(), Some(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_start_after_completion_requires_reset() {
        let (mut engine, _link, now) = started();
        let req = request(engine.handle_message(&challenge()));
        engine.on_key_derived(req.generation, Ok(Zeroizing::new(vec![1; 128])), now);
        engine.handle_message(&msg(PayloadType::Ack, &[]));

        assert_eq!(
            engine.start(&[1u8; 128], Some(TARGET), now),
            Err(StartError::SessionAlreadyActive)
        );
        engine.reset();
        assert!(engine.start(&[1u8; 128], Some(TARGET), now).is_ok());
    }

    #[test]
    fn test_start_link_refused_rolls_back() {
        let (mut engine, link) = engine();
        link.disconnect();
        assert_eq!(
            engine.start(&[0u8; 128], Some(TARGET), Instant::now()),
            Err(StartError::Link(LinkError::Disconnected))
        );
        assert_eq!(engine.state(), UnlockState::Idle);
        assert_eq!(engine.deadline(), None);
    }

    #[test]
    fn test_wrong_sized_challenge_fails() {
        let (mut engine, link, _) = started();
        assert_eq!(
            engine.handle_message(&msg(PayloadType::BlindedChallenge, &[0u8; 16])),
            UnlockStep::Finished(UnlockEvent::Failed(UnlockFailure::InvalidChallenge))
        );
        assert_eq!(engine.state(), UnlockState::Idle);
        assert_eq!(engine.deadline(), None);
        assert!(link.sent_of_type(PayloadType::UnlockKeyResponse).is_empty());
    }

    #[test]
    fn test_unexpected_protocol_message_fails() {
        let (mut engine, _link, _) = started();
        assert_eq!(
            engine.handle_message(&msg(PayloadType::Ack, &[])),
            UnlockStep::Finished(UnlockEvent::Failed(UnlockFailure::InvalidChallenge))
        );
    }

    #[test]
    fn test_unrelated_traffic_ignored() {
        let (mut engine, _link, _) = started();
        assert_eq!(
            engine.handle_message(&msg(PayloadType::Other(7), &[1, 2, 3])),
            UnlockStep::Ignored
        );
        assert_eq!(engine.state(), UnlockState::AwaitingChallenge);
    }

    #[test]
    fn test_messages_ignored_when_idle() {
        let (mut engine, link) = engine();
        assert_eq!(engine.handle_message(&challenge()), UnlockStep::Ignored);
        assert_eq!(engine.handle_message(&msg(PayloadType::Ack, &[])), UnlockStep::Ignored);
        assert_eq!(engine.state(), UnlockState::Idle);
        assert!(link.get_sent().is_empty());
    }

    #[test]
    fn test_second_challenge_while_deriving_ignored() {
        let (mut engine, _link, _) = started();
        request(engine.handle_message(&challenge()));
        assert_eq!(engine.handle_message(&challenge()), UnlockStep::Ignored);
        assert_eq!(engine.state(), UnlockState::AwaitingChallenge);
    }

    #[test]
    fn test_token_failure() {
        let (mut engine, link, now) = started();
        let req = request(engine.handle_message(&challenge()));
        let token = MockToken::failing(TokenError::Authentication);

        let event = engine.on_key_derived(req.generation, derive_unlock_key(&token, &req), now);
        assert!(matches!(
            event,
            Some(UnlockEvent::Failed(UnlockFailure::KeyDerivationFailed { .. }))
        ));
        assert_eq!(engine.state(), UnlockState::Idle);
        assert_eq!(engine.deadline(), None);
        assert!(link.sent_of_type(PayloadType::UnlockKeyResponse).is_empty());
    }

    #[test]
    fn test_wrong_sized_key() {
        let (mut engine, link, now) = started();
        let req = request(engine.handle_message(&challenge()));

        let event = engine.on_key_derived(req.generation, Ok(Zeroizing::new(vec![0; 32])), now);
        assert!(matches!(
            event,
            Some(UnlockEvent::Failed(UnlockFailure::KeyDerivationFailed { .. }))
        ));
        assert!(link.sent_of_type(PayloadType::UnlockKeyResponse).is_empty());
    }

    #[test]
    fn test_key_send_refused() {
        let (mut engine, link, now) = started();
        let req = request(engine.handle_message(&challenge()));
        link.disconnect();

        assert_eq!(
            engine.on_key_derived(req.generation, Ok(Zeroizing::new(vec![0; 128])), now),
            Some(UnlockEvent::Failed(UnlockFailure::LinkUnavailable(
                LinkError::Disconnected
            )))
        );
        assert_eq!(engine.state(), UnlockState::Idle);
    }

    #[test]
    fn test_timeout_awaiting_challenge() {
        let (mut engine, _link, t0) = started();
        assert_eq!(engine.poll_timeout(t0 + Duration::from_millis(9999)), None);
        assert_eq!(
            engine.poll_timeout(t0 + Duration::from_secs(10)),
            Some(UnlockEvent::Failed(UnlockFailure::Timeout))
        );
        assert_eq!(engine.state(), UnlockState::Idle);
        assert_eq!(engine.poll_timeout(t0 + Duration::from_secs(20)), None);
    }

    #[test]
    fn test_timeout_awaiting_ack() {
        let (mut engine, _link, t0) = started();
        let req = request(engine.handle_message(&challenge()));
        engine.on_key_derived(req.generation, Ok(Zeroizing::new(vec![0; 128])), t0);

        assert_eq!(
            engine.poll_timeout(t0 + Duration::from_secs(11)),
            Some(UnlockEvent::Failed(UnlockFailure::Timeout))
        );
        // late ack does nothing
        assert_eq!(engine.handle_message(&msg(PayloadType::Ack, &[])), UnlockStep::Ignored);
    }

    #[test]
    fn test_key_arriving_after_deadline_times_out() {
        let (mut engine, link, t0) = started();
        let req = request(engine.handle_message(&challenge()));

        assert_eq!(
            engine.on_key_derived(
                req.generation,
                Ok(Zeroizing::new(vec![0; 128])),
                t0 + Duration::from_secs(10)
            ),
            Some(UnlockEvent::Failed(UnlockFailure::Timeout))
        );
        assert!(link.sent_of_type(PayloadType::UnlockKeyResponse).is_empty());
    }

    #[test]
    fn test_reset_discards_pending_derivation() {
        let (mut engine, link, now) = started();
        let req = request(engine.handle_message(&challenge()));

        engine.reset();
        assert_eq!(engine.deadline(), None);
        assert_eq!(
            engine.on_key_derived(req.generation, Ok(Zeroizing::new(vec![0; 128])), now),
            None
        );
        assert_eq!(engine.state(), UnlockState::Idle);
        assert!(link.sent_of_type(PayloadType::UnlockKeyResponse).is_empty());
    }

    #[test]
    fn test_stale_result_after_restart_discarded() {
        let (mut engine, link, now) = started();
        let old = request(engine.handle_message(&challenge()));
        engine.reset();
        engine.start(&[0xCD; 128], Some(TARGET), now).unwrap();
        let fresh = request(engine.handle_message(&challenge()));
        assert_ne!(old.generation, fresh.generation);

        assert_eq!(
            engine.on_key_derived(old.generation, Ok(Zeroizing::new(vec![0; 128])), now),
            None
        );
        assert_eq!(engine.state(), UnlockState::AwaitingChallenge);
        assert!(link.sent_of_type(PayloadType::UnlockKeyResponse).is_empty());
    }

    #[test]
    fn test_device_change_fails_pending_session() {
        let (mut engine, link, now) = started();
        let req = request(engine.handle_message(&challenge()));

        assert_eq!(
            engine.abandon_for_device_change(),
            Some(UnlockEvent::Failed(UnlockFailure::DeviceChanged))
        );
        assert_eq!(engine.state(), UnlockState::Idle);
        assert_eq!(engine.deadline(), None);
        assert_eq!(
            engine.on_key_derived(req.generation, Ok(Zeroizing::new(vec![0; 128])), now),
            None
        );
        assert!(link.sent_of_type(PayloadType::UnlockKeyResponse).is_empty());
    }

    #[test]
    fn test_device_change_after_completion_is_silent() {
        let (mut engine, _link, now) = started();
        let req = request(engine.handle_message(&challenge()));
        engine.on_key_derived(req.generation, Ok(Zeroizing::new(vec![1; 128])), now);
        engine.handle_message(&msg(PayloadType::Ack, &[]));

        assert_eq!(engine.abandon_for_device_change(), None);
        assert_eq!(engine.state(), UnlockState::Idle);

        let (mut idle, _link) = self::engine();
        assert_eq!(idle.abandon_for_device_change(), None);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let (mut engine, _link) = engine();
        engine.reset();
        engine.reset();
        assert_eq!(engine.state(), UnlockState::Idle);
        assert_eq!(engine.target(), None);
    }

    #[test]
    fn test_p384_coord_size_forwarded() {
        let link = Arc::new(MockLink::new());
        let config = CompanionConfig {
            ecdh_coord_size: 48,
            ..CompanionConfig::default()
        };
        let mut engine = UnlockEngine::with_config(&config, link);
        engine.start(&[0u8; 128], Some(TARGET), Instant::now()).unwrap();
        assert_eq!(request(engine.handle_message(&challenge())).coord_size, 48);
    }
}
