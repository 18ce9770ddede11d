//! Connection authentication.
//!
//! A channel opens unauthenticated and must present a bearer token over
//! the socket itself:
//!
//! ```text
//! Connected ──{type:"auth"} ok──► Authenticated(user) ──close──► Closed
//!     │                                   │
//!     └── bad token / deadline ──► Closed └── second auth → error event, state kept
//! ```
//!
//! Only an authenticated channel is ever present in the registry, and only
//! the handshake puts it there.
//!
//! ## Token Format
//!
//! Tokens issued by [`HmacTokenVerifier`] are:
//! - 8 bytes: user id (big-endian)
//! - 8 bytes: issued-at timestamp (Unix millis, big-endian)
//! - 32 bytes: HMAC-SHA256 over the first 16 bytes
//!
//! Total: 48 bytes, URL-safe base64 (no padding) for transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::channel::{ChannelHandle, ConnectionId, Sendable};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ClientMessage, ServerEvent};
use crate::record::{now_millis, UserId};
use crate::registry::ConnectionRegistry;

type HmacSha256 = Hmac<Sha256>;

const CLAIMS_LEN: usize = 16;
const TOKEN_LEN: usize = CLAIMS_LEN + 32;

/// Default token lifetime: 7 days.
pub const DEFAULT_TOKEN_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Checks a bearer credential and yields the user it was issued to.
pub trait CredentialVerifier: Send + Sync {
    /// Fails with [`SyncError::InvalidCredential`] on a bad signature,
    /// expiry, or malformed input.
    fn verify(&self, token: &str) -> SyncResult<UserId>;
}

/// HMAC-SHA256 signed tokens with a fixed lifetime.
#[derive(Clone)]
pub struct HmacTokenVerifier {
    secret: Vec<u8>,
    expiry: Duration,
}

impl HmacTokenVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            expiry: DEFAULT_TOKEN_EXPIRY,
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Mints a token for `user` issued now.
    pub fn issue(&self, user: UserId) -> SyncResult<String> {
        self.issue_at(user, now_millis())
    }

    /// Mints a token with an explicit issued-at timestamp (Unix millis).
    pub fn issue_at(&self, user: UserId, issued_at_millis: u64) -> SyncResult<String> {
        let mut token = Vec::with_capacity(TOKEN_LEN);
        token.extend_from_slice(&user.0.to_be_bytes());
        token.extend_from_slice(&issued_at_millis.to_be_bytes());

        let mut mac = self.mac()?;
        mac.update(&token);
        token.extend_from_slice(&mac.finalize().into_bytes());

        Ok(URL_SAFE_NO_PAD.encode(token))
    }

    fn mac(&self) -> SyncResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret).map_err(|e| SyncError::Config(e.to_string()))
    }
}

impl CredentialVerifier for HmacTokenVerifier {
    fn verify(&self, token: &str) -> SyncResult<UserId> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| SyncError::InvalidCredential("malformed token".into()))?;
        if bytes.len() != TOKEN_LEN {
            return Err(SyncError::InvalidCredential("invalid token length".into()));
        }

        let (claims, signature) = bytes.split_at(CLAIMS_LEN);
        let mut mac = self.mac()?;
        mac.update(claims);
        mac.verify_slice(signature)
            .map_err(|_| SyncError::InvalidCredential("invalid signature".into()))?;

        let (user_bytes, issued_bytes) = claims.split_at(8);
        let mut user = [0u8; 8];
        user.copy_from_slice(user_bytes);
        let mut issued = [0u8; 8];
        issued.copy_from_slice(issued_bytes);

        let issued_at = u64::from_be_bytes(issued);
        let expires_at = issued_at.saturating_add(self.expiry.as_millis() as u64);
        if now_millis() > expires_at {
            return Err(SyncError::InvalidCredential("token expired".into()));
        }

        Ok(UserId(u64::from_be_bytes(user)))
    }
}

/// Where a channel is in its lifecycle.
#[derive(Debug)]
pub enum SessionState {
    Connected,
    Authenticated(Arc<ChannelHandle>),
    Closed,
}

/// Per-connection state owned by the task that reads the socket.
pub struct ChannelSession {
    sink: Arc<dyn Sendable>,
    state: SessionState,
}

impl ChannelSession {
    pub fn new(sink: Arc<dyn Sendable>) -> Self {
        Self {
            sink,
            state: SessionState::Connected,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Open but not yet authenticated.
    pub fn is_pending(&self) -> bool {
        matches!(self.state, SessionState::Connected)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, SessionState::Closed)
    }

    pub fn user_id(&self) -> Option<UserId> {
        match &self.state {
            SessionState::Authenticated(handle) => Some(handle.user_id()),
            _ => None,
        }
    }

    pub fn connection_id(&self) -> Option<&ConnectionId> {
        match &self.state {
            SessionState::Authenticated(handle) => Some(handle.connection_id()),
            _ => None,
        }
    }

    fn notify(&self, event: &ServerEvent) -> SyncResult<()> {
        self.sink.send(event.encode()?)
    }
}

/// Binds channels to users and admits them into the registry.
pub struct Handshake {
    verifier: Arc<dyn CredentialVerifier>,
    registry: Arc<ConnectionRegistry>,
    max_connections_per_user: Option<usize>,
    failures: AtomicU64,
}

impl Handshake {
    pub fn new(verifier: Arc<dyn CredentialVerifier>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            verifier,
            registry,
            max_connections_per_user: None,
            failures: AtomicU64::new(0),
        }
    }

    /// Caps how many live channels one user may hold. `None` disables.
    pub fn with_connection_limit(mut self, limit: Option<usize>) -> Self {
        self.max_connections_per_user = limit;
        self
    }

    /// Dispatches one inbound text frame. Unrecognized or malformed frames
    /// are logged and ignored.
    pub fn handle_frame(&self, session: &mut ChannelSession, text: &str) {
        match ClientMessage::decode(text) {
            Ok(ClientMessage::Auth { token }) => {
                // Failures are already reported on the channel itself.
                let _ = self.authenticate(session, &token);
            }
            Ok(ClientMessage::Unknown) => {
                log::debug!("Ignoring unrecognized message kind");
            }
            Err(e) => {
                log::warn!("Ignoring inbound frame: {e}");
            }
        }
    }

    /// Runs the credential check for `session` and, on success, registers
    /// it and acknowledges with `{userId, connectionId}`.
    pub fn authenticate(&self, session: &mut ChannelSession, token: &str) -> SyncResult<Arc<ChannelHandle>> {
        match &session.state {
            SessionState::Closed => {
                return Err(SyncError::Protocol("channel is closed".into()));
            }
            SessionState::Authenticated(handle) => {
                log::warn!(
                    "Rejecting repeated authentication on channel {}",
                    handle.connection_id()
                );
                let _ = session.notify(&ServerEvent::error("Already authenticated"));
                return Err(SyncError::Protocol("already authenticated".into()));
            }
            SessionState::Connected => {}
        }

        let admitted = self.verifier.verify(token).and_then(|user| {
            let connection_id = ConnectionId::mint(user);
            self.registry.try_register(
                user,
                connection_id,
                Arc::clone(&session.sink),
                self.max_connections_per_user,
            )
        });

        let handle = match admitted {
            Ok(handle) => handle,
            Err(e) => {
                self.reject(session, &e);
                return Err(e);
            }
        };

        let ack = ServerEvent::Authenticated {
            user_id: handle.user_id(),
            connection_id: handle.connection_id().clone(),
        };
        if let Err(e) = ack.encode().and_then(|frame| handle.send(frame)) {
            handle.mark_closed();
            self.registry.evict(&handle);
            session.sink.close();
            session.state = SessionState::Closed;
            log::warn!("Channel closed before authentication ack: {e}");
            return Err(e);
        }

        log::info!(
            "Channel {} authenticated for user {}",
            handle.connection_id(),
            handle.user_id()
        );
        session.state = SessionState::Authenticated(Arc::clone(&handle));
        Ok(handle)
    }

    /// Closes a channel that missed its authentication deadline.
    pub fn expire(&self, session: &mut ChannelSession) {
        if session.is_pending() {
            self.reject(
                session,
                &SyncError::Protocol("authentication timed out".into()),
            );
        }
    }

    /// Tears down a channel whose socket has gone away. Safe to call more
    /// than once.
    pub fn close(&self, session: &mut ChannelSession) {
        if let SessionState::Authenticated(handle) = &session.state {
            handle.mark_closed();
            self.registry.evict(handle);
            log::info!("Channel {} closed for user {}", handle.connection_id(), handle.user_id());
        }
        session.sink.close();
        session.state = SessionState::Closed;
    }

    /// Number of channels closed because they failed to authenticate.
    pub fn failed_handshakes(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn reject(&self, session: &mut ChannelSession, error: &SyncError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        log::warn!("Authentication failed: {error}");
        let _ = session.notify(&ServerEvent::error(error.to_string()));
        session.sink.close();
        session.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::RecordingSink;

    const SECRET: &[u8] = b"test-secret-key-32-bytes-long!!";

    fn verifier() -> Arc<HmacTokenVerifier> {
        Arc::new(HmacTokenVerifier::new(SECRET))
    }

    fn setup() -> (Arc<ConnectionRegistry>, Handshake, Arc<HmacTokenVerifier>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let verifier = verifier();
        let handshake = Handshake::new(verifier.clone(), Arc::clone(&registry));
        (registry, handshake, verifier)
    }

    fn auth_frame(token: &str) -> String {
        ClientMessage::auth(token).encode().unwrap()
    }

    #[test]
    fn test_issue_and_verify_token() {
        let v = verifier();
        let token = v.issue(UserId(42)).unwrap();
        assert_eq!(v.verify(&token).unwrap(), UserId(42));
    }

    #[test]
    fn test_reject_tampered_token() {
        let v = verifier();
        let token = v.issue(UserId(42)).unwrap();
        let mut bytes = URL_SAFE_NO_PAD.decode(&token).unwrap();
        bytes[0] ^= 0x01; // claim a different user
        let forged = URL_SAFE_NO_PAD.encode(bytes);
        assert!(matches!(v.verify(&forged), Err(SyncError::InvalidCredential(_))));
    }

    #[test]
    fn test_reject_token_from_other_secret() {
        let other = HmacTokenVerifier::new(b"another-secret".to_vec());
        let token = other.issue(UserId(1)).unwrap();
        assert!(verifier().verify(&token).is_err());
    }

    #[test]
    fn test_reject_expired_token() {
        let v = HmacTokenVerifier::new(SECRET).with_expiry(Duration::from_secs(60));
        let issued = now_millis() - 61_000;
        let token = v.issue_at(UserId(5), issued).unwrap();
        assert!(matches!(v.verify(&token), Err(SyncError::InvalidCredential(msg)) if msg.contains("expired")));
    }

    #[test]
    fn test_reject_malformed_tokens() {
        let v = verifier();
        assert!(v.verify("").is_err());
        assert!(v.verify("not base64 !!").is_err());
        assert!(v.verify(&URL_SAFE_NO_PAD.encode([0u8; 10])).is_err());
    }

    #[test]
    fn test_successful_handshake_registers_and_acks() {
        let (registry, handshake, v) = setup();
        let sink = RecordingSink::new();
        let mut session = ChannelSession::new(sink.clone());

        handshake.handle_frame(&mut session, &auth_frame(&v.issue(UserId(7)).unwrap()));

        assert_eq!(session.user_id(), Some(UserId(7)));
        assert_eq!(registry.connection_count(UserId(7)), 1);
        let events = sink.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::Authenticated { user_id, connection_id } => {
                assert_eq!(*user_id, UserId(7));
                assert_eq!(Some(connection_id), session.connection_id());
                assert!(connection_id.as_str().starts_with("7-"));
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_credential_closes_without_registering() {
        let (registry, handshake, _) = setup();
        let sink = RecordingSink::new();
        let mut session = ChannelSession::new(sink.clone());

        handshake.handle_frame(&mut session, &auth_frame("garbage"));

        assert!(session.is_closed());
        assert!(sink.is_closed());
        assert_eq!(registry.total_connections(), 0);
        assert_eq!(handshake.failed_handshakes(), 1);
        assert!(matches!(&sink.events()[..], [ServerEvent::Error { .. }]));
    }

    #[test]
    fn test_failed_ack_closes_transport() {
        let (registry, handshake, v) = setup();
        let sink = RecordingSink::new();
        let mut session = ChannelSession::new(sink.clone());
        sink.break_pipe();

        let result = handshake.authenticate(&mut session, &v.issue(UserId(5)).unwrap());

        assert!(matches!(result, Err(SyncError::ChannelSend(_))));
        assert!(session.is_closed());
        assert!(sink.is_closed());
        assert_eq!(registry.total_connections(), 0);
        assert!(!registry.contains_user(UserId(5)));
    }

    #[test]
    fn test_second_auth_is_rejected_without_state_change() {
        let (registry, handshake, v) = setup();
        let sink = RecordingSink::new();
        let mut session = ChannelSession::new(sink.clone());
        let first = handshake
            .authenticate(&mut session, &v.issue(UserId(1)).unwrap())
            .unwrap();

        let second = handshake.authenticate(&mut session, &v.issue(UserId(2)).unwrap());

        assert!(second.is_err());
        assert_eq!(session.connection_id(), Some(first.connection_id()));
        assert_eq!(session.user_id(), Some(UserId(1)));
        assert!(!sink.is_closed());
        assert_eq!(registry.total_connections(), 1);
        assert!(!registry.contains_user(UserId(2)));
        assert!(matches!(sink.events().last(), Some(ServerEvent::Error { .. })));
    }

    #[test]
    fn test_unknown_and_malformed_frames_are_ignored() {
        let (registry, handshake, _) = setup();
        let sink = RecordingSink::new();
        let mut session = ChannelSession::new(sink.clone());

        handshake.handle_frame(&mut session, r#"{"type":"ping"}"#);
        handshake.handle_frame(&mut session, "{{{");

        assert!(session.is_pending());
        assert!(!sink.is_closed());
        assert_eq!(sink.sent(), 0);
        assert_eq!(registry.total_connections(), 0);
    }

    #[test]
    fn test_close_deregisters() {
        let (registry, handshake, v) = setup();
        let mut session = ChannelSession::new(RecordingSink::new());
        handshake
            .authenticate(&mut session, &v.issue(UserId(3)).unwrap())
            .unwrap();
        assert!(registry.contains_user(UserId(3)));

        handshake.close(&mut session);
        handshake.close(&mut session);

        assert!(session.is_closed());
        assert!(!registry.contains_user(UserId(3)));
    }

    #[test]
    fn test_expire_only_affects_pending_sessions() {
        let (registry, handshake, v) = setup();

        let pending_sink = RecordingSink::new();
        let mut pending = ChannelSession::new(pending_sink.clone());
        handshake.expire(&mut pending);
        assert!(pending.is_closed());
        assert!(pending_sink.is_closed());

        let mut live = ChannelSession::new(RecordingSink::new());
        handshake.authenticate(&mut live, &v.issue(UserId(4)).unwrap()).unwrap();
        handshake.expire(&mut live);
        assert_eq!(live.user_id(), Some(UserId(4)));
        assert_eq!(registry.connection_count(UserId(4)), 1);
    }

    #[test]
    fn test_connection_limit_rejects_extra_channel() {
        let registry = Arc::new(ConnectionRegistry::new());
        let v = verifier();
        let handshake = Handshake::new(v.clone(), Arc::clone(&registry)).with_connection_limit(Some(1));

        let mut first = ChannelSession::new(RecordingSink::new());
        handshake.authenticate(&mut first, &v.issue(UserId(8)).unwrap()).unwrap();

        let sink = RecordingSink::new();
        let mut second = ChannelSession::new(sink.clone());
        let err = handshake
            .authenticate(&mut second, &v.issue(UserId(8)).unwrap())
            .unwrap_err();

        assert!(matches!(err, SyncError::ConnectionLimit { limit: 1, .. }));
        assert!(second.is_closed());
        assert!(sink.is_closed());
        assert_eq!(registry.connection_count(UserId(8)), 1);
    }
}
