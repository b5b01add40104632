//! Connection lifecycle handling.
//!
//! The transport turns everything that happens on a socket into a
//! [`ConnectionEvent`] and hands it to [`LifecycleHandler::handle`]. The
//! handler is the only writer of per-connection state in the registry.
//!
//! # State Machine
//!
//! ```text
//! Connect ──► Pending ──authRequest──► Authenticated ◄──┐
//!                │                          │            │ authRequest
//!                │                          ▼            │
//!                │                  Unauthenticated ─────┘
//!                ▼
//!           Disconnect (from any state)
//! ```
//!
//! Authentication is tracked but never gates delivery: every registered
//! connection receives every broadcast regardless of its [`AuthState`].

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::auth::TokenVerifier;
use crate::registry::{AuthState, ConnectionEntry, ConnectionHandle, ConnectionRegistry};

/// Name of the single implicit broadcast group every connection joins.
pub const BROADCAST_GROUP: &str = "chat";

/// Something that happened on one connection.
pub enum ConnectionEvent {
    /// The session was established.
    Connect(Arc<dyn ConnectionHandle>),
    /// The client sent an `authRequest` payload.
    AuthRequest(String),
    /// The client sent a `control` payload.
    Control(String),
    /// The transport reported an error on the session.
    Error(String),
    /// The session ended.
    Disconnect,
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(_) => f.write_str("Connect"),
            Self::AuthRequest(_) => f.write_str("AuthRequest(<redacted>)"),
            Self::Control(payload) => f.debug_tuple("Control").field(payload).finish(),
            Self::Error(message) => f.debug_tuple("Error").field(message).finish(),
            Self::Disconnect => f.write_str("Disconnect"),
        }
    }
}

/// Body of an `authRequest` event.
#[derive(Debug, Deserialize)]
struct AuthPayload {
    #[serde(default, alias = "Token")]
    token: String,
}

/// Applies connection events to the registry.
#[derive(Clone)]
pub struct LifecycleHandler {
    registry: Arc<ConnectionRegistry>,
    verifier: Arc<TokenVerifier>,
}

impl LifecycleHandler {
    /// Creates a handler over a shared registry and verifier.
    pub fn new(registry: Arc<ConnectionRegistry>, verifier: Arc<TokenVerifier>) -> Self {
        Self { registry, verifier }
    }

    /// Dispatches one event for connection `id`.
    pub fn handle(&self, id: &str, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connect(handle) => self.connect(id, handle),
            ConnectionEvent::AuthRequest(payload) => {
                self.authenticate(id, &payload);
            }
            ConnectionEvent::Control(payload) => self.control(id, &payload),
            ConnectionEvent::Error(message) => self.error(id, &message),
            ConnectionEvent::Disconnect => self.disconnect(id),
        }
    }

    /// Registers a new connection with no token and no claims.
    pub fn connect(&self, id: &str, handle: Arc<dyn ConnectionHandle>) {
        if self.registry.insert(ConnectionEntry::new(id, handle)).is_some() {
            warn!(connection_id = %id, "Connection ID reused, previous entry replaced");
        }
        info!(
            connection_id = %id,
            group = BROADCAST_GROUP,
            connections = self.registry.len(),
            "Client connected"
        );
    }

    /// Records and verifies the token in an `authRequest` payload.
    ///
    /// The latest attempt always wins: the token is overwritten, and the
    /// claims are replaced on success or cleared on failure. A missing or
    /// empty token still counts as an attempt and leaves the connection
    /// [`AuthState::Unauthenticated`]. Malformed payloads are logged and
    /// dropped without touching the entry.
    ///
    /// Returns the resulting [`AuthState`], or `None` if the payload was
    /// dropped or the connection is no longer registered.
    pub fn authenticate(&self, id: &str, payload: &str) -> Option<AuthState> {
        let request: AuthPayload = match serde_json::from_str(payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(connection_id = %id, error = %err, "Malformed authRequest payload, ignoring");
                return None;
            }
        };

        let result = self.verifier.verify(&request.token);
        let claims = result.as_ref().ok().cloned();

        let Some(state) = self
            .registry
            .update(id, |entry| entry.record_auth(request.token, claims))
        else {
            debug!(connection_id = %id, "authRequest for unknown connection, ignoring");
            return None;
        };

        match result {
            Ok(claims) => info!(
                connection_id = %id,
                claim_count = claims.len(),
                "Authentication succeeded"
            ),
            Err(err) if err.is_time_error() => info!(
                connection_id = %id,
                error = %err,
                "Authentication failed, token outside its validity window"
            ),
            Err(err) if err.is_signature_error() => warn!(
                connection_id = %id,
                error = %err,
                "Authentication failed, token signature rejected"
            ),
            Err(err) => warn!(connection_id = %id, error = %err, "Authentication failed"),
        }

        Some(state)
    }

    /// Accepts a `control` payload. Nothing acts on it yet.
    pub fn control(&self, id: &str, payload: &str) {
        info!(connection_id = %id, payload = %payload, "Control message received");
    }

    /// Logs a transport-level error for the connection.
    pub fn error(&self, id: &str, message: &str) {
        warn!(connection_id = %id, error = %message, "Connection error");
    }

    /// Removes the connection. Unknown or already removed IDs are ignored.
    pub fn disconnect(&self, id: &str) {
        match self.registry.remove(id) {
            Some(_) => info!(
                connection_id = %id,
                connections = self.registry.len(),
                "Client disconnected"
            ),
            None => debug!(connection_id = %id, "Disconnect for unknown connection"),
        }
    }
}

impl fmt::Debug for LifecycleHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHandler")
            .field("registry", &self.registry)
            .finish()
    }
}
