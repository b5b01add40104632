//! Registry of live connections.
//!
//! The registry is the only state shared between the connection tasks and
//! the broadcast producer. It maps connection IDs to [`ConnectionEntry`]
//! values holding the send handle, the last token the client presented, and
//! the claims of that token if it verified.
//!
//! # Thread Safety
//!
//! A single [`RwLock`] guards the whole map. Every operation holds the lock
//! for one map operation and never across I/O. [`ConnectionRegistry::snapshot`]
//! copies the entries out so callers can send without holding the lock:
//!
//! - an entry removed after the snapshot may still get one send attempt,
//!   which fails harmlessly with [`SendError::Closed`];
//! - an entry inserted after the snapshot misses that broadcast round.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use pipecast_server::registry::{ChannelHandle, ConnectionEntry, ConnectionRegistry};
//!
//! let registry = ConnectionRegistry::new();
//! let (handle, mut rx) = ChannelHandle::channel();
//! registry.insert(ConnectionEntry::new("conn-1", Arc::new(handle)));
//!
//! for entry in registry.snapshot() {
//!     entry.emit("hoge", "payload").unwrap();
//! }
//! assert_eq!(rx.try_recv().unwrap().data_text(), "payload");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

use crate::auth::Claims;
use crate::types::Frame;

/// Errors returned by a connection's send handle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The underlying session is gone.
    #[error("connection closed")]
    Closed,
}

/// Capability to push an event to one specific client.
///
/// Implementations must not block: the producer calls `emit` once per
/// connection per broadcast round.
pub trait ConnectionHandle: Send + Sync {
    /// Queues `payload` under the event name `event`.
    fn emit(&self, event: &str, payload: &str) -> Result<(), SendError>;
}

/// Send handle backed by an unbounded channel.
///
/// The transport drains the receiving half into the socket; once it drops
/// the receiver every `emit` fails with [`SendError::Closed`].
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    tx: mpsc::UnboundedSender<Frame>,
}

impl ChannelHandle {
    /// Creates a handle and the receiver its frames are delivered to.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ConnectionHandle for ChannelHandle {
    fn emit(&self, event: &str, payload: &str) -> Result<(), SendError> {
        self.tx
            .send(Frame::new(event, payload))
            .map_err(|_| SendError::Closed)
    }
}

/// Authentication status derived from a connection entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// No token presented yet.
    Pending,
    /// The last presented token verified.
    Authenticated,
    /// The last presented token failed verification.
    Unauthenticated,
}

/// Per-connection state held in the registry.
#[derive(Clone)]
pub struct ConnectionEntry {
    /// Connection identifier assigned by the transport.
    pub id: String,

    /// Send capability for this connection.
    pub handle: Arc<dyn ConnectionHandle>,

    /// Last token string presented by the client; empty until the first
    /// authentication request.
    pub raw_token: String,

    /// Claims of `raw_token`, present only if it verified.
    pub claims: Option<Claims>,

    /// Set once the client has sent any authentication request, including
    /// one with an empty token.
    pub auth_attempted: bool,
}

impl ConnectionEntry {
    /// Creates an unauthenticated entry.
    pub fn new(id: impl Into<String>, handle: Arc<dyn ConnectionHandle>) -> Self {
        Self {
            id: id.into(),
            handle,
            raw_token: String::new(),
            claims: None,
            auth_attempted: false,
        }
    }

    /// Records an authentication attempt, replacing any earlier one.
    ///
    /// `claims` is `Some` only when `token` verified.
    pub fn record_auth(&mut self, token: String, claims: Option<Claims>) -> AuthState {
        self.raw_token = token;
        self.claims = claims;
        self.auth_attempted = true;
        self.auth_state()
    }

    /// Returns where this connection stands in the authentication flow.
    pub fn auth_state(&self) -> AuthState {
        match (&self.claims, self.auth_attempted) {
            (Some(_), _) => AuthState::Authenticated,
            (None, false) => AuthState::Pending,
            (None, true) => AuthState::Unauthenticated,
        }
    }

    /// Sends an event through this entry's handle.
    pub fn emit(&self, event: &str, payload: &str) -> Result<(), SendError> {
        self.handle.emit(event, payload)
    }
}

impl fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("id", &self.id)
            .field("has_token", &!self.raw_token.is_empty())
            .field("auth_state", &self.auth_state())
            .finish()
    }
}

/// Thread-safe map from connection ID to [`ConnectionEntry`].
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, ConnectionEntry>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `entry` under its own ID, returning any entry it replaced.
    pub fn insert(&self, entry: ConnectionEntry) -> Option<ConnectionEntry> {
        let mut connections = self.write();
        trace!(connection_id = %entry.id, "Registering connection");
        connections.insert(entry.id.clone(), entry)
    }

    /// Mutates the entry for `id` while holding the registry lock.
    ///
    /// Returns `None` without calling `f` if the connection is not
    /// registered. Keep `f` short and free of I/O.
    pub fn update<F, R>(&self, id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut ConnectionEntry) -> R,
    {
        let mut connections = self.write();
        connections.get_mut(id).map(f)
    }

    /// Removes the entry for `id`. Unknown IDs are a no-op.
    pub fn remove(&self, id: &str) -> Option<ConnectionEntry> {
        let removed = self.write().remove(id);
        if removed.is_some() {
            trace!(connection_id = %id, "Unregistered connection");
        }
        removed
    }

    /// Returns a point-in-time copy of every entry.
    ///
    /// Order is unspecified.
    pub fn snapshot(&self) -> Vec<ConnectionEntry> {
        self.read().values().cloned().collect()
    }

    /// Returns a copy of the entry for `id`.
    pub fn get(&self, id: &str) -> Option<ConnectionEntry> {
        self.read().get(id).cloned()
    }

    /// Returns `true` if `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    /// Returns the number of registered connections.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns `true` if no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // Every critical section leaves the map consistent, so a poisoned lock
    // still guards valid data.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ConnectionEntry>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ConnectionEntry>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &self.len())
            .finish()
    }
}
