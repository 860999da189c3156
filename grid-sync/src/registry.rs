//! Live sessions and broadcast fan-out.
//!
//! Every registered session holds a receiver on one tokio broadcast channel,
//! so a send is O(1) regardless of how many sessions are connected. Frames
//! are pre-encoded once and shared behind an `Arc`.
//!
//! Whether a session sees its own edits echoed back is decided here, by
//! [`SessionRegistry::recipients`] and the matching filter inside
//! [`SessionReceiver::recv`].
//!
//! The session map has its own lock; registering or dropping a session never
//! waits on a grid edit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::error::SyncError;
use crate::protocol::{GridMessage, ProtocolError};

/// One live connection and the identity its edits are attributed to.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub connection_id: Uuid,
    pub identity: String,
    pub connected_at: Instant,
}

/// A pre-encoded frame plus the session it originated from.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub origin: Uuid,
    pub bytes: Arc<Vec<u8>>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_sessions: usize,
}

/// Atomic broadcast stats — no lock on the send path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Receiving end handed to a session at registration.
pub struct SessionReceiver {
    connection_id: Uuid,
    echo_to_sender: bool,
    rx: broadcast::Receiver<Outbound>,
    stats: Arc<AtomicBroadcastStats>,
}

impl SessionReceiver {
    /// Next frame addressed to this session.
    ///
    /// Frames lost to lag are counted and skipped; a slow session simply
    /// misses them and re-syncs by fetching a snapshot. Returns `None` once
    /// the registry is gone.
    pub async fn recv(&mut self) -> Option<Arc<Vec<u8>>> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => {
                    if !self.echo_to_sender && frame.origin == self.connection_id {
                        continue;
                    }
                    return Some(frame.bytes);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
                    log::warn!("Session {} lagged by {n} messages", self.connection_id);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }
}

/// Registry of connected sessions.
pub struct SessionRegistry {
    sender: broadcast::Sender<Outbound>,
    sessions: RwLock<HashMap<Uuid, Session>>,
    echo_to_sender: bool,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl SessionRegistry {
    /// `capacity` bounds how many frames a session may fall behind before
    /// it starts dropping them.
    pub fn new(capacity: usize, echo_to_sender: bool) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sessions: RwLock::new(HashMap::new()),
            echo_to_sender,
            capacity,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Admit a session. Fails if `connection_id` is already registered.
    pub async fn register(
        &self,
        connection_id: Uuid,
        identity: impl Into<String>,
    ) -> Result<SessionReceiver, SyncError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&connection_id) {
            return Err(SyncError::DuplicateConnection(connection_id));
        }
        let identity = identity.into();
        log::debug!("Registering session {connection_id} as {identity}");
        sessions.insert(
            connection_id,
            Session {
                connection_id,
                identity,
                connected_at: Instant::now(),
            },
        );
        // Subscribe while holding the lock so no broadcast addressed to the
        // new session can slip between insert and subscribe.
        let rx = self.sender.subscribe();
        Ok(SessionReceiver {
            connection_id,
            echo_to_sender: self.echo_to_sender,
            rx,
            stats: self.stats.clone(),
        })
    }

    /// Remove a session; absent sessions are not an error.
    pub async fn unregister(&self, connection_id: &Uuid) -> Option<Session> {
        self.sessions.write().await.remove(connection_id)
    }

    pub async fn identity_of(&self, connection_id: &Uuid) -> Result<String, SyncError> {
        self.sessions
            .read()
            .await
            .get(connection_id)
            .map(|s| s.identity.clone())
            .ok_or(SyncError::UnknownConnection(*connection_id))
    }

    /// Every registered connection other than `connection_id`.
    pub async fn all_except(&self, connection_id: &Uuid) -> Vec<Uuid> {
        self.sessions
            .read()
            .await
            .keys()
            .filter(|id| *id != connection_id)
            .copied()
            .collect()
    }

    /// Sessions that receive a broadcast originating from `origin`.
    pub async fn recipients(&self, origin: &Uuid) -> Vec<Uuid> {
        if self.echo_to_sender {
            self.sessions.read().await.keys().copied().collect()
        } else {
            self.all_except(origin).await
        }
    }

    /// Encode `msg` once and fan it out. Returns the number of sessions it
    /// is addressed to.
    pub async fn broadcast(&self, origin: Uuid, msg: &GridMessage) -> Result<usize, ProtocolError> {
        let bytes = Arc::new(msg.encode()?);
        let recipients = self.recipients(&origin).await.len();
        // Err only means nobody is subscribed right now.
        let _ = self.sender.send(Outbound { origin, bytes });
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(recipients)
    }

    pub async fn sessions(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub fn echo_to_sender(&self) -> bool {
        self.echo_to_sender
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_sessions: self.len().await,
        }
    }
}
