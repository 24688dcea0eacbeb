//! Push hub - real-time fan-out to connected dashboards.
//!
//! Each dashboard holds one server->client event stream. The hub keeps a
//! registry of bounded per-client queues; every event is serialised once
//! and offered to every queue without blocking. A client that cannot keep
//! up accumulates drops and is evicted past the threshold, so one slow
//! consumer never stalls the pipeline.
//!
//! Events are generic JSON objects framed as `data: <json>\n\n`; a comment
//! frame `: keepalive\n\n` goes out every 30 s so idle proxies keep the
//! stream open. Every 5 minutes the hub revalidates each client's session
//! and closes the ones whose session expired, after pushing an
//! `auth-expired` event they can react to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use errly_core::GroupSummary;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use errly_store::Store;

/// Keepalive comment cadence.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Session revalidation cadence.
pub const REVALIDATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Drops after which a client is evicted.
pub const MAX_DROPPED_MESSAGES: u32 = 50;

/// Per-client queue depth.
pub const CLIENT_QUEUE_CAPACITY: usize = 64;

/// Events pushed to dashboards.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PushEvent {
    /// A new error group was created.
    NewError {
        /// Summary of the new group.
        error: GroupSummary,
    },
    /// An existing group changed (recurrence or status).
    ErrorUpdated {
        /// Summary of the updated group.
        error: GroupSummary,
    },
    /// Specific groups were deleted.
    ErrorCleared {
        /// Ids of the deleted groups.
        ids: Vec<String>,
    },
    /// A large number of groups was deleted; refetch instead.
    BulkCleared,
    /// The client's session is no longer valid.
    AuthExpired,
}

/// One frame on a client's wire.
#[derive(Debug, Clone)]
pub enum Frame {
    /// A serialised event, framed as `data: <json>\n\n`.
    Event(Arc<String>),
    /// The `: keepalive\n\n` comment.
    Keepalive,
}

impl Frame {
    /// Wire bytes for this frame.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Event(json) => format!("data: {json}\n\n").into_bytes(),
            Self::Keepalive => b": keepalive\n\n".to_vec(),
        }
    }
}

struct HubClient {
    session_id: String,
    tx: mpsc::Sender<Frame>,
    dropped: u32,
}

/// Registry of connected dashboard streams.
pub struct PushHub {
    clients: Mutex<HashMap<u64, HubClient>>,
    next_id: AtomicU64,
    max_clients: usize,
    store: Store,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PushHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushHub")
            .field("clients", &self.client_count())
            .field("max_clients", &self.max_clients)
            .finish()
    }
}

impl PushHub {
    /// Create a hub with the given client cap.
    #[must_use]
    pub fn new(store: Store, max_clients: usize) -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_clients,
            store,
            cancel: CancellationToken::new(),
        })
    }

    /// Start the keepalive and session-revalidation tasks.
    pub fn start(self: &Arc<Self>) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = hub.cancel.cancelled() => return,
                    _ = interval.tick() => hub.send_keepalives(),
                }
            }
        });

        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REVALIDATION_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = hub.cancel.cancelled() => return,
                    _ = interval.tick() => hub.revalidate_sessions().await,
                }
            }
        });
    }

    /// Register a new client. Fails when the hub is at capacity.
    ///
    /// The session itself must already be validated by the caller; the
    /// hub keeps the id so it can revalidate later.
    pub fn subscribe(&self, session_id: &str) -> Option<(u64, mpsc::Receiver<Frame>)> {
        let mut clients = self.clients.lock().expect("hub lock poisoned");
        if clients.len() >= self.max_clients {
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        clients.insert(
            id,
            HubClient {
                session_id: session_id.to_owned(),
                tx,
                dropped: 0,
            },
        );
        tracing::debug!(client_id = id, clients = clients.len(), "sse client connected");
        Some((id, rx))
    }

    /// Remove a client (stream closed or handler dropped).
    pub fn unsubscribe(&self, id: u64) {
        let mut clients = self.clients.lock().expect("hub lock poisoned");
        if clients.remove(&id).is_some() {
            tracing::debug!(client_id = id, clients = clients.len(), "sse client disconnected");
        }
    }

    /// Connected client count.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.lock().expect("hub lock poisoned").len()
    }

    /// Broadcast an event to every client, non-blocking.
    ///
    /// A full queue counts one drop against the client; past the threshold
    /// the client is evicted. A closed queue evicts immediately.
    pub fn broadcast(&self, event: &PushEvent) {
        let json = match serde_json::to_string(event) {
            Ok(json) => Arc::new(json),
            Err(e) => {
                tracing::error!(error = %e, "push event serialisation failed");
                return;
            }
        };
        self.offer_frame(&Frame::Event(json));
    }

    fn send_keepalives(&self) {
        self.offer_frame(&Frame::Keepalive);
    }

    fn offer_frame(&self, frame: &Frame) {
        let mut clients = self.clients.lock().expect("hub lock poisoned");
        let mut evict = Vec::new();

        for (&id, client) in clients.iter_mut() {
            match client.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    client.dropped += 1;
                    if client.dropped > MAX_DROPPED_MESSAGES {
                        evict.push(id);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => evict.push(id),
            }
        }

        for id in evict {
            if let Some(client) = clients.remove(&id) {
                tracing::warn!(
                    client_id = id,
                    dropped = client.dropped,
                    "evicting slow or closed sse client"
                );
            }
        }
    }

    /// Drop clients whose session is gone or expired, telling them first.
    async fn revalidate_sessions(&self) {
        let now_ms = chrono::Utc::now().timestamp_millis();

        // Expired sessions also leave the store here.
        if let Err(e) = self.store.delete_expired_sessions(now_ms).await {
            tracing::warn!(error = %e, "session expiry sweep failed");
        }

        let snapshot: Vec<(u64, String)> = {
            let clients = self.clients.lock().expect("hub lock poisoned");
            clients
                .iter()
                .map(|(&id, c)| (id, c.session_id.clone()))
                .collect()
        };

        let expired_json = match serde_json::to_string(&PushEvent::AuthExpired) {
            Ok(json) => Arc::new(json),
            Err(_) => return,
        };

        for (id, session_id) in snapshot {
            let valid = match self.store.get_session(&session_id).await {
                Ok(Some(session)) => !session.is_expired(now_ms),
                Ok(None) => false,
                Err(e) => {
                    tracing::warn!(error = %e, "session lookup failed during revalidation");
                    continue;
                }
            };
            if valid {
                continue;
            }

            let mut clients = self.clients.lock().expect("hub lock poisoned");
            if let Some(client) = clients.remove(&id) {
                let _ = client.tx.try_send(Frame::Event(Arc::clone(&expired_json)));
                tracing::info!(client_id = id, "sse client session expired");
            }
        }
    }

    /// Broadcast `auth-expired`, drop every client, and stop the timers.
    pub fn shutdown(&self) {
        self.broadcast(&PushEvent::AuthExpired);
        self.clients.lock().expect("hub lock poisoned").clear();
        self.cancel.cancel();
    }
}
