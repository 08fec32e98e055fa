//! In-process table of the chat streams currently holding an upstream
//! connection open.
//!
//! Every streaming request registers itself under its client-supplied request
//! id so it can be cancelled from outside (explicit stop endpoint) and so
//! abandoned entries can be reclaimed. Reclamation is lazy: each incoming
//! request sweeps entries older than the TTL before registering its own, so
//! no background timer is needed.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug)]
pub struct StreamRegistration {
    pub request_id: String,
    pub user_id: Uuid,
    pub conversation_id: Uuid,
    pub cancel: CancellationToken,
    pub started_at: Instant,
}

#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: Mutex<HashMap<String, StreamRegistration>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StreamRegistration>> {
        // A panic while holding the lock poisons it; the map itself is still
        // consistent, so keep serving rather than propagating the poison.
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a registration. If an entry already exists under the same
    /// request id (a client retry), its token is cancelled before it is
    /// replaced, so the superseded stream stops instead of running on with no
    /// remaining cancellation path.
    pub fn register(&self, registration: StreamRegistration) {
        let mut streams = self.lock();
        if let Some(previous) = streams.insert(registration.request_id.clone(), registration) {
            warn!(
                "duplicate stream registration for request {}, cancelling the superseded stream",
                previous.request_id
            );
            previous.cancel.cancel();
        }
    }

    /// Remove a registration. Missing entries are expected (the caller may
    /// race with a stale sweep or an earlier unregister) and are not an error.
    pub fn unregister(&self, request_id: &str) {
        self.lock().remove(request_id);
    }

    /// Trigger cancellation of a live stream on behalf of its owner. Returns
    /// whether a stream owned by `user_id` was found; the entry itself stays
    /// registered until the stream's own finalization removes it.
    pub fn cancel(&self, request_id: &str, user_id: Uuid) -> bool {
        let streams = self.lock();
        match streams.get(request_id) {
            Some(registration) if registration.user_id == user_id => {
                debug!("cancelling stream {request_id} on user request");
                registration.cancel.cancel();
                true
            }
            Some(_) => {
                warn!("user {user_id} attempted to cancel stream {request_id} they do not own");
                false
            }
            None => false,
        }
    }

    /// Evict every registration older than `ttl`, cancelling its token so the
    /// abandoned stream releases its upstream connection. Returns the number
    /// of entries evicted.
    pub fn cleanup_stale(&self, now: Instant, ttl: Duration) -> usize {
        let mut streams = self.lock();
        let stale: Vec<String> = streams
            .iter()
            .filter(|(_, r)| now.duration_since(r.started_at) > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for request_id in &stale {
            if let Some(registration) = streams.remove(request_id) {
                warn!(
                    "evicting stale stream {} (conversation {}, user {})",
                    request_id, registration.conversation_id, registration.user_id
                );
                registration.cancel.cancel();
            }
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
