//! Dashboard sessions.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Idle time after which a session expires.
pub const SESSION_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Minimum time between two sweeps of expired sessions.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Name of the session cookie for a dashboard listening on `port`.
pub fn cookie_name(port: u16) -> String {
    format!("sessid_{port}")
}

#[derive(Debug, Clone)]
struct SessionEntry {
    created_at: DateTime<Utc>,
    last_access: Instant,
}

/// A session as seen by a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Whether the session was created for this request.
    pub is_new: bool,
}

/// In-memory session store with idle expiry.
#[derive(Debug)]
pub struct SessionManager {
    sessions: DashMap<String, SessionEntry>,
    lifetime: Duration,
    cleanup_interval: Duration,
    last_cleanup: Mutex<Instant>,
}

impl SessionManager {
    pub fn new(lifetime: Duration, cleanup_interval: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            lifetime,
            cleanup_interval,
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    /// Look up `id` and refresh it, or start a new session when it is missing
    /// or expired.
    pub fn get_or_create(&self, id: Option<&str>) -> Session {
        self.maybe_cleanup();
        let now = Instant::now();

        if let Some(id) = id
            && let Some(mut entry) = self.sessions.get_mut(id)
            && now.duration_since(entry.last_access) < self.lifetime
        {
            entry.last_access = now;
            return Session {
                id: id.to_string(),
                created_at: entry.created_at,
                is_new: false,
            };
        }

        let id = Uuid::new_v4().simple().to_string();
        let created_at = Utc::now();
        self.sessions.insert(
            id.clone(),
            SessionEntry {
                created_at,
                last_access: now,
            },
        );
        debug!(session = %id, "Session created");
        Session {
            id,
            created_at,
            is_new: true,
        }
    }

    pub fn invalidate(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove expired sessions. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        *self.last_cleanup.lock() = now;

        let before = self.sessions.len();
        self.sessions
            .retain(|_, entry| now.duration_since(entry.last_access) < self.lifetime);
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            debug!(removed, "Expired sessions removed");
        }
        removed
    }

    fn maybe_cleanup(&self) {
        let due = self.last_cleanup.lock().elapsed() >= self.cleanup_interval;
        if due {
            self.cleanup();
        }
    }

    /// Sweep expired sessions every cleanup interval until `cancel` fires.
    pub fn start_cleanup_task(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(manager.cleanup_interval) => {
                        manager.maybe_cleanup();
                    }
                }
            }
        })
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SESSION_LIFETIME, CLEANUP_INTERVAL)
    }
}
