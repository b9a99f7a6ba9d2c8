//! Per-client conversation state for one route. See `SPEC_FULL.md` §3, §9.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// How long an `HttpSession` may sit idle before it is evicted. Not named
/// by the original source (which never expires sessions); chosen per the
/// resolved open question in `SPEC_FULL.md` §9.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
pub struct HttpSession {
    pub initialized: bool,
    last_seen: Instant,
}

/// The per-route table of `HttpSession`s, keyed by session id. Mutated only
/// by that route's own request handlers; a single lock guards it.
pub struct SessionTable {
    sessions: Mutex<HashMap<String, HttpSession>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns whether `session_id` was already initialized, creating a
    /// fresh (uninitialized) entry on first sight. Sweeps idle entries
    /// lazily as part of this access.
    pub async fn is_initialized(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        evict_idle(&mut sessions);
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| HttpSession {
                initialized: false,
                last_seen: Instant::now(),
            });
        session.last_seen = Instant::now();
        session.initialized
    }

    /// Marks `session_id` as initialized. Assumes the entry already exists
    /// (created by a prior `is_initialized` call in the same request).
    pub async fn mark_initialized(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| HttpSession {
                initialized: false,
                last_seen: Instant::now(),
            });
        session.initialized = true;
        session.last_seen = Instant::now();
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

fn evict_idle(sessions: &mut HashMap<String, HttpSession>) {
    let now = Instant::now();
    sessions.retain(|_, session| now.duration_since(session.last_seen) < IDLE_TIMEOUT);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_sighting_is_not_initialized() {
        let table = SessionTable::new();
        assert!(!table.is_initialized("s1").await);
    }

    #[tokio::test]
    async fn mark_initialized_is_observed_on_next_lookup() {
        let table = SessionTable::new();
        assert!(!table.is_initialized("s1").await);
        table.mark_initialized("s1").await;
        assert!(table.is_initialized("s1").await);
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let table = SessionTable::new();
        table.mark_initialized("s1").await;
        assert!(!table.is_initialized("s2").await);
    }
}
