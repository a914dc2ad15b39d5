//! Session store — durable per-user identity across reconnects.
//!
//! ARCHITECTURE
//! ============
//! Identity is proven in-band: a client presenting a live session token
//! resumes its user id; anything else mints a fresh identity. Sessions
//! live only in memory and are swept after an hour of inactivity, so a
//! token is a continuity hint, not a credential with long-term value.
//!
//! DESIGN
//! ======
//! Two indices under one mutex: `user_id → UserSession` and
//! `token → user_id`. They form a bijection; every insert and evict
//! touches both inside the same critical section. Per-session rate
//! limiters live on the session so they survive reconnects too.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::rate_limit::TokenBucket;

/// Sessions idle for longer than this are dropped by the sweeper.
const SESSION_IDLE_TTL: Duration = Duration::from_secs(3600);

/// Cursor bucket: higher rate than object edits, cursors are cheap.
const CURSOR_MESSAGES_PER_SECOND: f64 = 60.0;
const CURSOR_BURST: u32 = 20;

/// Server-side cursor throttle (~30 fps).
const CURSOR_MIN_INTERVAL: Duration = Duration::from_millis(33);

pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Generate a random 128-bit hex user identifier.
#[must_use]
pub fn generate_user_id() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes_to_hex(&bytes)
}

/// Generate a cryptographically random 256-bit hex session token.
#[must_use]
pub fn generate_session_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    bytes_to_hex(&bytes)
}

// =============================================================================
// TYPES
// =============================================================================

/// Per-user state that outlives any single connection.
struct UserSession {
    token: String,
    last_room: Option<String>,
    last_seen: Instant,
    last_cursor_update: Option<Instant>,
    object_limiter: TokenBucket,
    cursor_limiter: TokenBucket,
}

/// Result of resolving a handshake token.
#[derive(Debug, Clone)]
pub struct AuthIdentity {
    pub user_id: String,
    pub token: String,
    pub is_new: bool,
}

struct StoreInner {
    sessions: HashMap<String, UserSession>,
    token_to_user: HashMap<String, String>,
}

/// Thread-safe two-index session store.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Mutex<StoreInner>>,
    messages_per_second: f64,
    burst_size: u32,
}

impl SessionStore {
    #[must_use]
    pub fn new(messages_per_second: f64, burst_size: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                sessions: HashMap::new(),
                token_to_user: HashMap::new(),
            })),
            messages_per_second,
            burst_size,
        }
    }

    // =========================================================================
    // IDENTITY
    // =========================================================================

    /// Resolve a handshake token into an identity. A live token resumes
    /// its session; a missing or unknown token mints a fresh identity
    /// rather than failing.
    pub fn authenticate(&self, token: Option<&str>) -> AuthIdentity {
        self.authenticate_at(token, Instant::now())
    }

    fn authenticate_at(&self, token: Option<&str>, now: Instant) -> AuthIdentity {
        let mut inner = self.inner.lock().unwrap();

        if let Some(token) = token.filter(|t| !t.is_empty()) {
            if let Some(user_id) = inner.token_to_user.get(token).cloned() {
                if let Some(session) = inner.sessions.get_mut(&user_id) {
                    session.last_seen = now;
                    return AuthIdentity { user_id, token: token.to_string(), is_new: false };
                }
            }
        }

        let user_id = generate_user_id();
        let token = generate_session_token();
        inner.sessions.insert(
            user_id.clone(),
            UserSession {
                token: token.clone(),
                last_room: None,
                last_seen: now,
                last_cursor_update: None,
                object_limiter: TokenBucket::new(self.messages_per_second, self.burst_size),
                cursor_limiter: TokenBucket::new(CURSOR_MESSAGES_PER_SECOND, CURSOR_BURST),
            },
        );
        inner.token_to_user.insert(token.clone(), user_id.clone());

        AuthIdentity { user_id, token, is_new: true }
    }

    /// Map a token back to its user id, if the session is live.
    #[must_use]
    pub fn validate_token(&self, token: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.token_to_user.get(token).cloned()
    }

    /// Remove a session and its token entry atomically.
    pub fn remove(&self, user_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.remove(user_id) {
            inner.token_to_user.remove(&session.token);
        }
    }

    // =========================================================================
    // PER-SESSION STATE
    // =========================================================================

    /// Record the room a user most recently joined.
    pub fn set_last_room(&self, user_id: &str, room: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.get_mut(user_id) {
            session.last_room = Some(room.to_string());
        }
    }

    #[must_use]
    pub fn last_room(&self, user_id: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.sessions.get(user_id).and_then(|s| s.last_room.clone())
    }

    /// Charge the session's object-message bucket. A granted message also
    /// counts as activity. Unknown sessions are denied.
    pub fn allow_message(&self, user_id: &str) -> bool {
        self.allow_message_at(user_id, Instant::now())
    }

    fn allow_message_at(&self, user_id: &str, now: Instant) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(session) = inner.sessions.get_mut(user_id) else {
            return false;
        };
        let allowed = session.object_limiter.allow_at(now);
        if allowed {
            session.last_seen = now;
        }
        allowed
    }

    /// Charge the session's cursor bucket.
    pub fn allow_cursor(&self, user_id: &str) -> bool {
        self.allow_cursor_at(user_id, Instant::now())
    }

    fn allow_cursor_at(&self, user_id: &str, now: Instant) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(session) = inner.sessions.get_mut(user_id) else {
            return false;
        };
        let allowed = session.cursor_limiter.allow_at(now);
        if allowed {
            session.last_seen = now;
        }
        allowed
    }

    /// Server-side cursor throttle: at most one update per 33ms. Passing
    /// records the update time.
    pub fn throttle_cursor(&self, user_id: &str) -> bool {
        self.throttle_cursor_at(user_id, Instant::now())
    }

    fn throttle_cursor_at(&self, user_id: &str, now: Instant) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(session) = inner.sessions.get_mut(user_id) else {
            return false;
        };
        if let Some(last) = session.last_cursor_update {
            if now.saturating_duration_since(last) < CURSOR_MIN_INTERVAL {
                return false;
            }
        }
        session.last_cursor_update = Some(now);
        true
    }

    // =========================================================================
    // SWEEP
    // =========================================================================

    /// Drop sessions idle past the TTL, removing both indices. Returns
    /// how many sessions were evicted.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    fn cleanup_at(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock().unwrap();

        let expired: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, session)| {
                now.saturating_duration_since(session.last_seen) > SESSION_IDLE_TTL
            })
            .map(|(user_id, _)| user_id.clone())
            .collect();

        for user_id in &expired {
            if let Some(session) = inner.sessions.remove(user_id) {
                inner.token_to_user.remove(&session.token);
            }
        }
        expired.len()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn token_index_len(&self) -> usize {
        self.inner.lock().unwrap().token_to_user.len()
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
