//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! Every field is an `Arc`-backed handle, so cloning the state is cheap
//! and all connections, sweepers, and handlers observe the same room
//! registry, session store, and IP limiter. Shared mutable state is
//! guarded per store; there is no global lock.

use std::sync::Arc;

use crate::config::GlobalConfig;
use crate::rate_limit::IpRateLimit;
use crate::services::room::RoomRegistry;
use crate::services::session::SessionStore;
use crate::validate::ObjectValidator;

/// Shared application state, injected into Axum handlers via the State
/// extractor. Clone is required by Axum; all inner fields are handles.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GlobalConfig>,
    pub rooms: RoomRegistry,
    pub sessions: SessionStore,
    pub ip_limiter: IpRateLimit,
    pub validator: Arc<ObjectValidator>,
}

impl AppState {
    #[must_use]
    pub fn new(config: GlobalConfig) -> Self {
        let validator = Arc::new(ObjectValidator::new(&config));
        Self {
            rooms: RoomRegistry::new(),
            sessions: SessionStore::new(config.messages_per_second, config.burst_size),
            ip_limiter: IpRateLimit::new(),
            validator,
            config: Arc::new(config),
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use super::*;

    /// Create an `AppState` with default limits.
    #[must_use]
    pub fn test_app_state() -> AppState {
        AppState::new(GlobalConfig::default())
    }

    /// Create an `AppState` with custom limits.
    #[must_use]
    pub fn test_app_state_with(config: GlobalConfig) -> AppState {
        AppState::new(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_state_is_empty() {
        let state = test_helpers::test_app_state();
        assert_eq!(state.rooms.room_count().await, 0);
        assert!(state.sessions.is_empty());
        assert!(state.ip_limiter.is_empty());
    }

    #[tokio::test]
    async fn clones_share_stores() {
        let state = test_helpers::test_app_state();
        let clone = state.clone();

        let identity = state.sessions.authenticate(None);
        assert_eq!(clone.sessions.validate_token(&identity.token), Some(identity.user_id));
    }
}
