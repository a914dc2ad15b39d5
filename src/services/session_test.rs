use super::*;

fn store() -> SessionStore {
    SessionStore::new(30.0, 10)
}

// =============================================================================
// identifier generation
// =============================================================================

#[test]
fn generate_user_id_is_32_hex_chars() {
    let id = generate_user_id();
    assert_eq!(id.len(), 32);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn generate_session_token_is_64_hex_chars() {
    let token = generate_session_token();
    assert_eq!(token.len(), 64);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn generated_identifiers_differ() {
    assert_ne!(generate_user_id(), generate_user_id());
    assert_ne!(generate_session_token(), generate_session_token());
}

#[test]
fn bytes_to_hex_known_values() {
    assert_eq!(bytes_to_hex(&[]), "");
    assert_eq!(bytes_to_hex(&[0xde, 0xad, 0xbe, 0xef]), "deadbeef");
    assert_eq!(bytes_to_hex(&[0x0a, 0x00]), "0a00");
}

// =============================================================================
// authenticate
// =============================================================================

#[test]
fn no_token_mints_fresh_identity() {
    let store = store();
    let identity = store.authenticate(None);
    assert!(identity.is_new);
    assert_eq!(identity.user_id.len(), 32);
    assert_eq!(identity.token.len(), 64);
    assert_eq!(store.len(), 1);
}

#[test]
fn live_token_resumes_same_identity() {
    let store = store();
    let first = store.authenticate(None);
    let second = store.authenticate(Some(&first.token));
    assert!(!second.is_new);
    assert_eq!(second.user_id, first.user_id);
    assert_eq!(second.token, first.token);
    assert_eq!(store.len(), 1);
}

#[test]
fn unknown_token_mints_fresh_identity_instead_of_failing() {
    let store = store();
    let identity = store.authenticate(Some("not-a-real-token"));
    assert!(identity.is_new);
    assert_ne!(identity.token, "not-a-real-token");
}

#[test]
fn empty_token_treated_as_absent() {
    let store = store();
    let identity = store.authenticate(Some(""));
    assert!(identity.is_new);
}

#[test]
fn validate_token_round_trip() {
    let store = store();
    let identity = store.authenticate(None);
    assert_eq!(store.validate_token(&identity.token), Some(identity.user_id));
    assert_eq!(store.validate_token("bogus"), None);
}

// =============================================================================
// bijection
// =============================================================================

#[test]
fn token_index_tracks_sessions() {
    let store = store();
    let a = store.authenticate(None);
    let b = store.authenticate(None);
    assert_ne!(a.user_id, b.user_id);
    assert_eq!(store.len(), 2);
    assert_eq!(store.token_index_len(), 2);
}

#[test]
fn remove_drops_both_indices() {
    let store = store();
    let identity = store.authenticate(None);
    store.remove(&identity.user_id);
    assert_eq!(store.len(), 0);
    assert_eq!(store.token_index_len(), 0);
    assert_eq!(store.validate_token(&identity.token), None);
}

#[test]
fn remove_unknown_user_is_noop() {
    let store = store();
    store.authenticate(None);
    store.remove("missing");
    assert_eq!(store.len(), 1);
    assert_eq!(store.token_index_len(), 1);
}

// =============================================================================
// last room
// =============================================================================

#[test]
fn last_room_round_trip() {
    let store = store();
    let identity = store.authenticate(None);
    assert_eq!(store.last_room(&identity.user_id), None);
    store.set_last_room(&identity.user_id, "r1");
    assert_eq!(store.last_room(&identity.user_id), Some("r1".to_string()));
}

// =============================================================================
// rate limiting
// =============================================================================

#[test]
fn object_bucket_allows_burst_then_denies() {
    let store = store();
    let identity = store.authenticate(None);
    let now = Instant::now();

    for i in 0..10 {
        assert!(store.allow_message_at(&identity.user_id, now), "message {i}");
    }
    assert!(!store.allow_message_at(&identity.user_id, now));
}

#[test]
fn object_bucket_sustains_configured_rate() {
    let store = store();
    let identity = store.authenticate(None);
    let start = Instant::now();

    for _ in 0..10 {
        store.allow_message_at(&identity.user_id, start);
    }
    assert!(!store.allow_message_at(&identity.user_id, start));

    // 30 msg/s: one token back every ~33ms.
    let later = start + Duration::from_millis(40);
    assert!(store.allow_message_at(&identity.user_id, later));
}

#[test]
fn cursor_bucket_is_separate_from_object_bucket() {
    let store = store();
    let identity = store.authenticate(None);
    let now = Instant::now();

    for _ in 0..10 {
        store.allow_message_at(&identity.user_id, now);
    }
    assert!(!store.allow_message_at(&identity.user_id, now));

    // Cursor bucket still has its full burst of 20.
    for i in 0..20 {
        assert!(store.allow_cursor_at(&identity.user_id, now), "cursor {i}");
    }
    assert!(!store.allow_cursor_at(&identity.user_id, now));
}

#[test]
fn unknown_session_is_denied() {
    let store = store();
    assert!(!store.allow_message("missing"));
    assert!(!store.allow_cursor("missing"));
    assert!(!store.throttle_cursor("missing"));
}

// =============================================================================
// cursor throttle
// =============================================================================

#[test]
fn cursor_throttle_enforces_min_interval() {
    let store = store();
    let identity = store.authenticate(None);
    let start = Instant::now();

    assert!(store.throttle_cursor_at(&identity.user_id, start));
    assert!(!store.throttle_cursor_at(&identity.user_id, start + Duration::from_millis(10)));
    assert!(!store.throttle_cursor_at(&identity.user_id, start + Duration::from_millis(32)));
    assert!(store.throttle_cursor_at(&identity.user_id, start + Duration::from_millis(33)));
}

#[test]
fn cursor_throttle_first_update_always_passes() {
    let store = store();
    let identity = store.authenticate(None);
    assert!(store.throttle_cursor(&identity.user_id));
}

// =============================================================================
// cleanup
// =============================================================================

#[test]
fn cleanup_drops_idle_sessions_and_tokens() {
    let store = store();
    let now = Instant::now();
    let stale = store.authenticate_at(None, now);
    let fresh = store.authenticate_at(None, now + Duration::from_secs(3000));

    let removed = store.cleanup_at(now + Duration::from_secs(3601));
    assert_eq!(removed, 1);
    assert_eq!(store.len(), 1);
    assert_eq!(store.token_index_len(), 1);
    assert_eq!(store.validate_token(&stale.token), None);
    assert_eq!(store.validate_token(&fresh.token), Some(fresh.user_id));
}

#[test]
fn cleanup_keeps_session_at_exact_ttl() {
    let store = store();
    let now = Instant::now();
    store.authenticate_at(None, now);
    assert_eq!(store.cleanup_at(now + Duration::from_secs(3600)), 0);
    assert_eq!(store.len(), 1);
}

#[test]
fn activity_defers_cleanup() {
    let store = store();
    let now = Instant::now();
    let identity = store.authenticate_at(None, now);

    // A granted message at t+30min resets the idle clock.
    assert!(store.allow_message_at(&identity.user_id, now + Duration::from_secs(1800)));
    assert_eq!(store.cleanup_at(now + Duration::from_secs(3601)), 0);
    assert_eq!(store.len(), 1);
}
