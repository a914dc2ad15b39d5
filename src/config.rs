//! Process-wide limits and admission configuration.
//!
//! DESIGN
//! ======
//! `GlobalConfig` is built once at startup from environment variables and
//! never mutated afterwards. Handlers receive it behind an `Arc` via
//! `AppState`, so every limit check reads plain fields with no locking.

/// Immutable global limits. Defaults match production tuning; each numeric
/// field can be overridden through the environment variable of the same
/// name in SCREAMING_SNAKE_CASE.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    /// Maximum concurrent connections per room.
    pub max_room_size: usize,
    /// Maximum drawing objects per room.
    pub max_objects: usize,
    /// Maximum inbound frame size in bytes. Oversized frames are dropped.
    pub max_message_size: usize,
    /// Maximum rooms across the process.
    pub max_rooms: usize,
    /// Maximum nesting depth of an object payload.
    pub max_object_depth: usize,
    /// Maximum total key count of an object payload.
    pub max_object_elements: usize,
    /// Sustained per-session message rate.
    pub messages_per_second: f64,
    /// Per-session burst allowance on top of the sustained rate.
    pub burst_size: u32,
    /// Exact-match origin allow-list, parsed from `DOMAINS`.
    pub allowed_origins: Vec<String>,
}

const DEFAULT_MAX_ROOM_SIZE: usize = 10;
const DEFAULT_MAX_OBJECTS: usize = 10_000;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 100_000; // 100KB
const DEFAULT_MAX_ROOMS: usize = 1000;
const DEFAULT_MAX_OBJECT_DEPTH: usize = 10;
const DEFAULT_MAX_OBJECT_ELEMENTS: usize = 1000;
const DEFAULT_MESSAGES_PER_SECOND: f64 = 30.0;
const DEFAULT_BURST_SIZE: u32 = 10;

/// Read an environment variable, falling back to `default` when the
/// variable is missing or unparseable.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl GlobalConfig {
    pub fn from_env() -> Self {
        Self {
            max_room_size: env_parse("MAX_ROOM_SIZE", DEFAULT_MAX_ROOM_SIZE),
            max_objects: env_parse("MAX_OBJECTS", DEFAULT_MAX_OBJECTS),
            max_message_size: env_parse("MAX_MESSAGE_SIZE", DEFAULT_MAX_MESSAGE_SIZE),
            max_rooms: env_parse("MAX_ROOMS", DEFAULT_MAX_ROOMS),
            max_object_depth: env_parse("MAX_OBJECT_DEPTH", DEFAULT_MAX_OBJECT_DEPTH),
            max_object_elements: env_parse("MAX_OBJECT_ELEMENTS", DEFAULT_MAX_OBJECT_ELEMENTS),
            messages_per_second: env_parse("MESSAGES_PER_SECOND", DEFAULT_MESSAGES_PER_SECOND),
            burst_size: env_parse("BURST_SIZE", DEFAULT_BURST_SIZE),
            allowed_origins: parse_domains(&std::env::var("DOMAINS").unwrap_or_default()),
        }
    }

    /// Exact-match origin check. A request with no `Origin` header compares
    /// as the empty string, which matches an unset `DOMAINS` allow-list so
    /// non-browser clients can connect in development.
    #[must_use]
    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|allowed| allowed == origin)
    }
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            max_room_size: DEFAULT_MAX_ROOM_SIZE,
            max_objects: DEFAULT_MAX_OBJECTS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_rooms: DEFAULT_MAX_ROOMS,
            max_object_depth: DEFAULT_MAX_OBJECT_DEPTH,
            max_object_elements: DEFAULT_MAX_OBJECT_ELEMENTS,
            messages_per_second: DEFAULT_MESSAGES_PER_SECOND,
            burst_size: DEFAULT_BURST_SIZE,
            allowed_origins: parse_domains(""),
        }
    }
}

fn parse_domains(raw: &str) -> Vec<String> {
    raw.split(',').map(|d| d.trim().to_string()).collect()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_tuning() {
        let cfg = GlobalConfig::default();
        assert_eq!(cfg.max_room_size, 10);
        assert_eq!(cfg.max_objects, 10_000);
        assert_eq!(cfg.max_message_size, 100_000);
        assert_eq!(cfg.max_rooms, 1000);
        assert!((cfg.messages_per_second - 30.0).abs() < f64::EPSILON);
        assert_eq!(cfg.burst_size, 10);
    }

    #[test]
    fn origin_allowed_exact_match() {
        let cfg = GlobalConfig {
            allowed_origins: parse_domains("https://a.example, https://b.example"),
            ..GlobalConfig::default()
        };
        assert!(cfg.origin_allowed("https://a.example"));
        assert!(cfg.origin_allowed("https://b.example"));
        assert!(!cfg.origin_allowed("https://evil.example"));
        assert!(!cfg.origin_allowed("https://a.example.evil"));
    }

    #[test]
    fn empty_allow_list_matches_missing_origin_only() {
        let cfg = GlobalConfig::default();
        assert!(cfg.origin_allowed(""));
        assert!(!cfg.origin_allowed("https://a.example"));
    }

    #[test]
    fn domains_are_trimmed() {
        let cfg = GlobalConfig {
            allowed_origins: parse_domains(" https://a.example ,https://b.example"),
            ..GlobalConfig::default()
        };
        assert!(cfg.origin_allowed("https://a.example"));
        assert!(cfg.origin_allowed("https://b.example"));
    }
}
