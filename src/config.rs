//! Bus configuration.

use serde::Deserialize;

/// Default EXPIRE value applied to streams by the maintenance worker, in seconds.
pub const DEFAULT_STREAM_TTL_SECS: u64 = 3600;

/// Lower bound for the stream TTL; smaller configured values are raised to this.
pub const MIN_STREAM_TTL_SECS: u64 = 300;

/// Default XTRIM MAXLEN target.
pub const DEFAULT_MAX_MESSAGE_COUNT: usize = 5000;

/// Default advisory message retention, in milliseconds.
pub const DEFAULT_MESSAGE_RETENTION_MS: u64 = 300_000;

/// Which sides of the bus an instance participates in.
///
/// `Publisher` skips starting the reader loops; publishing is available in
/// every role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Publish only; no reader loops are started.
    Publisher,
    /// Consume only.
    Consumer,
    /// Publish and consume.
    #[default]
    Both,
}

impl Role {
    /// Whether this role starts the stream reader loops.
    pub fn consumes(&self) -> bool {
        matches!(self, Role::Consumer | Role::Both)
    }
}

/// Configuration for an event bus instance.
///
/// Two instances with the same `name` against the same store share a logical
/// bus; different names are fully isolated.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Redis connection URL (e.g., redis://localhost:6379).
    pub url: String,
    /// Bus namespace; all keys derive from it.
    pub name: String,
    /// Advisory retention window in milliseconds. Surfaced to readers but not
    /// enforced; `max_message_count` is the operative retention control.
    pub message_retention_ms: u64,
    /// EXPIRE value renewed on every stream by maintenance, in seconds.
    /// Values below [`MIN_STREAM_TTL_SECS`] are silently raised.
    pub stream_ttl_secs: u64,
    /// Start consumer groups at the stream tail (`$`) instead of the
    /// beginning (`0`), skipping history present before this instance joined.
    pub only_new: bool,
    /// Enables per-record diagnostic logging.
    pub debug: bool,
    /// XTRIM MAXLEN target applied by maintenance.
    pub max_message_count: usize,
    /// Which sides of the bus this instance participates in.
    pub role: Role,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            name: "default".to_string(),
            message_retention_ms: DEFAULT_MESSAGE_RETENTION_MS,
            stream_ttl_secs: DEFAULT_STREAM_TTL_SECS,
            only_new: false,
            debug: false,
            max_message_count: DEFAULT_MAX_MESSAGE_COUNT,
            role: Role::Both,
        }
    }
}

impl BusConfig {
    /// Create a config with defaults for the given store URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the bus namespace.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the stream TTL in seconds.
    pub fn with_stream_ttl_secs(mut self, secs: u64) -> Self {
        self.stream_ttl_secs = secs;
        self
    }

    /// Start consumer groups at the stream tail instead of the beginning.
    pub fn with_only_new(mut self, only_new: bool) -> Self {
        self.only_new = only_new;
        self
    }

    /// Enable per-record diagnostic logging.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set the XTRIM MAXLEN target.
    pub fn with_max_message_count(mut self, count: usize) -> Self {
        self.max_message_count = count;
        self
    }

    /// Set the advisory message retention window in milliseconds.
    pub fn with_message_retention_ms(mut self, ms: u64) -> Self {
        self.message_retention_ms = ms;
        self
    }

    /// Set the participation role.
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// The stream TTL actually applied, clamped to the minimum.
    pub fn effective_stream_ttl_secs(&self) -> u64 {
        self.stream_ttl_secs.max(MIN_STREAM_TTL_SECS)
    }

    /// Group start id for XGROUP CREATE: tail when `only_new`, else beginning.
    pub fn group_start_id(&self) -> &'static str {
        if self.only_new {
            "$"
        } else {
            "0"
        }
    }
}
