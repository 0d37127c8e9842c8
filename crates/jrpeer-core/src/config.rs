//! Peer configuration.

use std::time::Duration;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(3000);
pub const DEFAULT_MAX_PENDING: usize = 8192;

/// Environment variable overriding [`PeerConfig::call_timeout`], in milliseconds.
pub const CALL_TIMEOUT_ENV: &str = "JRPEER_CALL_TIMEOUT_MS";
/// Environment variable overriding [`PeerConfig::max_pending`].
pub const MAX_PENDING_ENV: &str = "JRPEER_MAX_PENDING";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Timeout applied to each outbound call unless the request overrides it.
    pub call_timeout: Duration,
    /// Upper bound on outbound calls awaiting a response.
    pub max_pending: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

impl PeerConfig {
    /// Defaults, overridden by `JRPEER_CALL_TIMEOUT_MS` and `JRPEER_MAX_PENDING`.
    ///
    /// Values that fail to parse, or are zero, are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(ms) = positive(lookup(CALL_TIMEOUT_ENV)) {
            config.call_timeout = Duration::from_millis(ms as u64);
        }
        if let Some(max) = positive(lookup(MAX_PENDING_ENV)) {
            config.max_pending = max;
        }
        config
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }
}

fn positive(raw: Option<String>) -> Option<usize> {
    raw.and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
}

/// Per-call options for [`Peer::request`](crate::Peer::request).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Overrides [`PeerConfig::call_timeout`] for every call in the request.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    pub fn timeout_ms(ms: u64) -> Self {
        Self::timeout(Duration::from_millis(ms))
    }
}
