//! Timeouts and cache lifetimes for outbound calls to peer scenarios.

use std::time::Duration;

/// Default timeout for `GET /api/v1/tools`.
pub const DEFAULT_MANIFEST_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default freshness window for a cached manifest.
pub const DEFAULT_MANIFEST_CACHE_TTL: Duration = Duration::from_secs(60);

/// Default timeout for `POST /api/v1/tools/execute`. Tool runs can be long.
pub const DEFAULT_TOOL_EXECUTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Default subprocess timeout for port lookup via the host CLI.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    pub manifest_fetch_timeout: Duration,
    pub manifest_cache_ttl: Duration,
    pub tool_execution_timeout: Duration,
    pub resolve_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            manifest_fetch_timeout: DEFAULT_MANIFEST_FETCH_TIMEOUT,
            manifest_cache_ttl: DEFAULT_MANIFEST_CACHE_TTL,
            tool_execution_timeout: DEFAULT_TOOL_EXECUTION_TIMEOUT,
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
        }
    }
}
