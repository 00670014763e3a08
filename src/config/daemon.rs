//! Daemon tuning knobs: timeouts, retry policy, packet limits, pools.

use serde::{Deserialize, Serialize};

use crate::agent::dashboard::DEFAULT_KARMA_SECS;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Listen specifications (see the listen grammar).
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
    /// Per-command read timeout for client connections, ms.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Write timeout for client replies, ms.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Idle timeout for persistent client connections, ms.
    #[serde(default = "default_client_timeout_ms")]
    pub client_timeout_ms: u64,
    /// Remote agent connect timeout, ms.
    #[serde(default = "default_agent_connect_timeout_ms")]
    pub agent_connect_timeout_ms: u64,
    /// Remote agent query timeout, ms.
    #[serde(default = "default_agent_query_timeout_ms")]
    pub agent_query_timeout_ms: u64,
    /// Default remote retry budget; index-scope settings override it.
    #[serde(default)]
    pub agent_retry_count: usize,
    /// Delay between remote retries, ms.
    #[serde(default = "default_agent_retry_delay_ms")]
    pub agent_retry_delay_ms: u64,
    /// Health aggregation window driving mirror weights, seconds.
    #[serde(default = "default_ha_period_karma_secs")]
    pub ha_period_karma_secs: u64,
    /// Interval between pings to HA mirrors, ms.
    #[serde(default = "default_ha_ping_interval_ms")]
    pub ha_ping_interval_ms: u64,
    /// Per-host persistent connection pool capacity; 0 disables pooling.
    #[serde(default)]
    pub persistent_pool_size: usize,
    /// Upper bound for any request or reply body, bytes.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Concurrent client connection cap; 0 means unlimited. VIP endpoints
    /// bypass the cap.
    #[serde(default)]
    pub max_connections: usize,
    /// Re-resolve agent host names on every connect.
    #[serde(default)]
    pub hostname_lookup: bool,
    /// Allow cross-origin requests on http endpoints (useful for
    /// browser-based clients).
    #[serde(default)]
    pub cors_enabled: bool,
}

fn default_listen() -> Vec<String> {
    vec![
        crate::wire::API_PORT.to_string(),
        format!("{}:mysql41", crate::wire::SQL_PORT),
    ]
}

fn default_read_timeout_ms() -> u64 {
    5_000
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_client_timeout_ms() -> u64 {
    300_000
}

fn default_agent_connect_timeout_ms() -> u64 {
    1_000
}

fn default_agent_query_timeout_ms() -> u64 {
    3_000
}

fn default_agent_retry_delay_ms() -> u64 {
    500
}

fn default_ha_period_karma_secs() -> u64 {
    DEFAULT_KARMA_SECS
}

fn default_ha_ping_interval_ms() -> u64 {
    1_000
}

fn default_max_packet_size() -> usize {
    8 * 1024 * 1024
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            client_timeout_ms: default_client_timeout_ms(),
            agent_connect_timeout_ms: default_agent_connect_timeout_ms(),
            agent_query_timeout_ms: default_agent_query_timeout_ms(),
            agent_retry_count: 0,
            agent_retry_delay_ms: default_agent_retry_delay_ms(),
            ha_period_karma_secs: default_ha_period_karma_secs(),
            ha_ping_interval_ms: default_ha_ping_interval_ms(),
            persistent_pool_size: 0,
            max_packet_size: default_max_packet_size(),
            max_connections: 0,
            hostname_lookup: false,
            cors_enabled: false,
        }
    }
}
