use std::time::Duration;

use crate::hub::HubConfig;

/// Relay API configuration, loaded from environment variables. Every knob
/// has a default, so an empty environment produces a working server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Number of hub shards in the pool.
    pub hub_shards: usize,
    /// Capacity of each shard's command queue.
    pub hub_queue_capacity: usize,
    /// Capacity of each connection's outbound queue.
    pub conn_queue_capacity: usize,
    /// Connections idle longer than this are reaped.
    pub inactivity_window: Duration,
    /// Interval between inactivity sweeps.
    pub sweep_interval: Duration,
    /// Lifetime of idempotent-write cache entries.
    pub idempotency_ttl: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            port: parsed_var("PORT", 4003),
            hub_shards: parsed_var("HUB_SHARDS", 4),
            hub_queue_capacity: parsed_var("HUB_QUEUE_CAPACITY", 1024),
            conn_queue_capacity: parsed_var("CONN_QUEUE_CAPACITY", 256),
            inactivity_window: Duration::from_secs(parsed_var("INACTIVITY_WINDOW_SECS", 60)),
            sweep_interval: Duration::from_secs(parsed_var("SWEEP_INTERVAL_SECS", 30)),
            idempotency_ttl: Duration::from_secs(parsed_var("IDEMPOTENCY_TTL_SECS", 60)),
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            queue_capacity: self.hub_queue_capacity,
            inactivity_window: self.inactivity_window,
            sweep_interval: self.sweep_interval,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4003,
            hub_shards: 4,
            hub_queue_capacity: 1024,
            conn_queue_capacity: 256,
            inactivity_window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            idempotency_ttl: Duration::from_secs(60),
        }
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
