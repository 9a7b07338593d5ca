use std::hash::Hash;
use std::time::Duration;

use meridian_core::DEFAULT_OWNED_BY_LABEL;
use meridian_queue::{controller_rate_limiter, rate_limiter, MaxOf};
use serde::{Deserialize, Serialize};

/// Runtime knobs for the controller. Missing fields fall back to [`Default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Workers per queue.
    pub workers: usize,
    /// Requeues allowed before a failing key is dropped.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub qps: f64,
    pub burst: u32,
    /// Label marking derived resources; roots leave it unset or empty.
    pub owned_by_label: String,
    /// How long the host waits for caches to fill before starting workers.
    pub sync_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_retries: 5,
            base_delay: rate_limiter::DEFAULT_BASE_DELAY,
            max_delay: rate_limiter::DEFAULT_MAX_DELAY,
            qps: rate_limiter::DEFAULT_QPS,
            burst: rate_limiter::DEFAULT_BURST,
            owned_by_label: DEFAULT_OWNED_BY_LABEL.to_string(),
            sync_timeout: Duration::from_secs(60),
        }
    }
}

impl ControllerConfig {
    pub fn rate_limiter<K>(&self) -> MaxOf<K>
    where
        K: Clone + Eq + Hash + Send + 'static,
    {
        controller_rate_limiter(self.base_delay, self.max_delay, self.qps, self.burst)
    }
}
