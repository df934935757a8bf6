use std::time::Duration;

use serde::Deserialize;

/// Configuration for a single [`QueryStore`](crate::QueryStore) instance.
///
/// All durations deserialize in humantime notation (`"5m"`, `"1500ms"`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How long a successful result is served from cache.
    ///
    /// A zero TTL disables caching entirely; every trigger is treated as a
    /// cache miss.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,

    /// Total fetch attempts per cycle. Values below 1 are coerced up; a
    /// cycle always makes at least one attempt.
    pub retry_attempts: u32,

    /// Base delay for exponential backoff between attempts.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Interval for background polling of successfully fetched keys.
    /// `None` disables polling.
    #[serde(with = "humantime_serde")]
    pub refetch_interval: Option<Duration>,

    /// Minimum idle time before an unused, unsubscribed entry becomes
    /// eligible for eviction. Defaults to `max(2 * cache_ttl, 5 minutes)`.
    #[serde(with = "humantime_serde")]
    pub gc_grace_period: Option<Duration>,

    /// Label used in logs and passed to the error mapper.
    pub description: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5 * 60),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            refetch_interval: None,
            gc_grace_period: None,
            description: "query store".into(),
        }
    }
}

impl StoreConfig {
    /// Whether cached results are ever served.
    pub fn caching_enabled(&self) -> bool {
        !self.cache_ttl.is_zero()
    }

    /// The coerced total number of attempts per fetch cycle.
    pub fn max_attempts(&self) -> u32 {
        self.retry_attempts.max(1)
    }

    /// The grace period used by the garbage-collection sweep.
    pub fn effective_gc_grace(&self) -> Duration {
        self.gc_grace_period
            .unwrap_or_else(|| (self.cache_ttl.saturating_mul(2)).max(Duration::from_secs(5 * 60)))
    }
}

/// Configuration for the [`GcService`](crate::GcService).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// How often the periodic sweep visits every watched store.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// How long a store's entry count must stay at zero before the store is
    /// dropped from the sweep set.
    #[serde(with = "humantime_serde")]
    pub idle_debounce: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            idle_debounce: Duration::from_millis(1500),
        }
    }
}
