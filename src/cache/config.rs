//! Query cache configuration.
//!
//! Controls store capacity, retry backoff and the garbage collection sweep
//! via the `[cache]` table of `vitrine.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_MAX_ENTRIES: usize = 1000;
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
const DEFAULT_GC_SWEEP_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entries kept before least-recently-used eviction.
    pub max_entries: usize,
    /// Fixed delay between retries of a transient failure.
    pub retry_delay_ms: u64,
    /// Interval of the background garbage collection sweep.
    pub gc_sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            gc_sweep_interval_ms: DEFAULT_GC_SWEEP_INTERVAL_MS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            max_entries: settings.max_entries,
            retry_delay_ms: settings.retry_delay_ms,
            gc_sweep_interval_ms: settings.gc_sweep_interval_ms,
        }
    }
}

impl CacheConfig {
    /// Returns the entry limit as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Sweep interval, never shorter than one millisecond.
    pub fn gc_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.gc_sweep_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.max_entries, 1000);
        assert_eq!(config.retry_delay(), Duration::from_secs(1));
        assert_eq!(config.gc_sweep_interval(), Duration::from_secs(60));
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            max_entries: 0,
            ..Default::default()
        };
        assert_eq!(config.max_entries_non_zero().get(), 1);
    }

    #[test]
    fn zero_sweep_interval_is_clamped() {
        let config = CacheConfig {
            gc_sweep_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.gc_sweep_interval(), Duration::from_millis(1));
    }
}
