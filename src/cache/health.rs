//! Cache hit/miss accounting and health classification.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Below this many lookups the hit rate says nothing useful.
const MIN_LOOKUPS_FOR_HIT_RATE: u64 = 20;

#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
}

impl CacheMetrics {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, n: u64) {
        self.evictions.fetch_add(n, Ordering::Relaxed);
    }

    /// (hits, misses, writes, evictions)
    pub fn get_stats(&self) -> (u64, u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.writes.load(Ordering::Relaxed),
            self.evictions.load(Ordering::Relaxed),
        )
    }

    pub fn hit_rate(&self) -> Option<f64> {
        let hits = self.hits.load(Ordering::Relaxed);
        let lookups = hits + self.misses.load(Ordering::Relaxed);
        (lookups > 0).then(|| hits as f64 / lookups as f64)
    }

    fn lookups(&self) -> u64 {
        self.hits.load(Ordering::Relaxed) + self.misses.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub hit_rate: Option<f64>,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub entry_count: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub warning_ratio: f64,
    pub critical_ratio: f64,
    pub min_hit_rate: f64,
}

impl HealthReport {
    pub fn classify(
        metrics: &CacheMetrics,
        total_bytes: u64,
        max_bytes: u64,
        entry_count: usize,
        thresholds: HealthThresholds,
    ) -> Self {
        let usage = if max_bytes == 0 {
            1.0
        } else {
            total_bytes as f64 / max_bytes as f64
        };
        let hit_rate = metrics.hit_rate();

        let status = if usage >= thresholds.critical_ratio {
            HealthStatus::Critical
        } else if usage >= thresholds.warning_ratio {
            HealthStatus::Warning
        } else if metrics.lookups() >= MIN_LOOKUPS_FOR_HIT_RATE
            && hit_rate.is_some_and(|r| r < thresholds.min_hit_rate)
        {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            hit_rate,
            total_bytes,
            max_bytes,
            entry_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLDS: HealthThresholds = HealthThresholds {
        warning_ratio: 0.8,
        critical_ratio: 0.95,
        min_hit_rate: 0.25,
    };

    #[test]
    fn usage_drives_status() {
        let metrics = CacheMetrics::default();
        let healthy = HealthReport::classify(&metrics, 10, 100, 1, THRESHOLDS);
        let warning = HealthReport::classify(&metrics, 85, 100, 1, THRESHOLDS);
        let critical = HealthReport::classify(&metrics, 99, 100, 1, THRESHOLDS);

        assert_eq!(healthy.status, HealthStatus::Healthy);
        assert_eq!(warning.status, HealthStatus::Warning);
        assert_eq!(critical.status, HealthStatus::Critical);
    }

    #[test]
    fn poor_hit_rate_warns_once_enough_lookups() {
        let metrics = CacheMetrics::default();
        for _ in 0..5 {
            metrics.record_miss();
        }
        assert_eq!(
            HealthReport::classify(&metrics, 0, 100, 0, THRESHOLDS).status,
            HealthStatus::Healthy
        );

        for _ in 0..20 {
            metrics.record_miss();
        }
        metrics.record_hit();
        let report = HealthReport::classify(&metrics, 0, 100, 0, THRESHOLDS);
        assert_eq!(report.status, HealthStatus::Warning);
        assert!(report.hit_rate.unwrap() < 0.1);
    }
}
