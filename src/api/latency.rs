//! In-memory histogram of scrape run durations.
//! Recorded by the scheduler after every run, read by /status.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

/// Shared run duration stats. Scheduler records, API reads.
/// Values stored in milliseconds.
pub struct RunLatency {
    inner: Mutex<hdrhistogram::Histogram<u64>>,
}

/// Percentiles in milliseconds; None until the first run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
}

impl RunLatency {
    /// Tracks 1ms to 1h, 3 significant figures.
    pub fn new() -> Self {
        let histogram = hdrhistogram::Histogram::new_with_bounds(1, 3_600_000, 3)
            .expect("valid histogram bounds");
        Self {
            inner: Mutex::new(histogram),
        }
    }

    pub fn record_ms(&self, ms: u64) {
        if let Ok(mut h) = self.inner.lock() {
            // Out-of-range values are clamped rather than dropped.
            h.saturating_record(ms.max(1));
        }
    }

    pub fn record(&self, d: Duration) {
        let ms = d.as_millis().min(u128::from(u64::MAX)) as u64;
        self.record_ms(ms);
    }

    pub fn summary(&self) -> LatencySummary {
        let Ok(h) = self.inner.lock() else {
            return LatencySummary::default();
        };
        if h.len() == 0 {
            return LatencySummary::default();
        }
        LatencySummary {
            samples: h.len(),
            p50_ms: Some(h.value_at_quantile(0.5)),
            p95_ms: Some(h.value_at_quantile(0.95)),
            p99_ms: Some(h.value_at_quantile(0.99)),
        }
    }
}

impl Default for RunLatency {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_histogram_has_no_percentiles() {
        let summary = RunLatency::new().summary();
        assert_eq!(summary.samples, 0);
        assert!(summary.p50_ms.is_none());
    }

    #[test]
    fn records_run_durations() {
        let latency = RunLatency::new();
        for secs in [10, 20, 30, 40] {
            latency.record(Duration::from_secs(secs));
        }
        let summary = latency.summary();
        assert_eq!(summary.samples, 4);
        let p50 = summary.p50_ms.unwrap();
        assert!((19_900..=20_100).contains(&p50), "p50={p50}");
        assert!(summary.p99_ms.unwrap() >= 39_900);
    }

    #[test]
    fn zero_and_huge_durations_are_kept() {
        let latency = RunLatency::new();
        latency.record(Duration::ZERO);
        latency.record(Duration::from_secs(10 * 3600));
        assert_eq!(latency.summary().samples, 2);
    }
}
