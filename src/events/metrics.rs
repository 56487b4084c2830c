//! Crawl counters and per-stage timing percentiles.
//!
//! Counters are lock-free atomics; stage timings go into HDR histograms
//! (1ms..1h, 3 significant digits) guarded by short mutexes.

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Pipeline stage a timing sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Render,
    Extract,
    Write,
}

/// Percentile summary for one stage.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTimings {
    pub count: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
}

/// Consistent point-in-time view of the crawl metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub pages: u64,
    pub edges: u64,
    pub assets: u64,
    pub errors: u64,
    pub bytes_written: u64,
    pub fetch: StageTimings,
    pub render: StageTimings,
    pub extract: StageTimings,
    pub write: StageTimings,
    pub rss_mb: u64,
    pub peak_rss_mb: u64,
}

#[derive(Debug)]
pub struct CrawlMetrics {
    pages: AtomicU64,
    edges: AtomicU64,
    assets: AtomicU64,
    errors: AtomicU64,
    bytes_written: AtomicU64,
    rss_mb: AtomicU64,
    peak_rss_mb: AtomicU64,
    fetch: Mutex<Histogram<u64>>,
    render: Mutex<Histogram<u64>>,
    extract: Mutex<Histogram<u64>>,
    write: Mutex<Histogram<u64>>,
}

fn stage_histogram() -> Histogram<u64> {
    // 1ms..1h range is enough for any single stage; saturate beyond.
    Histogram::new_with_bounds(1, 3_600_000, 3).expect("static histogram bounds")
}

impl Default for CrawlMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CrawlMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pages: AtomicU64::new(0),
            edges: AtomicU64::new(0),
            assets: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            rss_mb: AtomicU64::new(0),
            peak_rss_mb: AtomicU64::new(0),
            fetch: Mutex::new(stage_histogram()),
            render: Mutex::new(stage_histogram()),
            extract: Mutex::new(stage_histogram()),
            write: Mutex::new(stage_histogram()),
        }
    }

    pub fn add_page(&self) {
        self.pages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_edges(&self, n: u64) {
        self.edges.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_assets(&self, n: u64) {
        self.assets.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_error(&self) -> u64 {
        self.errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[must_use]
    pub fn total_errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_pages(&self) -> u64 {
        self.pages.load(Ordering::Relaxed)
    }

    pub fn add_bytes_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_stage(&self, stage: Stage, millis: u64) {
        let histogram = match stage {
            Stage::Fetch => &self.fetch,
            Stage::Render => &self.render,
            Stage::Extract => &self.extract,
            Stage::Write => &self.write,
        };
        // saturating_record clamps out-of-range samples instead of failing.
        histogram.lock().saturating_record(millis.max(1));
    }

    pub fn set_rss_mb(&self, rss_mb: u64) {
        self.rss_mb.store(rss_mb, Ordering::Relaxed);
        self.peak_rss_mb.fetch_max(rss_mb, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pages: self.pages.load(Ordering::Relaxed),
            edges: self.edges.load(Ordering::Relaxed),
            assets: self.assets.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            fetch: summarize(&self.fetch),
            render: summarize(&self.render),
            extract: summarize(&self.extract),
            write: summarize(&self.write),
            rss_mb: self.rss_mb.load(Ordering::Relaxed),
            peak_rss_mb: self.peak_rss_mb.load(Ordering::Relaxed),
        }
    }
}

fn summarize(histogram: &Mutex<Histogram<u64>>) -> StageTimings {
    let h = histogram.lock();
    if h.is_empty() {
        return StageTimings::default();
    }
    StageTimings {
        count: h.len(),
        p50_ms: h.value_at_quantile(0.50),
        p95_ms: h.value_at_quantile(0.95),
        p99_ms: h.value_at_quantile(0.99),
        max_ms: h.max(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_reflect_samples() {
        let metrics = CrawlMetrics::new();
        for ms in 1..=100 {
            metrics.record_stage(Stage::Fetch, ms);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.fetch.count, 100);
        assert!((45..=55).contains(&snap.fetch.p50_ms), "{}", snap.fetch.p50_ms);
        assert!(snap.fetch.p99_ms >= 95);
        assert_eq!(snap.render.count, 0);
    }

    #[test]
    fn peak_rss_is_monotonic() {
        let metrics = CrawlMetrics::new();
        metrics.set_rss_mb(100);
        metrics.set_rss_mb(50);
        let snap = metrics.snapshot();
        assert_eq!(snap.rss_mb, 50);
        assert_eq!(snap.peak_rss_mb, 100);
    }
}
