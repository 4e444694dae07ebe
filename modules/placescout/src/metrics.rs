use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::info;

/// API usage counters for one crawl.
///
/// Shared by handle between the provider adapter and the controller; thread-safe
/// via atomics so concurrent dive workers can record without locking.
#[derive(Debug, Default)]
pub struct CrawlMetrics {
    tile_queries: AtomicU64,
    http_requests: AtomicU64,
    quota_retries: AtomicU64,
    failed_queries: AtomicU64,
    results_returned: AtomicU64,
    unique_results: AtomicU64,
}

impl CrawlMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tile_query(&self) {
        self.tile_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_http_requests(&self, n: u64) {
        self.http_requests.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_quota_retries(&self, n: u64) {
        self.quota_retries.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_failed_query(&self) {
        self.failed_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_results(&self, returned: u64, unique: u64) {
        self.results_returned.fetch_add(returned, Ordering::Relaxed);
        self.unique_results.fetch_add(unique, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tile_queries: self.tile_queries.load(Ordering::Relaxed),
            http_requests: self.http_requests.load(Ordering::Relaxed),
            quota_retries: self.quota_retries.load(Ordering::Relaxed),
            failed_queries: self.failed_queries.load(Ordering::Relaxed),
            results_returned: self.results_returned.load(Ordering::Relaxed),
            unique_results: self.unique_results.load(Ordering::Relaxed),
        }
    }

    /// Emit the periodic "API Metrics Summary" line.
    pub fn log_summary(&self, session_id: &str, phase: &str) {
        let snap = self.snapshot();
        info!(
            session_id,
            phase,
            tile_queries = snap.tile_queries,
            total_requests = snap.http_requests,
            results_returned = snap.results_returned,
            unique_results = snap.unique_results,
            efficiency_ratio = snap.efficiency_ratio(),
            "API metrics summary"
        );
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub tile_queries: u64,
    pub http_requests: u64,
    pub quota_retries: u64,
    pub failed_queries: u64,
    pub results_returned: u64,
    pub unique_results: u64,
}

impl MetricsSnapshot {
    /// Unique results per returned result, rounded to two places.
    pub fn efficiency_ratio(&self) -> f64 {
        let ratio = self.unique_results as f64 / self.results_returned.max(1) as f64;
        (ratio * 100.0).round() / 100.0
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Tile queries:       {}", self.tile_queries)?;
        writeln!(f, "HTTP requests:      {}", self.http_requests)?;
        writeln!(f, "Quota retries:      {}", self.quota_retries)?;
        writeln!(f, "Failed queries:     {}", self.failed_queries)?;
        writeln!(f, "Results returned:   {}", self.results_returned)?;
        writeln!(f, "Unique results:     {}", self.unique_results)?;
        write!(f, "Efficiency ratio:   {:.2}", self.efficiency_ratio())
    }
}
