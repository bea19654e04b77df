//! Per-volume I/O statistics
//!
//! Counters are updated on completion of every I/O context. Latencies are
//! measured from submission, so time spent deferred by admission or waiting
//! for a range lock is included.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bucket upper bounds in microseconds
const BUCKET_BOUNDARIES_US: [u64; 16] = [
    10,       // 0: 0-10us
    20,       // 1: 10-20us
    50,       // 2: 20-50us
    100,      // 3: 50-100us
    200,      // 4: 100-200us
    500,      // 5: 200-500us
    1_000,    // 6: 500us-1ms
    2_000,    // 7: 1-2ms
    5_000,    // 8: 2-5ms
    10_000,   // 9: 5-10ms
    20_000,   // 10: 10-20ms
    50_000,   // 11: 20-50ms
    100_000,  // 12: 50-100ms
    200_000,  // 13: 100-200ms
    500_000,  // 14: 200-500ms
    u64::MAX, // 15: 500ms+
];

/// Fixed-bucket latency histogram
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; 16],
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl LatencyHistogram {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Record a sample in microseconds
    pub fn record(&self, latency_us: u64) {
        let bucket = BUCKET_BOUNDARIES_US
            .iter()
            .position(|&boundary| latency_us < boundary)
            .unwrap_or(BUCKET_BOUNDARIES_US.len() - 1);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(latency_us, Ordering::Relaxed);
        self.min.fetch_min(latency_us, Ordering::Relaxed);
        self.max.fetch_max(latency_us, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Upper bound of the bucket holding the given percentile (0.0..=1.0)
    pub fn percentile(&self, percentile: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let target = ((total as f64) * percentile).ceil().max(1.0) as u64;
        let mut cumulative = 0u64;
        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= target {
                return BUCKET_BOUNDARIES_US[i];
            }
        }
        BUCKET_BOUNDARIES_US[BUCKET_BOUNDARIES_US.len() - 1]
    }

    /// Summary of the distribution
    pub fn summary(&self) -> LatencySummary {
        let count = self.count();
        let min = self.min.load(Ordering::Relaxed);
        LatencySummary {
            avg: if count == 0 {
                0
            } else {
                self.sum.load(Ordering::Relaxed) / count
            },
            min: if min == u64::MAX { 0 } else { min },
            max: self.max.load(Ordering::Relaxed),
            p50: self.percentile(0.50),
            p99: self.percentile(0.99),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency summary in microseconds
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencySummary {
    pub avg: u64,
    pub min: u64,
    pub max: u64,
    pub p50: u64,
    pub p99: u64,
}

/// I/O counters of one volume
#[derive(Debug, Default)]
pub struct IoStats {
    read_ops: AtomicU64,
    write_ops: AtomicU64,
    free_ops: AtomicU64,
    flush_ops: AtomicU64,
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
    freed_bytes: AtomicU64,
    /// Contexts that waited in the deferred queue
    deferred_ops: AtomicU64,
    /// Completions that waited for a log commit
    log_commits: AtomicU64,
    errors: AtomicU64,
    read_latency: LatencyHistogram,
    write_latency: LatencyHistogram,
}

impl IoStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, bytes: u64, latency_us: u64) {
        self.read_ops.fetch_add(1, Ordering::Relaxed);
        self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.read_latency.record(latency_us);
    }

    pub fn record_write(&self, bytes: u64, latency_us: u64) {
        self.write_ops.fetch_add(1, Ordering::Relaxed);
        self.write_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.write_latency.record(latency_us);
    }

    pub fn record_free(&self, bytes: u64) {
        self.free_ops.fetch_add(1, Ordering::Relaxed);
        self.freed_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flush_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deferred(&self) {
        self.deferred_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_log_commit(&self) {
        self.log_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> IoStatsSnapshot {
        IoStatsSnapshot {
            read_ops: self.read_ops.load(Ordering::Relaxed),
            write_ops: self.write_ops.load(Ordering::Relaxed),
            free_ops: self.free_ops.load(Ordering::Relaxed),
            flush_ops: self.flush_ops.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            write_bytes: self.write_bytes.load(Ordering::Relaxed),
            freed_bytes: self.freed_bytes.load(Ordering::Relaxed),
            deferred_ops: self.deferred_ops.load(Ordering::Relaxed),
            log_commits: self.log_commits.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            read_latency_us: self.read_latency.summary(),
            write_latency_us: self.write_latency.summary(),
        }
    }
}

/// Serializable copy of [`IoStats`]
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IoStatsSnapshot {
    pub read_ops: u64,
    pub write_ops: u64,
    pub free_ops: u64,
    pub flush_ops: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub freed_bytes: u64,
    pub deferred_ops: u64,
    pub log_commits: u64,
    pub errors: u64,
    pub read_latency_us: LatencySummary,
    pub write_latency_us: LatencySummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_percentiles() {
        let histogram = LatencyHistogram::new();
        for _ in 0..99 {
            histogram.record(5);
        }
        histogram.record(300_000);

        assert_eq!(histogram.percentile(0.50), 10);
        assert_eq!(histogram.percentile(0.99), 10);
        assert_eq!(histogram.percentile(1.0), 500_000);

        let summary = histogram.summary();
        assert_eq!(summary.min, 5);
        assert_eq!(summary.max, 300_000);
    }

    #[test]
    fn test_empty_histogram() {
        let summary = LatencyHistogram::new().summary();
        assert_eq!(summary.min, 0);
        assert_eq!(summary.avg, 0);
        assert_eq!(summary.p99, 0);
    }

    #[test]
    fn test_snapshot_counts() {
        let stats = IoStats::new();
        stats.record_write(4096, 120);
        stats.record_write(512, 80);
        stats.record_read(4096, 30);
        stats.record_free(8192);
        stats.record_deferred();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.write_ops, 2);
        assert_eq!(snapshot.write_bytes, 4608);
        assert_eq!(snapshot.read_ops, 1);
        assert_eq!(snapshot.freed_bytes, 8192);
        assert_eq!(snapshot.deferred_ops, 1);
        assert_eq!(snapshot.write_latency_us.avg, 100);
    }
}
