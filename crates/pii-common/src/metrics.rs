//! Lock-free latency histogram for scan timing

use std::sync::atomic::{AtomicU64, Ordering};

/// Upper bucket bounds in microseconds (0.5ms .. 250ms); a final overflow
/// bucket catches everything above.
pub const LATENCY_BUCKETS_US: [u64; 9] = [
    500, 1_000, 2_000, 5_000, 10_000, 25_000, 50_000, 100_000, 250_000,
];

const BUCKET_COUNT: usize = LATENCY_BUCKETS_US.len() + 1;

/// Lock-free histogram for latency tracking
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; BUCKET_COUNT],
    /// Total count
    count: AtomicU64,
    /// Sum for average calculation
    sum_us: AtomicU64,
    /// Min latency
    min_us: AtomicU64,
    /// Max latency
    max_us: AtomicU64,
}

impl LatencyHistogram {
    /// Create new histogram
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            buckets: [ZERO; BUCKET_COUNT],
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            min_us: AtomicU64::new(u64::MAX),
            max_us: AtomicU64::new(0),
        }
    }

    /// Record a latency value in microseconds
    #[inline(always)]
    pub fn record(&self, latency_us: u64) {
        let bucket = LATENCY_BUCKETS_US
            .iter()
            .position(|&limit| latency_us <= limit)
            .unwrap_or(BUCKET_COUNT - 1);

        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.min_us.fetch_min(latency_us, Ordering::Relaxed);
        self.max_us.fetch_max(latency_us, Ordering::Relaxed);
    }

    /// Number of recorded samples
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Get average latency in microseconds
    pub fn average(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.sum_us.load(Ordering::Relaxed) as f64 / count as f64
    }

    /// Get percentile (approximate, bucket upper bound)
    pub fn percentile(&self, p: f64) -> u64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        let target = ((count as f64) * p).ceil() as u64;
        let mut cumulative = 0u64;

        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= target {
                return LATENCY_BUCKETS_US
                    .get(i)
                    .copied()
                    .unwrap_or_else(|| self.max_us.load(Ordering::Relaxed));
            }
        }

        self.max_us.load(Ordering::Relaxed)
    }

    /// Cumulative counts per finite bucket bound, Prometheus style
    pub fn cumulative_buckets(&self) -> Vec<(u64, u64)> {
        let mut cumulative = 0u64;
        LATENCY_BUCKETS_US
            .iter()
            .zip(self.buckets.iter())
            .map(|(&limit, bucket)| {
                cumulative += bucket.load(Ordering::Relaxed);
                (limit, cumulative)
            })
            .collect()
    }

    /// Get snapshot
    pub fn snapshot(&self) -> HistogramSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        HistogramSnapshot {
            count,
            sum_us: self.sum_us.load(Ordering::Relaxed),
            min_us: if count == 0 { 0 } else { self.min_us.load(Ordering::Relaxed) },
            max_us: self.max_us.load(Ordering::Relaxed),
            p50: self.percentile(0.50),
            p95: self.percentile(0.95),
            p99: self.percentile(0.99),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Histogram snapshot
#[derive(Debug, Clone, serde::Serialize)]
pub struct HistogramSnapshot {
    /// Samples recorded
    pub count: u64,
    /// Sum of all samples
    pub sum_us: u64,
    /// Smallest sample
    pub min_us: u64,
    /// Largest sample
    pub max_us: u64,
    /// Median (bucket bound)
    pub p50: u64,
    /// 95th percentile (bucket bound)
    pub p95: u64,
    /// 99th percentile (bucket bound)
    pub p99: u64,
}
