//! Per-thread operation counters and latency capture.
//!
//! Each worker owns its `Metrics` exclusively until it has ended; the
//! master only ever reads collected copies, so recording is lock-free by
//! construction. Aggregation is a commutative merge: the run total is
//! the sum of the per-thread parts in any order.

use serde::{Deserialize, Serialize};

/// Number of power-of-two latency buckets. Bucket `k` holds latencies in
/// `[2^(k-1), 2^k)` ms, bucket 0 holds sub-millisecond responses, and the
/// last bucket absorbs everything from about 4.7 hours up.
pub const HISTOGRAM_BUCKETS: usize = 26;

/// Bucket index for a latency in ms.
#[must_use]
pub fn bucket_index(latency_ms: u64) -> usize {
    if latency_ms == 0 {
        0
    } else {
        let bits = 64 - latency_ms.leading_zeros() as usize;
        bits.min(HISTOGRAM_BUCKETS - 1)
    }
}

/// Counters for one operation of the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpStats {
    pub success_count: u64,
    pub failure_count: u64,
    /// Sum of successful latencies in ms.
    pub latency_sum_ms: u64,
    /// Sum of squared successful latencies, for variance.
    pub latency_sq_sum: f64,
    pub min_ms: Option<u64>,
    pub max_ms: Option<u64>,
    pub histogram: Vec<u64>,
}

impl OpStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            success_count: 0,
            failure_count: 0,
            latency_sum_ms: 0,
            latency_sq_sum: 0.0,
            min_ms: None,
            max_ms: None,
            histogram: vec![0; HISTOGRAM_BUCKETS],
        }
    }

    fn record_success(&mut self, latency_ms: u64) {
        self.success_count += 1;
        self.latency_sum_ms += latency_ms;
        self.latency_sq_sum += (latency_ms as f64) * (latency_ms as f64);
        self.min_ms = Some(self.min_ms.map_or(latency_ms, |m| m.min(latency_ms)));
        self.max_ms = Some(self.max_ms.map_or(latency_ms, |m| m.max(latency_ms)));
        self.histogram[bucket_index(latency_ms)] += 1;
    }

    fn record_failure(&mut self) {
        self.failure_count += 1;
    }

    fn merge(&mut self, other: &OpStats) {
        self.success_count += other.success_count;
        self.failure_count += other.failure_count;
        self.latency_sum_ms += other.latency_sum_ms;
        self.latency_sq_sum += other.latency_sq_sum;
        self.min_ms = match (self.min_ms, other.min_ms) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_ms = match (self.max_ms, other.max_ms) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        for (mine, theirs) in self.histogram.iter_mut().zip(&other.histogram) {
            *mine += theirs;
        }
    }

    /// Mean successful latency in ms.
    #[must_use]
    pub fn mean_ms(&self) -> Option<f64> {
        if self.success_count == 0 {
            None
        } else {
            Some(self.latency_sum_ms as f64 / self.success_count as f64)
        }
    }
}

impl Default for OpStats {
    fn default() -> Self {
        Self::new()
    }
}

/// One worker's counters, indexed by operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub driver: String,
    pub thread_id: usize,
    pub op_names: Vec<String>,
    pub ops: Vec<OpStats>,
}

impl Metrics {
    #[must_use]
    pub fn new(driver: impl Into<String>, thread_id: usize, op_names: Vec<String>) -> Self {
        let ops = op_names.iter().map(|_| OpStats::new()).collect();
        Self {
            driver: driver.into(),
            thread_id,
            op_names,
            ops,
        }
    }

    /// Record a successful, steady-state operation.
    pub fn record_success(&mut self, op: usize, latency_ms: u64) {
        self.ops[op].record_success(latency_ms);
    }

    /// Record a failed, steady-state operation.
    pub fn record_failure(&mut self, op: usize) {
        self.ops[op].record_failure();
    }

    /// Total steady-state operations, success and failure.
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.ops
            .iter()
            .map(|o| o.success_count + o.failure_count)
            .sum()
    }
}

/// The aggregated result of a run across every agent and worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub driver: String,
    pub op_names: Vec<String>,
    pub ops: Vec<OpStats>,
    pub thread_count: usize,
    /// Whether the run was aborted before completing.
    pub aborted: bool,
}

impl RunMetrics {
    /// Fold per-thread metrics into a run total.
    #[must_use]
    pub fn aggregate<'a, I>(parts: I, aborted: bool) -> Self
    where
        I: IntoIterator<Item = &'a Metrics>,
    {
        let mut driver = String::new();
        let mut op_names = Vec::new();
        let mut ops: Vec<OpStats> = Vec::new();
        let mut thread_count = 0;
        for part in parts {
            if ops.is_empty() {
                driver.clone_from(&part.driver);
                op_names.clone_from(&part.op_names);
                ops = part.op_names.iter().map(|_| OpStats::new()).collect();
            }
            for (total, theirs) in ops.iter_mut().zip(&part.ops) {
                total.merge(theirs);
            }
            thread_count += 1;
        }
        Self {
            driver,
            op_names,
            ops,
            thread_count,
            aborted,
        }
    }

    /// Total steady-state operations across the run.
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.ops
            .iter()
            .map(|o| o.success_count + o.failure_count)
            .sum()
    }
}
