//! Percentile analysis over the merged sample set.
//!
//! Percentiles use the exact order-statistic index `size * p / 100`, and
//! their confidence intervals come from the binomial order-statistic bounds
//! with z = 1.96.

use serde::Serialize;

use crate::stats::collector::{Counters, LatencySample, WorkerStats};
use crate::{Error, Result};

const Z: f64 = 1.96;

const REPORTED_PERCENTILES: [f64; 4] = [50.0, 90.0, 95.0, 99.0];

/// Everything the workers measured, merged.
#[derive(Debug, Default)]
pub struct AggregateStats {
    pub tx: Counters,
    pub rx: Counters,
    pub samples: Vec<LatencySample>,
    pub tx_timestamps: Vec<u64>,
}

/// Merge per-worker collectors. Runs after the workers have been joined, so
/// every read here happens-after the last write.
pub fn aggregate(workers: Vec<WorkerStats>) -> AggregateStats {
    let mut agg = AggregateStats::default();
    for worker in workers {
        let (tx, rx, samples, tx_timestamps) = worker.into_parts();
        agg.tx.add(tx.reqs, tx.bytes);
        agg.rx.add(rx.reqs, rx.bytes);
        agg.samples.extend(samples);
        agg.tx_timestamps.extend(tx_timestamps);
    }
    agg
}

/// One reported percentile with its confidence bounds.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PercentileRow {
    pub percentile: f64,
    pub value_ns: u64,
    pub lower_ns: u64,
    pub upper_ns: u64,
}

/// The latency section of the end-of-run report.
#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub avg_ns: u64,
    pub percentiles: Vec<PercentileRow>,
}

/// Index of the p-th percentile in a sorted sample array.
pub fn percentile_index(size: usize, percentile: usize) -> usize {
    size * percentile / 100
}

/// Order-statistic confidence bounds for the p-th quantile over `size`
/// sorted samples: `(i, k)` with `0 <= i < k <= size`.
pub fn ci_bounds(size: usize, percentile: f64) -> (usize, usize) {
    let n = size as f64;
    let p = percentile / 100.0;
    let spread = Z * (n * p * (1.0 - p)).sqrt();

    let i = (n * p - spread).floor().max(0.0) as usize;
    let k = ((n * p + spread).ceil() as usize + 1).min(size);
    let i = i.min(k.saturating_sub(1));
    (i, k)
}

/// Summarize a latency sample set. Sorts `samples` by latency in place.
pub fn latency_summary(samples: &mut [LatencySample]) -> Result<LatencySummary> {
    if samples.is_empty() {
        return Err(Error::Stats("no latency samples recorded".to_string()));
    }
    samples.sort_by_key(|s| s.nanos);

    let size = samples.len();
    let sum: u128 = samples.iter().map(|s| s.nanos as u128).sum();
    let avg_ns = (sum / size as u128) as u64;

    let percentiles = REPORTED_PERCENTILES
        .iter()
        .map(|&p| {
            let idx = percentile_index(size, p as usize).min(size - 1);
            let (i, k) = ci_bounds(size, p);
            PercentileRow {
                percentile: p,
                value_ns: samples[idx].nanos,
                lower_ns: samples[i].nanos,
                upper_ns: samples[k.min(size - 1)].nanos,
            }
        })
        .collect();

    Ok(LatencySummary { samples: size, avg_ns, percentiles })
}
