//! Methodological checks on a finished run.
//!
//! Three questions: did the generator actually offer the configured
//! inter-arrival process (fidelity), did the latency distribution settle
//! (convergence), and are the samples independent (lag-1 correlation)?
//! The first two use the two-sample Kolmogorov-Smirnov statistic with the
//! a = 0.001 critical constant.

use serde::Serialize;

use crate::stats::collector::LatencySample;
use crate::workload::RandomProcess;
use crate::{Error, Result};

/// KS critical constant c(a) for a = 0.001
const KS_CA: f64 = 1.858;

/// Entries drawn for the reference inter-arrival array
pub const REFERENCE_IA_SIZE: usize = 8192;

/// Two-sample Kolmogorov-Smirnov statistic: the largest gap between the
/// empirical CDFs. Both inputs must be sorted ascending.
pub fn ks_statistic(a: &[u64], b: &[u64]) -> f64 {
    let (na, nb) = (a.len() as f64, b.len() as f64);
    let mut ia = 0usize;
    let mut ib = 0usize;
    let mut max_gap = 0.0f64;

    while ia < a.len() && ib < b.len() {
        let (va, vb) = (a[ia], b[ib]);
        if va <= vb {
            ia += 1;
        }
        if vb <= va {
            ib += 1;
        }
        let gap = (ia as f64 / na - ib as f64 / nb).abs();
        if gap > max_gap {
            max_gap = gap;
        }
    }
    max_gap
}

/// Critical value for rejecting "same distribution" at a = 0.001.
pub fn ks_critical(n1: usize, n2: usize) -> f64 {
    KS_CA * ((n1 + n2) as f64 / (n1 as f64 * n2 as f64)).sqrt()
}

/// Reference inter-arrival gaps drawn from the configured process.
///
/// Redrawn on every load change so the reference tracks the re-targeted
/// average. Entries are nanoseconds, quantized to whole microseconds the
/// same way the scheduler quantizes its gaps.
#[derive(Debug, Clone)]
pub struct ReferenceInterArrival {
    gaps: Vec<u64>,
}

impl ReferenceInterArrival {
    pub fn draw(process: &mut RandomProcess, size: usize) -> Self {
        let mut gaps: Vec<u64> = (0..size)
            .map(|_| (process.sample().round().max(0.0) as u64) * 1000)
            .collect();
        gaps.sort_unstable();
        Self { gaps }
    }

    pub fn gaps(&self) -> &[u64] {
        &self.gaps
    }
}

/// Outcome of the inter-arrival fidelity check.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FidelityOutcome {
    pub statistic: f64,
    pub critical: f64,
    pub passed: bool,
}

/// Compare the gaps between observed transmit timestamps against the
/// reference process. The timestamps come from all workers merged and are
/// sorted here, so the gaps reflect the aggregate offered stream.
pub fn check_interarrival_fidelity(
    tx_timestamps: &mut Vec<u64>,
    reference: &ReferenceInterArrival,
) -> Result<FidelityOutcome> {
    if tx_timestamps.len() < 2 {
        return Err(Error::Stats("not enough transmit timestamps".to_string()));
    }
    tx_timestamps.sort_unstable();

    let mut gaps: Vec<u64> =
        tx_timestamps.windows(2).map(|w| w[1] - w[0]).collect();
    gaps.sort_unstable();

    let statistic = ks_statistic(&gaps, reference.gaps());
    let critical = ks_critical(gaps.len(), reference.gaps().len());
    Ok(FidelityOutcome { statistic, critical, passed: statistic < critical })
}

/// Outcome of the convergence check.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConvergenceOutcome {
    pub statistic: f64,
    pub critical: f64,
    pub converged: bool,
}

/// Split the samples at the temporal midpoint (by transmit time) and test
/// whether both halves look like the same latency distribution.
pub fn compute_convergence(samples: &mut [LatencySample]) -> Result<ConvergenceOutcome> {
    if samples.len() < 4 {
        return Err(Error::Stats("not enough samples for a convergence check".to_string()));
    }
    samples.sort_by_key(|s| s.tx_nanos);

    let half = samples.len() / 2;
    let mut first: Vec<u64> = samples[..half].iter().map(|s| s.nanos).collect();
    let mut second: Vec<u64> = samples[half..2 * half].iter().map(|s| s.nanos).collect();
    first.sort_unstable();
    second.sort_unstable();

    let statistic = ks_statistic(&first, &second);
    let n = half as f64;
    let critical = KS_CA * (2.0 * n / (n * n)).sqrt();
    Ok(ConvergenceOutcome { statistic, critical, converged: statistic < critical })
}

/// Lag-1 Pearson correlation of latencies ordered by transmit time. Values
/// near zero mean successive samples are uncorrelated.
pub fn check_iid(samples: &mut [LatencySample]) -> Result<f64> {
    if samples.len() < 3 {
        return Err(Error::Stats("not enough samples for an independence check".to_string()));
    }
    samples.sort_by_key(|s| s.tx_nanos);

    let n = samples.len() - 1;
    let xs: Vec<f64> = samples[..n].iter().map(|s| s.nanos as f64).collect();
    let ys: Vec<f64> = samples[1..].iter().map(|s| s.nanos as f64).collect();

    let avg_x = xs.iter().sum::<f64>() / n as f64;
    let avg_y = ys.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for i in 0..n {
        let dx = xs[i] - avg_x;
        let dy = ys[i] - avg_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    let denom = (var_x * var_y).sqrt();
    if denom == 0.0 {
        // Constant latencies: nothing to correlate
        return Ok(0.0);
    }
    Ok(cov / denom)
}
