//! Measurement storage and post-run analysis.
//!
//! Workers fill a `WorkerStats` each; after the run the collectors are
//! merged and fed to the percentile analysis and the methodological checks
//! (inter-arrival fidelity, convergence, sample independence).

pub mod analysis;
pub mod collector;
pub mod validation;

pub use analysis::{aggregate, latency_summary, AggregateStats, LatencySummary, PercentileRow};
pub use collector::{Counters, LatencySample, WorkerStats};
pub use validation::{
    check_iid, check_interarrival_fidelity, compute_convergence, ks_critical, ks_statistic,
    ConvergenceOutcome, FidelityOutcome, ReferenceInterArrival, REFERENCE_IA_SIZE,
};
