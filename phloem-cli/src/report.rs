//! End-of-run report assembly and printing.

use serde::Serialize;

use phloem_core::config::RunConfig;
use phloem_core::stats::{
    aggregate, check_iid, check_interarrival_fidelity, compute_convergence, latency_summary,
    ConvergenceOutcome, Counters, FidelityOutcome, LatencySummary, ReferenceInterArrival,
    WorkerStats,
};

#[derive(Debug, Serialize)]
pub struct Report {
    pub config: RunConfig,
    pub tx: Counters,
    pub rx: Counters,
    pub tx_rps: f64,
    pub rx_rps: f64,
    pub latency: Option<LatencySummary>,
    pub fidelity: Option<FidelityOutcome>,
    pub convergence: Option<ConvergenceOutcome>,
    pub lag1_correlation: Option<f64>,
}

/// Merge the per-worker collectors and run the post-run checks that apply
/// to the configured mode.
pub fn build(
    config: &RunConfig,
    collectors: Vec<WorkerStats>,
    reference: &ReferenceInterArrival,
) -> anyhow::Result<Report> {
    let mut agg = aggregate(collectors);

    let secs = config.duration_secs as f64;
    let tx_rps = agg.tx.reqs as f64 / secs;
    let rx_rps = agg.rx.reqs as f64 / secs;

    let latency = if config.mode.measures_latency() && !agg.samples.is_empty() {
        Some(latency_summary(&mut agg.samples)?)
    } else {
        None
    };

    let fidelity = if config.mode.logs_tx_timestamps() && agg.tx_timestamps.len() >= 2 {
        Some(check_interarrival_fidelity(&mut agg.tx_timestamps, reference)?)
    } else {
        None
    };

    let convergence = if latency.is_some() && agg.samples.len() >= 4 {
        Some(compute_convergence(&mut agg.samples)?)
    } else {
        None
    };

    let lag1_correlation = if latency.is_some() && agg.samples.len() >= 3 {
        Some(check_iid(&mut agg.samples)?)
    } else {
        None
    };

    Ok(Report {
        config: config.clone(),
        tx: agg.tx,
        rx: agg.rx,
        tx_rps,
        rx_rps,
        latency,
        fidelity,
        convergence,
        lag1_correlation,
    })
}

pub fn print_text(report: &Report) {
    println!("mode:            {}", report.config.mode);
    println!("offered load:    {} rps", report.config.load_rps);
    println!("measured window: {} s", report.config.duration_secs);
    println!(
        "tx:              {} reqs, {} bytes ({:.0} rps)",
        report.tx.reqs, report.tx.bytes, report.tx_rps
    );
    println!(
        "rx:              {} reqs, {} bytes ({:.0} rps)",
        report.rx.reqs, report.rx.bytes, report.rx_rps
    );

    if let Some(latency) = &report.latency {
        println!("latency ({} samples):", latency.samples);
        println!("  avg: {} ns", latency.avg_ns);
        for row in &latency.percentiles {
            println!(
                "  p{:<4} {} ns  [{} .. {}]",
                row.percentile, row.value_ns, row.lower_ns, row.upper_ns
            );
        }
    }

    if let Some(fidelity) = &report.fidelity {
        println!(
            "inter-arrival fidelity: {} (ks {:.4}, critical {:.4})",
            if fidelity.passed { "pass" } else { "FAIL" },
            fidelity.statistic,
            fidelity.critical
        );
    }
    if let Some(convergence) = &report.convergence {
        println!(
            "convergence:            {} (ks {:.4}, critical {:.4})",
            if convergence.converged { "pass" } else { "FAIL" },
            convergence.statistic,
            convergence.critical
        );
    }
    if let Some(r) = report.lag1_correlation {
        println!("lag-1 correlation:      {:.4}", r);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phloem_core::config::{parse_targets, AgentMode};
    use phloem_core::threading::CpuPinning;
    use phloem_core::RandomProcess;

    fn config(mode: AgentMode) -> RunConfig {
        RunConfig {
            mode,
            workers: 1,
            connections: 1,
            targets: parse_targets("127.0.0.1:9000").unwrap(),
            interarrival: "exp:100".to_string(),
            protocol: "echo:8".to_string(),
            load_rps: 10_000,
            sampling_rate: 1.0,
            samples_per_worker: 4096,
            warmup_secs: 0,
            duration_secs: 10,
            interface: None,
            pinning: CpuPinning::None,
            seed: Some(1),
        }
    }

    fn reference() -> ReferenceInterArrival {
        let mut process = RandomProcess::parse("exp:100", Some(2)).unwrap();
        ReferenceInterArrival::draw(&mut process, 1024)
    }

    #[test]
    fn throughput_report_has_no_latency_section() {
        let mut stats = WorkerStats::new(16, 1.0, Some(1));
        stats.record_tx(100, 800);
        stats.record_rx(100, 800);

        let report = build(&config(AgentMode::Throughput), vec![stats], &reference()).unwrap();
        assert_eq!(report.tx.reqs, 100);
        assert_eq!(report.tx_rps, 10.0);
        assert!(report.latency.is_none());
        assert!(report.fidelity.is_none());
    }

    #[test]
    fn symmetric_report_runs_all_checks() {
        let mut stats = WorkerStats::new(8192, 1.0, Some(3));
        let mut ia = RandomProcess::parse("exp:100", Some(4)).unwrap();
        let mut svc = RandomProcess::parse("exp:1000", Some(5)).unwrap();

        let mut now = 0u64;
        for _ in 0..4000 {
            now += (ia.sample().round().max(0.0) as u64) * 1000;
            stats.record_tx(1, 8);
            stats.record_rx(1, 8);
            stats.record_tx_timestamp(now);
            stats.record_latency(svc.sample() as u64, now);
        }

        let report = build(&config(AgentMode::Symmetric), vec![stats], &reference()).unwrap();
        let latency = report.latency.as_ref().expect("latency section");
        assert_eq!(latency.samples, 4000);

        let fidelity = report.fidelity.as_ref().expect("fidelity section");
        assert!(fidelity.passed, "ks {} crit {}", fidelity.statistic, fidelity.critical);

        assert!(report.convergence.expect("convergence section").converged);
        assert!(report.lag1_correlation.expect("iid section").abs() < 0.1);

        // Render paths stay in sync with the report shape
        print_text(&report);
        serde_json::to_string(&report).unwrap();
    }
}
