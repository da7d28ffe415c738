use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use phloem_core::config::{parse_targets, RunConfig};
use phloem_core::stats::{ReferenceInterArrival, REFERENCE_IA_SIZE};
use phloem_core::threading::{self, CpuPinning};
use phloem_core::worker::{run_worker, WorkerParams};
use phloem_core::{AgentMode, RandomProcess, RateController};

mod report;

/// Phloem: open-loop load generator with latency attribution
///
/// Phloem drives one or more servers at a configured offered load, with
/// inter-arrival times drawn from a pluggable random process, and reports
/// throughput, latency percentiles with confidence intervals, and the
/// methodological checks (inter-arrival fidelity, convergence, sample
/// independence) that say whether the numbers can be trusted.
///
/// Example usage:
///   phloem -s 10.0.0.1:8000 -a symmetric -l 200000 -i exp:100 -p echo:64
///   phloem -s 10.0.0.1:11211 -t 8 -c 64 -a latency -p ascii-mem
///   phloem -s 10.0.0.1:8000 -a symmetric-nic --interface eth2 -l 500000
#[derive(Parser)]
#[command(name = "phloem")]
#[command(version, about = "Open-loop load generator with latency attribution", long_about = None)]
struct Cli {
    /// Comma-separated target endpoints (host:port)
    #[arg(short = 's', long)]
    targets: String,

    /// Agent mode: throughput, latency, symmetric, symmetric-nic
    #[arg(short = 'a', long, default_value = "throughput")]
    mode: AgentMode,

    /// Worker threads
    #[arg(short = 't', long, default_value_t = 1)]
    threads: usize,

    /// Total connection count, split evenly across threads
    #[arg(short = 'c', long, default_value_t = 1)]
    connections: usize,

    /// Aggregate offered load in requests per second (0 pauses the agent)
    #[arg(short = 'l', long, default_value_t = 10_000)]
    load: u64,

    /// Inter-arrival process descriptor, in microseconds
    #[arg(short = 'i', long, default_value = "exp:100")]
    interarrival: String,

    /// Wire protocol descriptor
    #[arg(short = 'p', long, default_value = "echo:8")]
    protocol: String,

    /// Measurement window in seconds
    #[arg(short = 'd', long, default_value_t = 10)]
    duration: u64,

    /// Warm-up before measurement starts, in seconds
    #[arg(short = 'w', long, default_value_t = 2)]
    warmup: u64,

    /// Latency sample reservoir capacity per worker
    #[arg(long, default_value_t = 16_384)]
    samples: usize,

    /// Bernoulli gate on latency sampling, in [0, 1]
    #[arg(long, default_value_t = 1.0)]
    sampling_rate: f64,

    /// NIC to bind and hardware-timestamp on (symmetric-nic mode)
    #[arg(long)]
    interface: Option<String>,

    /// Pin worker i to core i
    #[arg(long)]
    pin: bool,

    /// Pin worker i to core i + OFFSET (implies --pin)
    #[arg(long, value_name = "OFFSET")]
    pin_offset: Option<usize>,

    /// Seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Emit the report as JSON instead of text
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let pinning = match (cli.pin, cli.pin_offset) {
        (_, Some(offset)) => CpuPinning::Offset(offset),
        (true, None) => CpuPinning::Auto,
        (false, None) => CpuPinning::None,
    };

    let config = RunConfig {
        mode: cli.mode,
        workers: cli.threads,
        connections: cli.connections,
        targets: parse_targets(&cli.targets)?,
        interarrival: cli.interarrival,
        protocol: cli.protocol,
        load_rps: cli.load,
        sampling_rate: cli.sampling_rate,
        samples_per_worker: cli.samples,
        warmup_secs: cli.warmup,
        duration_secs: cli.duration,
        interface: cli.interface,
        pinning,
        seed: cli.seed,
    };
    config.validate()?;
    probe_descriptors(&config)?;

    if let CpuPinning::Offset(offset) = config.pinning {
        let cores = threading::core_count();
        if offset + config.workers > cores {
            tracing::warn!(
                "pinning may fail: need cores up to {} but only {} available",
                offset + config.workers,
                cores
            );
        }
    }

    tracing::info!("=== Run Configuration ===");
    tracing::info!("Mode: {}", config.mode);
    tracing::info!("Targets: {:?}", config.targets);
    tracing::info!(
        "Workers: {} ({} connections each)",
        config.workers,
        config.connections_per_worker()
    );
    tracing::info!("Load: {} rps, inter-arrival {}", config.load_rps, config.interarrival);
    tracing::info!("Protocol: {}", config.protocol);
    tracing::info!("Warm-up: {} s, measure: {} s", config.warmup_secs, config.duration_secs);
    if let Some(seed) = config.seed {
        tracing::info!("Seed: {} (reproducible mode)", seed);
    }
    tracing::info!("=========================");

    if let (AgentMode::SymmetricNic, Some(iface)) = (config.mode, config.interface.as_deref()) {
        enable_nic(iface)?;
    }

    // The fidelity check compares the observed aggregate transmit stream
    // against gaps drawn from an independent copy of the configured process.
    let mut ref_process =
        RandomProcess::parse(&config.interarrival, config.seed.map(|s| s.wrapping_add(0xA5)))?;
    if config.load_rps > 0 {
        ref_process
            .set_avg(1e6 / config.load_rps as f64)
            .map_err(|e| anyhow::anyhow!("inter-arrival process cannot express the load: {}", e))?;
    }
    let reference = ReferenceInterArrival::draw(&mut ref_process, REFERENCE_IA_SIZE);

    let rate = Arc::new(RateController::new());
    rate.set_load(config.load_rps);

    // Timer thread drives the warm-up, measurement, stop sequence while the
    // workers spin.
    {
        let rate = Arc::clone(&rate);
        let warmup = config.warmup_secs;
        let duration = config.duration_secs;
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(warmup));
            rate.start_measuring();
            tracing::info!("warm-up over, measuring for {} s", duration);
            std::thread::sleep(Duration::from_secs(duration));
            rate.stop();
        });
    }

    let worker_config = config.clone();
    let worker_rate = Arc::clone(&rate);
    let collectors = threading::run_workers(config.workers, config.pinning, move |id, barrier| {
        let seed = worker_config.seed.map(|s| s.wrapping_add(id as u64));
        let interarrival = RandomProcess::parse(&worker_config.interarrival, seed)?;
        let protocol = phloem_protocols::from_descriptor(&worker_config.protocol, seed)?;
        let params = WorkerParams {
            worker_id: id,
            mode: worker_config.mode,
            targets: worker_config.targets.clone(),
            connections: worker_config.connections_per_worker(),
            workers_total: worker_config.workers,
            interarrival,
            protocol,
            rate: Arc::clone(&worker_rate),
            sampling_rate: worker_config.sampling_rate,
            samples_capacity: worker_config.samples_per_worker,
            interface: worker_config.interface.clone(),
            seed,
            request_limit: None,
        };
        run_worker(params, barrier)
    })?;

    let report = report::build(&config, collectors, &reference)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report::print_text(&report);
    }

    if let (AgentMode::SymmetricNic, Some(iface)) = (config.mode, config.interface.as_deref()) {
        disable_nic(iface);
    }

    Ok(())
}

/// Fail fast on descriptor problems the workers would otherwise hit after
/// connecting: a protocol that does not parse, or an inter-arrival process
/// that cannot be re-targeted to the per-worker average the load implies.
fn probe_descriptors(config: &RunConfig) -> anyhow::Result<()> {
    phloem_protocols::from_descriptor(&config.protocol, config.seed)?;

    if config.load_rps > 0 {
        let mut process = RandomProcess::parse(&config.interarrival, None)?;
        let per_worker_avg_us = 1e6 * config.workers as f64 / config.load_rps as f64;
        process.set_avg(per_worker_avg_us).map_err(|e| {
            anyhow::anyhow!(
                "inter-arrival process '{}' cannot run at {} rps over {} workers: {}",
                config.interarrival,
                config.load_rps,
                config.workers,
                e
            )
        })?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn enable_nic(interface: &str) -> anyhow::Result<()> {
    phloem_transport::hw_timestamp::enable_nic_timestamping(interface)
        .map_err(|e| anyhow::anyhow!("cannot enable timestamping on '{}': {}", interface, e))?;
    tracing::info!("hardware timestamping enabled on {}", interface);
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn enable_nic(_interface: &str) -> anyhow::Result<()> {
    anyhow::bail!("symmetric-nic mode needs Linux SO_TIMESTAMPING support")
}

#[cfg(target_os = "linux")]
fn disable_nic(interface: &str) {
    if let Err(e) = phloem_transport::hw_timestamp::disable_nic_timestamping(interface) {
        tracing::warn!("could not restore timestamping on '{}': {}", interface, e);
    }
}

#[cfg(not(target_os = "linux"))]
fn disable_nic(_interface: &str) {}
