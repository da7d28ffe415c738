//! Validated run configuration shared by the CLI and the worker runtime.

use anyhow::bail;
use serde::Serialize;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::threading::CpuPinning;

/// Upper bound on distinct target endpoints.
pub const MAX_TARGETS: usize = 4096;

/// The four agent modes.
///
/// Throughput fires on an open-loop schedule and only counts; Latency runs a
/// closed loop on blocking sockets; the two Symmetric modes keep the open
/// loop and attribute per-request latency via FIFO order, with either
/// software or NIC timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentMode {
    Throughput,
    Latency,
    Symmetric,
    SymmetricNic,
}

impl AgentMode {
    /// Whether this mode produces latency samples.
    pub fn measures_latency(&self) -> bool {
        !matches!(self, AgentMode::Throughput)
    }

    /// Whether this mode logs software transmit timestamps for the
    /// inter-arrival fidelity check.
    pub fn logs_tx_timestamps(&self) -> bool {
        matches!(self, AgentMode::Symmetric | AgentMode::SymmetricNic)
    }
}

impl FromStr for AgentMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "throughput" => Ok(AgentMode::Throughput),
            "latency" => Ok(AgentMode::Latency),
            "symmetric" => Ok(AgentMode::Symmetric),
            "symmetric-nic" => Ok(AgentMode::SymmetricNic),
            other => bail!("unknown agent mode '{}'", other),
        }
    }
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentMode::Throughput => "throughput",
            AgentMode::Latency => "latency",
            AgentMode::Symmetric => "symmetric",
            AgentMode::SymmetricNic => "symmetric-nic",
        };
        f.write_str(s)
    }
}

/// Parse a comma-separated `host:port` target list.
pub fn parse_targets(spec: &str) -> anyhow::Result<Vec<SocketAddr>> {
    let mut targets = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let addr: SocketAddr = part
            .parse()
            .map_err(|e| anyhow::anyhow!("bad target '{}': {}", part, e))?;
        targets.push(addr);
    }
    if targets.is_empty() {
        bail!("no targets given");
    }
    if targets.len() > MAX_TARGETS {
        bail!("{} targets exceed the limit of {}", targets.len(), MAX_TARGETS);
    }
    Ok(targets)
}

/// A fully validated run description.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub mode: AgentMode,
    pub workers: usize,
    /// Total connection count, split evenly across workers
    pub connections: usize,
    pub targets: Vec<SocketAddr>,
    /// Inter-arrival process descriptor, in microseconds
    pub interarrival: String,
    /// Wire protocol descriptor
    pub protocol: String,
    /// Aggregate offered load in requests per second
    pub load_rps: u64,
    /// Bernoulli gate on latency samples, in [0, 1]
    pub sampling_rate: f64,
    /// Latency reservoir capacity per worker
    pub samples_per_worker: usize,
    pub warmup_secs: u64,
    pub duration_secs: u64,
    /// NIC to bind and timestamp on (symmetric-nic mode)
    pub interface: Option<String>,
    #[serde(skip)]
    pub pinning: CpuPinning,
    #[serde(skip)]
    pub seed: Option<u64>,
}

impl RunConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            bail!("at least one worker is required");
        }
        if self.connections == 0 {
            bail!("at least one connection is required");
        }
        if self.connections % self.workers != 0 {
            bail!(
                "{} connections do not divide evenly across {} workers",
                self.connections,
                self.workers
            );
        }
        if self.targets.is_empty() {
            bail!("no targets given");
        }
        if self.targets.len() > MAX_TARGETS {
            bail!("{} targets exceed the limit of {}", self.targets.len(), MAX_TARGETS);
        }
        if !(0.0..=1.0).contains(&self.sampling_rate) {
            bail!("sampling rate {} outside [0, 1]", self.sampling_rate);
        }
        if self.samples_per_worker == 0 {
            bail!("per-worker sample capacity must be positive");
        }
        if self.duration_secs == 0 {
            bail!("run duration must be positive");
        }
        if self.mode == AgentMode::SymmetricNic && self.interface.is_none() {
            bail!("symmetric-nic mode needs --interface");
        }
        // Parse-check the descriptors up front so workers cannot fail late
        crate::workload::RandomProcess::parse(&self.interarrival, None)?;
        Ok(())
    }

    pub fn connections_per_worker(&self) -> usize {
        self.connections / self.workers
    }
}
