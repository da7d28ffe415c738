//! Per-worker measurement storage.
//!
//! Each worker owns one collector for the lifetime of its loop; nothing here
//! is shared, so recording is branch-and-store cheap. Reservoirs are
//! fixed-capacity and overwrite their oldest entries once full, keeping
//! memory flat during unbounded runs.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

/// Capacity of the per-worker transmit timestamp log
pub const TX_TIMESTAMP_CAPACITY: usize = 16384;

/// One latency measurement, tagged with when its request was sent so the
/// post-run checks can order samples by transmit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LatencySample {
    /// Request latency in nanoseconds
    pub nanos: u64,
    /// Software transmit time, nanoseconds since the process anchor
    pub tx_nanos: u64,
}

/// Request and byte counters for one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub reqs: u64,
    pub bytes: u64,
}

impl Counters {
    pub fn add(&mut self, reqs: u64, bytes: u64) {
        self.reqs += reqs;
        self.bytes += bytes;
    }
}

/// A worker's counters, latency reservoir and transmit timestamp log.
#[derive(Debug)]
pub struct WorkerStats {
    samples: Vec<LatencySample>,
    capacity: usize,
    offered: u64,
    tx: Counters,
    rx: Counters,
    tx_timestamps: Vec<u64>,
    tx_ts_offered: u64,
    sampling_rate: f64,
    rng: SmallRng,
}

impl WorkerStats {
    pub fn new(capacity: usize, sampling_rate: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => SmallRng::seed_from_u64(s),
            None => SmallRng::from_os_rng(),
        };
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            offered: 0,
            tx: Counters::default(),
            rx: Counters::default(),
            tx_timestamps: Vec::with_capacity(TX_TIMESTAMP_CAPACITY),
            tx_ts_offered: 0,
            sampling_rate,
            rng,
        }
    }

    pub fn record_tx(&mut self, reqs: u64, bytes: u64) {
        self.tx.add(reqs, bytes);
    }

    pub fn record_rx(&mut self, reqs: u64, bytes: u64) {
        self.rx.add(reqs, bytes);
    }

    /// Offer a latency sample to the reservoir. It first passes a Bernoulli
    /// gate at the configured sampling rate, then lands in the next
    /// overwrite slot.
    pub fn record_latency(&mut self, nanos: u64, tx_nanos: u64) {
        if self.sampling_rate < 1.0 && self.rng.random::<f64>() >= self.sampling_rate {
            return;
        }
        let sample = LatencySample { nanos, tx_nanos };
        if self.samples.len() < self.capacity {
            self.samples.push(sample);
        } else {
            let slot = (self.offered % self.capacity as u64) as usize;
            self.samples[slot] = sample;
        }
        self.offered += 1;
    }

    /// Log a transmit timestamp for the inter-arrival fidelity check.
    pub fn record_tx_timestamp(&mut self, nanos: u64) {
        if self.tx_timestamps.len() < TX_TIMESTAMP_CAPACITY {
            self.tx_timestamps.push(nanos);
        } else {
            let slot = (self.tx_ts_offered % TX_TIMESTAMP_CAPACITY as u64) as usize;
            self.tx_timestamps[slot] = nanos;
        }
        self.tx_ts_offered += 1;
    }

    /// Drop everything recorded so far. Runs between the warm-up and the
    /// steady-state phase.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.offered = 0;
        self.tx = Counters::default();
        self.rx = Counters::default();
        self.tx_timestamps.clear();
        self.tx_ts_offered = 0;
    }

    pub fn tx(&self) -> Counters {
        self.tx
    }

    pub fn rx(&self) -> Counters {
        self.rx
    }

    pub fn samples(&self) -> &[LatencySample] {
        &self.samples
    }

    pub fn tx_timestamps(&self) -> &[u64] {
        &self.tx_timestamps
    }

    pub fn into_parts(self) -> (Counters, Counters, Vec<LatencySample>, Vec<u64>) {
        (self.tx, self.rx, self.samples, self.tx_timestamps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut stats = WorkerStats::new(16, 1.0, Some(1));
        stats.record_tx(1, 64);
        stats.record_tx(2, 128);
        stats.record_rx(3, 120);

        assert_eq!(stats.tx(), Counters { reqs: 3, bytes: 192 });
        assert_eq!(stats.rx(), Counters { reqs: 3, bytes: 120 });
    }

    #[test]
    fn reservoir_overwrites_once_full() {
        let mut stats = WorkerStats::new(4, 1.0, Some(2));
        for i in 0..10u64 {
            stats.record_latency(i, i);
        }
        // Size stays at capacity; slot i % 4 holds the latest write for it
        assert_eq!(stats.samples().len(), 4);
        let values: Vec<u64> = stats.samples().iter().map(|s| s.nanos).collect();
        assert_eq!(values, vec![8, 9, 6, 7]);
    }

    #[test]
    fn zero_sampling_rate_records_nothing() {
        let mut stats = WorkerStats::new(16, 0.0, Some(3));
        for _ in 0..1000 {
            stats.record_latency(42, 0);
        }
        assert!(stats.samples().is_empty());
    }

    #[test]
    fn sampling_gate_thins_the_stream() {
        let mut stats = WorkerStats::new(100_000, 0.1, Some(4));
        for _ in 0..100_000 {
            stats.record_latency(1, 0);
        }
        let kept = stats.samples().len() as f64;
        assert!((kept / 100_000.0 - 0.1).abs() < 0.01, "kept {}", kept);
    }

    #[test]
    fn clear_resets_everything() {
        let mut stats = WorkerStats::new(16, 1.0, Some(5));
        stats.record_tx(5, 500);
        stats.record_rx(5, 500);
        stats.record_latency(10, 1);
        stats.record_tx_timestamp(1);

        stats.clear();
        assert_eq!(stats.tx(), Counters::default());
        assert_eq!(stats.rx(), Counters::default());
        assert!(stats.samples().is_empty());
        assert!(stats.tx_timestamps().is_empty());
    }
}
