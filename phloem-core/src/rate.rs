//! Process-wide offered load, shared with every worker.
//!
//! The whole control surface is a handful of atomic words, so load changes
//! never block the scheduling loops. Workers notice a change through the
//! epoch counter and re-target their inter-arrival process themselves; a load
//! of zero pauses sending without tearing anything down.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RateController {
    load_rps: AtomicU64,
    epoch: AtomicU64,
    measuring: AtomicBool,
    stopped: AtomicBool,
}

impl RateController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the aggregate offered load in requests per second. Zero pauses
    /// the generators.
    pub fn set_load(&self, rps: u64) {
        self.load_rps.store(rps, Ordering::Release);
        self.epoch.fetch_add(1, Ordering::Release);
    }

    pub fn load(&self) -> u64 {
        self.load_rps.load(Ordering::Acquire)
    }

    /// Bumped on every `set_load`; workers compare against their last seen
    /// value to know when to re-target.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn should_load(&self) -> bool {
        self.load() > 0
    }

    /// Per-worker inter-arrival average in microseconds for the current
    /// load, or `None` while paused.
    pub fn per_worker_avg_us(&self, workers: usize) -> Option<f64> {
        let load = self.load();
        if load == 0 || workers == 0 {
            None
        } else {
            Some(1e6 * workers as f64 / load as f64)
        }
    }

    pub fn start_measuring(&self) {
        self.measuring.store(true, Ordering::Release);
    }

    pub fn stop_measuring(&self) {
        self.measuring.store(false, Ordering::Release);
    }

    pub fn should_measure(&self) -> bool {
        self.measuring.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn should_stop(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_load_pauses() {
        let rate = RateController::new();
        assert!(!rate.should_load());
        assert!(rate.per_worker_avg_us(4).is_none());

        rate.set_load(1000);
        assert!(rate.should_load());

        rate.set_load(0);
        assert!(!rate.should_load());
    }

    #[test]
    fn epoch_bumps_on_every_change() {
        let rate = RateController::new();
        let e0 = rate.epoch();
        rate.set_load(1000);
        rate.set_load(2000);
        assert_eq!(rate.epoch(), e0 + 2);
    }

    #[test]
    fn load_splits_across_workers() {
        let rate = RateController::new();
        rate.set_load(10_000);
        // 10k rps over 4 workers: 2.5k each, 400 us between sends
        assert_eq!(rate.per_worker_avg_us(4), Some(400.0));
        assert_eq!(rate.per_worker_avg_us(1), Some(100.0));
    }

    #[test]
    fn lifecycle_flags() {
        let rate = RateController::new();
        assert!(!rate.should_measure());
        assert!(!rate.should_stop());

        rate.start_measuring();
        assert!(rate.should_measure());
        rate.stop_measuring();
        assert!(!rate.should_measure());

        rate.stop();
        assert!(rate.should_stop());
    }
}
