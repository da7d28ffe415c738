//! Packet timestamps with an optional hardware component.
//!
//! Every timestamp carries monotonic software nanoseconds taken off a
//! process-wide anchor. On Linux, NIC-timestamped packets additionally carry
//! the raw hardware clock reading; `duration_since` prefers the hardware pair
//! when both sides have one, because the NIC clock and the host clock are not
//! comparable to each other.

use std::sync::OnceLock;
use std::time::Instant;

static ANCHOR: OnceLock<Instant> = OnceLock::new();

fn anchor() -> Instant {
    *ANCHOR.get_or_init(Instant::now)
}

/// A point in time, software-clocked and optionally hardware-clocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    /// Nanoseconds since the process-wide monotonic anchor
    sw_nanos: u64,
    /// Raw NIC clock nanoseconds, when the packet was hardware-timestamped
    hw_nanos: Option<u64>,
}

impl Timestamp {
    /// Capture the current monotonic time.
    pub fn now() -> Self {
        Self { sw_nanos: anchor().elapsed().as_nanos() as u64, hw_nanos: None }
    }

    /// Build a timestamp from a raw NIC clock reading (timespec fields).
    ///
    /// The software component is captured at call time so the sample stays
    /// usable even when the peer timestamp lacks a hardware reading.
    pub fn from_hardware(tv_sec: i64, tv_nsec: i64) -> Self {
        let hw = (tv_sec as u64).wrapping_mul(1_000_000_000).wrapping_add(tv_nsec as u64);
        Self { sw_nanos: anchor().elapsed().as_nanos() as u64, hw_nanos: Some(hw) }
    }

    /// Software nanoseconds since the process anchor.
    pub fn sw_nanos(&self) -> u64 {
        self.sw_nanos
    }

    /// Hardware (NIC clock) nanoseconds, if this packet was NIC-timestamped.
    pub fn hw_nanos(&self) -> Option<u64> {
        self.hw_nanos
    }

    pub fn has_hardware(&self) -> bool {
        self.hw_nanos.is_some()
    }

    /// Elapsed nanoseconds from `earlier` to `self`.
    ///
    /// Uses the hardware clocks when both timestamps carry one, the software
    /// clock otherwise. Returns `None` when the interval would be negative,
    /// which happens with reordered or mismatched timestamps and means the
    /// sample should be dropped.
    pub fn duration_since(&self, earlier: &Timestamp) -> Option<u64> {
        match (self.hw_nanos, earlier.hw_nanos) {
            (Some(end), Some(start)) => end.checked_sub(start),
            _ => self.sw_nanos.checked_sub(earlier.sw_nanos),
        }
    }
}
