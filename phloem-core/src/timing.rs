//! Monotonic time helpers for the scheduling loops.
//!
//! All deadlines are nanoseconds since a process-wide anchor, so a `u64`
//! comparison is enough to decide whether a send is due.

use std::sync::OnceLock;
use std::time::Instant;

static START: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the first call in this process.
pub fn time_ns() -> u64 {
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Spin until the monotonic clock reaches `deadline_ns`.
pub fn busy_wait_until(deadline_ns: u64) {
    while time_ns() < deadline_ns {
        std::hint::spin_loop();
    }
}

/// Spin for `duration_ns` nanoseconds.
pub fn busy_wait_ns(duration_ns: u64) {
    busy_wait_until(time_ns() + duration_ns);
}
