//! CPU pinning for worker threads.

use anyhow::bail;

/// How workers map onto cores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CpuPinning {
    /// Leave placement to the scheduler
    #[default]
    None,
    /// Worker i on core i
    Auto,
    /// Worker i on core offset + i
    Offset(usize),
}

/// Pin the calling thread according to the policy.
pub fn pin_thread(pinning: CpuPinning, worker_id: usize) -> anyhow::Result<()> {
    let offset = match pinning {
        CpuPinning::None => return Ok(()),
        CpuPinning::Auto => 0,
        CpuPinning::Offset(o) => o,
    };

    let Some(cores) = core_affinity::get_core_ids() else {
        bail!("could not enumerate CPU cores");
    };
    let target = offset + worker_id;
    let Some(core) = cores.get(target) else {
        bail!("core {} not available ({} cores)", target, cores.len());
    };

    if !core_affinity::set_for_current(*core) {
        bail!("failed to pin worker {} to core {}", worker_id, target);
    }
    tracing::debug!(worker_id, core = target, "pinned worker thread");
    Ok(())
}

/// Number of schedulable cores.
pub fn core_count() -> usize {
    core_affinity::get_core_ids().map(|c| c.len()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_pinning_always_succeeds() {
        pin_thread(CpuPinning::None, 17).unwrap();
    }

    #[test]
    fn pin_to_first_core() {
        // Worker 0 with auto pinning lands on core 0, which always exists
        pin_thread(CpuPinning::Auto, 0).unwrap();
    }

    #[test]
    fn pin_beyond_core_count_fails() {
        let count = core_count();
        assert!(pin_thread(CpuPinning::Auto, count + 100).is_err());
    }
}
