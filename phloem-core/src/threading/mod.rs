//! Worker thread runtime.
//!
//! One OS thread per worker, optionally pinned. Workers get a shared barrier
//! so they can finish their connection setup before anyone starts sending,
//! and hand their results back by value through `join`.

pub mod affinity;

pub use affinity::{core_count, pin_thread, CpuPinning};

use std::sync::{Arc, Barrier};
use std::thread;

use crate::{Error, Result};

/// Spawn `workers` threads running `work` and collect their results.
///
/// The closure receives the worker id and a barrier sized to the worker
/// count; it decides when to rendezvous. A panicking or failing worker fails
/// the whole run.
pub fn run_workers<T, F>(workers: usize, pinning: CpuPinning, work: F) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: Fn(usize, &Barrier) -> Result<T> + Send + Sync + 'static,
{
    if workers == 0 {
        return Err(Error::Config("at least one worker is required".to_string()));
    }

    let barrier = Arc::new(Barrier::new(workers));
    let work = Arc::new(work);

    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let barrier = Arc::clone(&barrier);
        let work = Arc::clone(&work);

        let handle = thread::Builder::new()
            .name(format!("phloem-worker-{}", worker_id))
            .spawn(move || -> Result<T> {
                pin_thread(pinning, worker_id)?;
                work(worker_id, &barrier)
            })?;
        handles.push(handle);
    }

    let mut results = Vec::with_capacity(workers);
    for (worker_id, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(result)) => results.push(result),
            Ok(Err(e)) => {
                tracing::error!(worker_id, error = %e, "worker failed");
                return Err(e);
            }
            Err(_) => {
                return Err(Error::Other(format!("worker {} panicked", worker_id)));
            }
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn workers_rendezvous_and_return_results() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);

        let results = run_workers(4, CpuPinning::None, move |worker_id, barrier| {
            c.fetch_add(1, Ordering::SeqCst);
            barrier.wait();
            // After the barrier every worker must have counted itself
            assert_eq!(c.load(Ordering::SeqCst), 4);
            Ok(worker_id * 10)
        })
        .unwrap();

        let mut sorted = results.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 10, 20, 30]);
    }

    #[test]
    fn failing_worker_fails_the_run() {
        let result: Result<Vec<()>> = run_workers(2, CpuPinning::None, |worker_id, barrier| {
            barrier.wait();
            if worker_id == 1 {
                Err(Error::Other("boom".to_string()))
            } else {
                Ok(())
            }
        });
        assert!(result.is_err());
    }

    #[test]
    fn zero_workers_is_a_config_error() {
        let result: Result<Vec<()>> =
            run_workers(0, CpuPinning::None, |_, _| Ok(()));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
