use crate::error::Error;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

/// Upper bound for the default inner pool.
const DEFAULT_SUB_WORKER_CAP: usize = 4;

/// Resolve a configured outer worker count; `0` means one per CPU.
pub fn resolve_workers(workers: usize) -> usize {
    if workers == 0 {
        num_cpus::get().max(1)
    } else {
        workers
    }
}

/// Resolve a configured inner worker count; `0` means `min(4, cpus)`.
pub fn resolve_sub_workers(sub_workers: usize) -> usize {
    if sub_workers == 0 {
        num_cpus::get().clamp(1, DEFAULT_SUB_WORKER_CAP)
    } else {
        sub_workers
    }
}

/// The two bounded pools of a run: one task per top-level input on the
/// outer pool, extraction and hashing of archive members on the inner one.
pub struct WorkerPools {
    pub outer: ThreadPool,
    pub inner: ThreadPool,
}

impl WorkerPools {
    pub fn new(workers: usize, sub_workers: usize) -> Result<Self, Error> {
        let workers = resolve_workers(workers);
        let sub_workers = resolve_sub_workers(sub_workers);
        let outer = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("romsmith-input-{}", i))
            .build()
            .map_err(|e| Error::Other(format!("could not start worker pool: {}", e)))?;
        let inner = ThreadPoolBuilder::new()
            .num_threads(sub_workers)
            .thread_name(|i| format!("romsmith-member-{}", i))
            .build()
            .map_err(|e| Error::Other(format!("could not start sub-worker pool: {}", e)))?;
        debug!("Worker pools: {} input workers, {} sub-workers", workers, sub_workers);
        Ok(Self { outer, inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_resolves_to_bounded_defaults() {
        assert!(resolve_workers(0) >= 1);
        let sub = resolve_sub_workers(0);
        assert!((1..=DEFAULT_SUB_WORKER_CAP).contains(&sub));
        assert_eq!(resolve_workers(3), 3);
        assert_eq!(resolve_sub_workers(7), 7);
    }

    #[test]
    fn test_pools_have_requested_sizes() {
        let pools = WorkerPools::new(2, 3).unwrap();
        assert_eq!(pools.outer.current_num_threads(), 2);
        assert_eq!(pools.inner.current_num_threads(), 3);
    }
}
