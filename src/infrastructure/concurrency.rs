//! Concurrency management for Hookweave.
//! Sizes the rayon pool shared by the matcher, injector, and optimizer.

use anyhow::Result;

/// Worker count: the configured value, else one per core.
pub fn worker_count(configured: Option<usize>) -> usize {
    configured.filter(|&n| n > 0).unwrap_or_else(num_cpus::get).max(1)
}

/// Initialize the global rayon thread pool with controlled worker count.
/// Returns the number of workers.
pub fn init_thread_pool(configured: Option<usize>) -> Result<usize> {
    let workers = worker_count(configured);

    rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("hookweave-{}", i))
        .build_global()?;

    tracing::debug!(
        workers,
        cores = num_cpus::get(),
        "initialized thread pool"
    );

    Ok(workers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_count() {
        assert_eq!(worker_count(Some(3)), 3);
        assert_eq!(worker_count(Some(0)), num_cpus::get().max(1));
        assert!(worker_count(None) >= 1);
    }

    #[test]
    fn test_init_thread_pool_twice() {
        // The global pool can be built once per process; a second call
        // reports the error instead of panicking.
        let _ = init_thread_pool(Some(2));
        assert!(init_thread_pool(Some(2)).is_err());
    }
}
