//! Worker-count derivation for I/O-bound fan-out

use tracing::warn;

/// Hard ceiling on workers a caller may request
pub const MAX_WORKERS: usize = 64;

/// Default cap on derived worker counts, to spare the remote endpoint
pub const DEFAULT_WORKER_CAP: usize = 8;

/// Number of CPUs, falling back to 1 when detection fails
///
/// Restricted containers and some cgroup setups make
/// `available_parallelism` fail; single-worker mode is the safe answer there.
pub fn cpu_count() -> usize {
    match std::thread::available_parallelism() {
        Ok(n) => n.get(),
        Err(e) => {
            warn!(
                "Unable to detect available parallelism ({}), defaulting to 1 worker",
                e
            );
            1
        }
    }
}

/// Default worker count for remote calls: 2x CPU, capped at 8
pub fn default_worker_count() -> usize {
    derive_worker_count(cpu_count(), DEFAULT_WORKER_CAP)
}

/// 2x `cpus` for I/O-bound work, bounded by `cap` and never zero
pub fn derive_worker_count(cpus: usize, cap: usize) -> usize {
    cpus.saturating_mul(2).min(cap).max(1)
}

/// Resolve a requested worker count: 0 means auto-detect, anything else is
/// capped at [`MAX_WORKERS`]
pub fn clamp_workers(requested: usize) -> usize {
    if requested == 0 {
        default_worker_count()
    } else {
        requested.min(MAX_WORKERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_worker_count() {
        assert_eq!(derive_worker_count(1, 8), 2);
        assert_eq!(derive_worker_count(3, 8), 6);
        assert_eq!(derive_worker_count(16, 8), 8);
        assert_eq!(derive_worker_count(0, 8), 1);
    }

    #[test]
    fn test_default_worker_count_bounds() {
        let n = default_worker_count();
        assert!(n >= 1);
        assert!(n <= DEFAULT_WORKER_CAP);
    }

    #[test]
    fn test_clamp_workers() {
        assert_eq!(clamp_workers(0), default_worker_count());
        assert_eq!(clamp_workers(4), 4);
        assert_eq!(clamp_workers(1000), MAX_WORKERS);
    }
}
