//! CPU placement for shard worker threads.

/// Pin the calling thread to `core_id`.
///
/// Keeps a shard's matcher state in one core's caches for the lifetime of the worker.
///
/// # Platform Support
/// - **Linux**: Uses `pthread_setaffinity_np`
/// - **Other platforms**: No-op
///
/// # Arguments
/// * `core_id` - CPU core to pin to (0-indexed)
///
/// # Note
/// Failure (an offline core, a restricted cpuset) is logged and otherwise ignored; the
/// worker keeps running wherever the OS puts it.
pub fn pin_current_thread(core_id: usize) {
    #[cfg(target_os = "linux")]
    {
        use libc::{cpu_set_t, pthread_self, pthread_setaffinity_np, CPU_SET, CPU_SETSIZE, CPU_ZERO};

        if core_id >= CPU_SETSIZE as usize {
            tracing::warn!(core_id, "core id beyond cpu set size, not pinning");
            return;
        }
        let rc = unsafe {
            let mut set: cpu_set_t = std::mem::zeroed();
            CPU_ZERO(&mut set);
            CPU_SET(core_id, &mut set);
            pthread_setaffinity_np(pthread_self(), std::mem::size_of::<cpu_set_t>(), &set)
        };
        if rc != 0 {
            tracing::warn!(core_id, rc, "failed to pin thread");
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = core_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinning_to_core_zero_does_not_panic() {
        std::thread::spawn(|| pin_current_thread(0)).join().unwrap();
    }

    #[test]
    fn absurd_core_is_ignored() {
        pin_current_thread(usize::MAX);
    }
}
