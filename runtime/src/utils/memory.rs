use crate::runtime_error::{RuntimeError, RuntimeResult};

/// The memory available to the process, honoring cgroup limits.
pub fn memory_limit() -> RuntimeResult<u64> {
    effective_limits::memory_limit()
        .map_err(|_| RuntimeError::General("error getting effective memory limits".to_string()))
}
