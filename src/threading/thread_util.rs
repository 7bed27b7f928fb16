//! Priority-tagged worker threads and the hardware-core probe.
//!
//! Grounded in `original_source/src/libs/core/src/Threads/ThreadPoolQueue.cc`,
//! which clamps a requested worker count to `max(1, min(requested, cores))`
//! and spawns named `ThreadPoolThread`s at a fixed OS priority.

use std::thread;

/// Scheduling priority for worker-pool lanes and posted jobs.
///
/// Mirrors `v8::TaskPriority` as used by the original `V8Jobs.cc`
/// (`kBestEffort` / `kUserVisible` / `kUserBlocking`), plus a `MaxPriority`
/// sentinel used only as an array bound for [`crate::threading::WorkerTaskRunner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskPriority {
    /// Lowest priority; may be starved indefinitely by higher-priority work.
    BestEffort,
    /// Default priority for work the user is waiting to see.
    UserVisible,
    /// Highest priority; used for work blocking a user-visible operation.
    UserBlocking,
}

impl TaskPriority {
    /// Number of real priority lanes (excludes the `MaxPriority` bound).
    pub const COUNT: usize = 3;

    /// Index into a fixed-size lane array.
    pub fn lane_index(self) -> usize {
        match self {
            TaskPriority::BestEffort => 0,
            TaskPriority::UserVisible => 1,
            TaskPriority::UserBlocking => 2,
        }
    }
}

/// Number of hardware cores available, used to size thread pools.
///
/// Falls back to 1 if the platform cannot report a core count.
pub fn hardware_cores() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Clamp a requested worker count to `[1, hardware_cores]`. A `None` request
/// means "use all hardware cores", matching `ThreadPoolQueue`'s
/// `inNumberOfWorkers < 0` branch.
pub fn clamp_worker_count(requested: Option<usize>) -> usize {
    let cores = hardware_cores();
    match requested {
        Some(n) => n.clamp(1, cores),
        None => cores.max(1),
    }
}

/// Spawn a named worker thread running `body`. Thread name failures (name
/// too long on some platforms) are swallowed by the OS; we still request the
/// name for diagnostics (stack traces, `top -H`).
pub fn spawn_named<F>(name: impl Into<String>, body: F) -> thread::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.into())
        .spawn(body)
        .expect("failed to spawn worker thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_worker_count_uses_all_cores_when_unspecified() {
        assert_eq!(clamp_worker_count(None), hardware_cores().max(1));
    }

    #[test]
    fn clamp_worker_count_floors_at_one() {
        assert_eq!(clamp_worker_count(Some(0)), 1);
    }

    #[test]
    fn clamp_worker_count_caps_at_hardware_cores() {
        assert_eq!(clamp_worker_count(Some(usize::MAX)), hardware_cores());
    }

    #[test]
    fn priority_lane_index_is_stable_and_ordered() {
        assert_eq!(TaskPriority::BestEffort.lane_index(), 0);
        assert_eq!(TaskPriority::UserVisible.lane_index(), 1);
        assert_eq!(TaskPriority::UserBlocking.lane_index(), 2);
        assert!(TaskPriority::BestEffort < TaskPriority::UserBlocking);
    }
}
