//! The platform façade, spec.md §4.H.
//!
//! Aggregates the time source (A), the worker task runner (E), and the Job
//! primitive (G) behind one object Runtimes and Jobs consult for
//! scheduling. Grounded in `original_source/libs/jsRuntime/src/
//! V8AppPlatform.cc`, which plays the same role for the original embedder:
//! one process-wide object owning the priority worker lanes and handing out
//! per-isolate foreground task runners. The actual V8 isolate is still
//! driven by the real `v8::new_default_platform()` (as the teacher does);
//! this façade is the native-side scheduling hub spec.md describes, not a
//! replacement registered with V8 itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::threading::foreground_task_runner::ForegroundTaskRunner;
use crate::threading::job::{Job, JobHandle, JobTask};
use crate::threading::thread_util::TaskPriority;
use crate::threading::worker_task_runner::WorkerTaskRunner;
use crate::time::{SystemTimeSource, TimeSource};

/// Opaque identity for a registered Runtime's foreground task runner.
/// `Runtime` allocates one when it registers itself with the platform.
pub type RuntimeId = u64;

struct RuntimeEntry {
    foreground: Arc<ForegroundTaskRunner>,
    idle_tasks_enabled: bool,
}

/// Process-wide scheduling hub: one [`WorkerTaskRunner`], one clock, and a
/// registry of per-Runtime foreground task runners.
pub struct Platform {
    clock: Arc<dyn TimeSource>,
    workers: Arc<WorkerTaskRunner>,
    runtimes: Mutex<HashMap<RuntimeId, RuntimeEntry>>,
    next_runtime_id: Mutex<RuntimeId>,
}

impl Platform {
    /// Build a platform with the real system clock.
    pub fn new() -> Arc<Self> {
        Self::with_clock(Arc::new(SystemTimeSource::new()))
    }

    /// Build a platform driven by `clock` (tests substitute a stub).
    pub fn with_clock(clock: Arc<dyn TimeSource>) -> Arc<Self> {
        Arc::new(Self {
            workers: Arc::new(WorkerTaskRunner::new(clock.clone())),
            clock,
            runtimes: Mutex::new(HashMap::new()),
            next_runtime_id: Mutex::new(0),
        })
    }

    /// Register a new Runtime's foreground task runner and return the id the
    /// Runtime should hand back to [`Platform::foreground_task_runner`].
    pub fn register_runtime(&self, idle_tasks_enabled: bool) -> (RuntimeId, Arc<ForegroundTaskRunner>) {
        let foreground = Arc::new(ForegroundTaskRunner::new(self.clock.clone()));
        let mut next_id = self.next_runtime_id.lock().unwrap();
        let id = *next_id;
        *next_id += 1;
        self.runtimes.lock().unwrap().insert(
            id,
            RuntimeEntry {
                foreground: foreground.clone(),
                idle_tasks_enabled,
            },
        );
        (id, foreground)
    }

    /// Drop a Runtime's entry once it has been disposed.
    pub fn unregister_runtime(&self, id: RuntimeId) {
        self.runtimes.lock().unwrap().remove(&id);
    }

    /// The foreground task runner for a registered Runtime, if still present.
    pub fn foreground_task_runner(&self, id: RuntimeId) -> Option<Arc<ForegroundTaskRunner>> {
        self.runtimes.lock().unwrap().get(&id).map(|e| e.foreground.clone())
    }

    /// Whether idle tasks are enabled for a registered Runtime.
    pub fn idle_tasks_enabled(&self, id: RuntimeId) -> bool {
        self.runtimes
            .lock()
            .unwrap()
            .get(&id)
            .map(|e| e.idle_tasks_enabled)
            .unwrap_or(false)
    }

    /// Number of worker threads backing the worker pool lanes.
    pub fn number_of_worker_threads(&self) -> usize {
        crate::threading::thread_util::hardware_cores().max(1)
    }

    /// Post a task to a worker lane.
    pub fn call_on_worker_thread(&self, priority: TaskPriority, task: crate::threading::thread_pool::PoolTask) {
        self.workers.post(task, priority);
    }

    /// Post a delayed task to a worker lane.
    pub fn call_delayed_on_worker_thread(
        &self,
        priority: TaskPriority,
        delay_sec: f64,
        task: crate::threading::thread_pool::PoolTask,
    ) {
        self.workers.post_delayed(task, delay_sec, priority);
    }

    /// Start a new [`Job`], capping concurrency to 2 for best-effort
    /// priority or when more than 2 worker threads are available, matching
    /// `V8AppPlatform::CreateJobImpl`'s conservative default.
    pub fn post_job(&self, priority: TaskPriority, task: Arc<dyn JobTask>) -> JobHandle {
        let mut num_workers = self.number_of_worker_threads();
        if priority == TaskPriority::BestEffort || num_workers > 2 {
            num_workers = 2;
        }
        Job::post(task, self.workers.clone(), priority, num_workers)
    }

    /// Pause or resume every worker lane (used while snapshotting).
    pub fn set_workers_paused(&self, paused: bool) {
        self.workers.set_paused(paused);
    }

    /// Monotonic seconds, per [`TimeSource::monotonic_seconds`].
    pub fn monotonically_increasing_time(&self) -> f64 {
        self.clock.monotonic_seconds()
    }

    /// Wall-clock milliseconds, per [`TimeSource::wall_clock_millis`].
    pub fn current_clock_time_millis(&self) -> f64 {
        self.clock.wall_clock_millis()
    }

    /// Terminate all worker lanes. Runtimes must already be disposed.
    pub fn shutdown(&self) {
        self.workers.terminate();
        self.runtimes.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::StubTimeSource;

    #[test]
    fn registers_and_looks_up_runtime_foreground_runner() {
        let platform = Platform::with_clock(Arc::new(StubTimeSource::new()));
        let (id, foreground) = platform.register_runtime(true);
        assert!(Arc::ptr_eq(&foreground, &platform.foreground_task_runner(id).unwrap()));
        assert!(platform.idle_tasks_enabled(id));
        platform.unregister_runtime(id);
        assert!(platform.foreground_task_runner(id).is_none());
    }

    #[test]
    fn clock_reflects_the_injected_time_source() {
        let clock = Arc::new(StubTimeSource::new());
        let platform = Platform::with_clock(clock.clone());
        clock.advance(3.0);
        assert!((platform.monotonically_increasing_time() - 3.0).abs() < 1e-9);
    }
}
