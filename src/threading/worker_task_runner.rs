//! Per-priority-lane wrapper over [`ThreadPool`], spec.md §4.E.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::threading::thread_pool::{PoolTask, ThreadPool};
use crate::threading::thread_util::TaskPriority;
use crate::time::TimeSource;

/// Three `ThreadPool` lanes, one per [`TaskPriority`], each sized to
/// `max(1, hardware_cores)` per spec.md §3 WorkerQueues.
pub struct WorkerTaskRunner {
    lanes: [ThreadPool; TaskPriority::COUNT],
    paused: AtomicBool,
}

impl WorkerTaskRunner {
    /// Build the three priority lanes, sharing `clock` across them.
    pub fn new(clock: Arc<dyn TimeSource>) -> Self {
        let lanes = [
            ThreadPool::new(None, TaskPriority::BestEffort, false, clock.clone(), "worker-best-effort"),
            ThreadPool::new(None, TaskPriority::UserVisible, false, clock.clone(), "worker-user-visible"),
            ThreadPool::new(None, TaskPriority::UserBlocking, false, clock, "worker-user-blocking"),
        ];
        Self {
            lanes,
            paused: AtomicBool::new(false),
        }
    }

    fn lane(&self, priority: TaskPriority) -> &ThreadPool {
        &self.lanes[priority.lane_index()]
    }

    /// Post an immediately-runnable task to `priority`'s lane.
    pub fn post(&self, task: PoolTask, priority: TaskPriority) -> bool {
        if self.paused.load(Ordering::Acquire) {
            return false;
        }
        self.lane(priority).post_task(task)
    }

    /// Post a task to run no earlier than `delay_sec` from now, on
    /// `priority`'s lane.
    pub fn post_delayed(&self, task: PoolTask, delay_sec: f64, priority: TaskPriority) -> bool {
        if self.paused.load(Ordering::Acquire) {
            return false;
        }
        self.lane(priority).post_delayed_task(delay_sec, task)
    }

    /// Pause or resume all lanes. While paused, `post`/`post_delayed` are
    /// rejected; already-queued tasks are not discarded.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    /// Whether the runner is currently paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Terminate every lane, cascading.
    pub fn terminate(&self) {
        for lane in &self.lanes {
            lane.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SystemTimeSource;
    use std::sync::mpsc;

    #[test]
    fn posts_land_on_requested_lane() {
        let runner = WorkerTaskRunner::new(Arc::new(SystemTimeSource::new()));
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        runner.post(Box::new(move || tx.send("best-effort").unwrap()), TaskPriority::BestEffort);
        runner.post(Box::new(move || tx2.send("user-blocking").unwrap()), TaskPriority::UserBlocking);
        let mut seen: Vec<_> = (0..2).map(|_| rx.recv().unwrap()).collect();
        seen.sort();
        assert_eq!(seen, vec!["best-effort", "user-blocking"]);
        runner.terminate();
    }

    #[test]
    fn paused_runner_rejects_posts() {
        let runner = WorkerTaskRunner::new(Arc::new(SystemTimeSource::new()));
        runner.set_paused(true);
        assert!(!runner.post(Box::new(|| {}), TaskPriority::UserVisible));
        runner.set_paused(false);
        assert!(runner.post(Box::new(|| {}), TaskPriority::UserVisible));
        runner.terminate();
    }
}
