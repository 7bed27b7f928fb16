//! The single-threaded, cooperative foreground task runner, spec.md §4.F.
//!
//! Tasks are only ever drained by the owning Runtime from inside a VM
//! isolate scope — there is no background thread here, just the queue
//! discipline and the nesting-depth guard the original v8App's embedder
//! task runner provides to V8's `TaskRunner` interface.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::threading::task_queue::TaskQueue;
use crate::time::TimeSource;

/// A foreground task: a boxed closure run once on the runtime's thread.
pub type Task = Box<dyn FnOnce() + Send>;

/// An idle task: receives the deadline (monotonic seconds) it must finish
/// before, same contract V8's `IdleTask::Run(double deadline_in_seconds)`
/// gives embedders.
pub type IdleTask = Box<dyn FnOnce(f64) + Send>;

/// The foreground runner's two independent queues plus a nesting-depth
/// counter shared with any [`TaskRunScope`] instances.
pub struct ForegroundTaskRunner {
    tasks: TaskQueue<Task>,
    idle_tasks: TaskQueue<IdleTask>,
    nesting_depth: AtomicU32,
}

impl ForegroundTaskRunner {
    /// Create an empty runner driven by `clock`.
    pub fn new(clock: Arc<dyn TimeSource>) -> Self {
        Self {
            tasks: TaskQueue::new(clock.clone()),
            idle_tasks: TaskQueue::new(clock),
            nesting_depth: AtomicU32::new(0),
        }
    }

    /// Post a nestable, immediately-ready task.
    pub fn post_task(&self, task: Task) -> bool {
        self.tasks.push(task)
    }

    /// Post a non-nestable, immediately-ready task.
    pub fn post_non_nestable_task(&self, task: Task) -> bool {
        self.tasks.push_non_nestable(task)
    }

    /// Post a task ready no earlier than `delay_sec` from now.
    pub fn post_delayed_task(&self, task: Task, delay_sec: f64) -> bool {
        self.tasks.push_delayed(task, delay_sec)
    }

    /// Post a non-nestable task ready no earlier than `delay_sec` from now.
    pub fn post_non_nestable_delayed_task(&self, task: Task, delay_sec: f64) -> bool {
        self.tasks.push_non_nestable_delayed(task, delay_sec)
    }

    /// Post an idle task.
    pub fn post_idle_task(&self, task: IdleTask) -> bool {
        self.idle_tasks.push(task)
    }

    /// The current nesting depth, as seen by [`ForegroundTaskRunner::get_next_task`].
    pub fn nesting_depth(&self) -> u32 {
        self.nesting_depth.load(Ordering::Acquire)
    }

    /// Pop the next eligible regular task, honoring the current nesting
    /// depth (non-nestable tasks are invisible while `nesting_depth() > 0`).
    pub fn get_next_task(&self) -> Option<Task> {
        self.tasks.get_next(Some(self.nesting_depth()))
    }

    /// Pop the next idle task. Idle tasks are always nestable.
    pub fn get_next_idle_task(&self) -> Option<IdleTask> {
        self.idle_tasks.get_next(Some(0))
    }

    /// Whether any regular task may be ready. Possibly stale; see
    /// [`TaskQueue::may_have_items`].
    pub fn may_have_tasks(&self) -> bool {
        self.tasks.may_have_items()
    }

    /// Whether any idle task is queued.
    pub fn may_have_idle_tasks(&self) -> bool {
        self.idle_tasks.may_have_items()
    }

    /// Drain both queues and reject further posts.
    pub fn terminate(&self) {
        self.tasks.terminate();
        self.idle_tasks.terminate();
    }
}

/// RAII nesting-depth guard. Hold one for the duration of a task-running
/// loop (e.g. a nested V8 microtask checkpoint) so non-nestable tasks stay
/// invisible until control returns to the outermost run.
pub struct TaskRunScope<'a> {
    runner: &'a ForegroundTaskRunner,
}

impl<'a> TaskRunScope<'a> {
    /// Enter a nested run scope, incrementing the runner's nesting depth.
    pub fn enter(runner: &'a ForegroundTaskRunner) -> Self {
        runner.nesting_depth.fetch_add(1, Ordering::AcqRel);
        Self { runner }
    }
}

impl Drop for TaskRunScope<'_> {
    fn drop(&mut self) {
        let previous = self.runner.nesting_depth.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "task-run nesting depth underflowed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::StubTimeSource;

    fn runner() -> ForegroundTaskRunner {
        ForegroundTaskRunner::new(Arc::new(StubTimeSource::new()))
    }

    #[test]
    fn non_nestable_task_hidden_inside_scope() {
        let runner = runner();
        runner.post_non_nestable_task(Box::new(|| {}));
        {
            let _scope = TaskRunScope::enter(&runner);
            assert!(runner.get_next_task().is_none());
        }
        assert!(runner.get_next_task().is_some());
    }

    #[test]
    fn nesting_depth_never_goes_negative() {
        let runner = runner();
        assert_eq!(runner.nesting_depth(), 0);
        {
            let _outer = TaskRunScope::enter(&runner);
            assert_eq!(runner.nesting_depth(), 1);
            {
                let _inner = TaskRunScope::enter(&runner);
                assert_eq!(runner.nesting_depth(), 2);
            }
            assert_eq!(runner.nesting_depth(), 1);
        }
        assert_eq!(runner.nesting_depth(), 0);
    }

    #[test]
    fn idle_tasks_run_with_deadline() {
        let runner = runner();
        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen_clone = seen.clone();
        runner.post_idle_task(Box::new(move |deadline| {
            *seen_clone.lock().unwrap() = Some(deadline);
        }));
        let task = runner.get_next_idle_task().expect("idle task queued");
        task(42.0);
        assert_eq!(*seen.lock().unwrap(), Some(42.0));
    }

    #[test]
    fn terminate_drops_queued_tasks() {
        let runner = runner();
        runner.post_task(Box::new(|| {}));
        runner.terminate();
        assert!(runner.get_next_task().is_none());
        assert!(!runner.post_task(Box::new(|| {})));
    }
}
