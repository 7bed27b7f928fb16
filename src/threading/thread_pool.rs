//! A thread pool that drains a [`TaskQueue`] of boxed closures.
//!
//! Grounded in `original_source/src/libs/core/src/Threads/ThreadPoolQueue.cc`
//! (plain variant: every worker blocks on the condvar and calls
//! `GetNextItem`) and `original_source/libs/core/src/Threads/
//! ThreadPoolDelayedQueue.cc` (pumping variant: worker 0 times out its wait
//! every 200ms so delayed tasks get served even without a fresh post).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::threading::task_queue::TaskQueue;
use crate::threading::thread_util::{clamp_worker_count, spawn_named, TaskPriority};
use crate::time::TimeSource;

/// A unit of pool work: a boxed closure run exactly once.
pub type PoolTask = Box<dyn FnOnce() + Send>;

/// The 200ms poll interval `ThreadPoolDelayedQueue`'s worker 0 uses so
/// delayed tasks are served even when nothing posts a fresh wake-up.
const PUMP_INTERVAL: Duration = Duration::from_millis(200);

struct Shared {
    queue: TaskQueue<PoolTask>,
    wait_lock: Mutex<()>,
    wait_cv: Condvar,
    exiting: AtomicBool,
}

/// A fixed-size pool of named worker threads draining a shared [`TaskQueue`].
///
/// `pumping: true` dedicates worker 0 to a 200ms-timeout poll loop so
/// delayed tasks fire close to their deadline even if no new task is posted
/// to wake the pool; every other worker (and the whole pool when
/// `pumping: false`) blocks indefinitely until woken.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    label: &'static str,
}

impl ThreadPool {
    /// Build a pool of `requested` workers (`None` = one per hardware core)
    /// at `priority`, named `"{label} #{n}"`.
    pub fn new(
        requested: Option<usize>,
        priority: TaskPriority,
        pumping: bool,
        clock: Arc<dyn TimeSource>,
        label: &'static str,
    ) -> Self {
        let worker_count = clamp_worker_count(requested);
        let queue = TaskQueue::new(clock);
        let shared = Arc::new(Shared {
            queue,
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
            exiting: AtomicBool::new(false),
        });

        {
            let wake = shared.clone();
            shared
                .queue
                .set_delayed_ready_callback(Box::new(move || wake.wait_cv.notify_all()));
        }

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let shared = shared.clone();
            let is_pumper = pumping && index == 0;
            let name = if is_pumper {
                format!("{label}Pumper#{index}")
            } else {
                format!("{label}#{index}")
            };
            workers.push(spawn_named(name, move || {
                if is_pumper {
                    Self::pump_loop(&shared);
                } else {
                    Self::process_loop(&shared);
                }
            }));
        }

        tracing::debug!(pool = label, workers = worker_count, pumping, "thread pool started");

        Self {
            shared,
            workers: Mutex::new(workers),
            label,
        }
    }

    fn process_loop(shared: &Shared) {
        loop {
            let guard = shared.wait_lock.lock().unwrap();
            let _guard = shared
                .wait_cv
                .wait_while(guard, |_| {
                    !shared.exiting.load(Ordering::Acquire) && !shared.queue.may_have_items()
                })
                .unwrap();
            if shared.exiting.load(Ordering::Acquire) {
                return;
            }
            drop(_guard);
            if let Some(task) = shared.queue.get_next(None) {
                task();
            }
        }
    }

    fn pump_loop(shared: &Shared) {
        loop {
            let guard = shared.wait_lock.lock().unwrap();
            let (_guard, _timeout) = shared
                .wait_cv
                .wait_timeout_while(guard, PUMP_INTERVAL, |_| {
                    !shared.exiting.load(Ordering::Acquire) && !shared.queue.may_have_items()
                })
                .unwrap();
            if shared.exiting.load(Ordering::Acquire) {
                return;
            }
            drop(_guard);
            if shared.queue.may_have_items() {
                if let Some(task) = shared.queue.get_next(None) {
                    task();
                }
            }
        }
    }

    /// Post a task for immediate execution. Returns `false` if the pool has
    /// begun terminating.
    pub fn post_task(&self, task: PoolTask) -> bool {
        if self.shared.exiting.load(Ordering::Acquire) {
            return false;
        }
        let posted = self.shared.queue.push(task);
        if posted {
            self.shared.wait_cv.notify_one();
        }
        posted
    }

    /// Post a task to run no earlier than `delay_sec` from now.
    pub fn post_delayed_task(&self, delay_sec: f64, task: PoolTask) -> bool {
        if self.shared.exiting.load(Ordering::Acquire) {
            return false;
        }
        let posted = self.shared.queue.push_delayed(task, delay_sec);
        if posted {
            self.shared.wait_cv.notify_one();
        }
        posted
    }

    /// Signal all workers to exit and join them. Idempotent.
    pub fn terminate(&self) {
        if self.shared.exiting.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.queue.terminate();
        self.shared.wait_cv.notify_all();
        let mut workers = self.workers.lock().unwrap();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
        tracing::debug!(pool = self.label, "thread pool terminated");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SystemTimeSource;
    use std::sync::mpsc;
    use std::time::Duration as StdDuration;

    #[test]
    fn runs_posted_tasks() {
        let pool = ThreadPool::new(
            Some(2),
            TaskPriority::UserVisible,
            false,
            Arc::new(SystemTimeSource::new()),
            "test-pool",
        );
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            pool.post_task(Box::new(move || tx.send(i).unwrap()));
        }
        let mut results: Vec<i32> = (0..10).map(|_| rx.recv().unwrap()).collect();
        results.sort();
        assert_eq!(results, (0..10).collect::<Vec<_>>());
        pool.terminate();
    }

    #[test]
    fn pumping_pool_serves_delayed_task_without_fresh_post() {
        let pool = ThreadPool::new(
            Some(1),
            TaskPriority::BestEffort,
            true,
            Arc::new(SystemTimeSource::new()),
            "test-pump",
        );
        let (tx, rx) = mpsc::channel();
        pool.post_delayed_task(
            0.01,
            Box::new(move || {
                tx.send(()).unwrap();
            }),
        );
        rx.recv_timeout(StdDuration::from_secs(1))
            .expect("delayed task should run within the pump interval");
        pool.terminate();
    }

    #[test]
    fn terminate_rejects_further_posts() {
        let pool = ThreadPool::new(
            Some(1),
            TaskPriority::UserVisible,
            false,
            Arc::new(SystemTimeSource::new()),
            "test-term",
        );
        pool.terminate();
        assert!(!pool.post_task(Box::new(|| {})));
    }
}
