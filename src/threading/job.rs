//! The cooperative `Job` concurrency primitive, spec.md §4.G.
//!
//! Grounded 1:1 in `original_source/libs/jsRuntime/src/V8Jobs.cc`:
//! `JobState` here is `V8JobState`, `JobHandle` is `V8JobHandle`,
//! `JobDelegate` is `V8JobState::V8JobDelegate`, and the posted worker
//! closure plays the role of `V8JobTaskWorker::Run`.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use crate::threading::thread_util::TaskPriority;
use crate::threading::worker_task_runner::WorkerTaskRunner;

/// Value `B-1` for a 64-bit task-id bitset: the sentinel meaning "no task id
/// assigned" / "all ids exhausted".
const INVALID_TASK_ID: u8 = 63;

/// A user closure a [`Job`] runs concurrently across up to
/// `max_concurrency` workers.
pub trait JobTask: Send + Sync {
    /// Run one invocation of the closure.
    fn run(&self, delegate: &JobDelegate);

    /// How many workers should run concurrently given `active_tasks`
    /// already running.
    fn max_concurrency(&self, active_tasks: usize) -> usize;
}

struct Locked {
    priority: TaskPriority,
    active_tasks: usize,
    pending_tasks: usize,
    num_workers_available: usize,
}

/// Shared state for one Job: the user task, concurrency bookkeeping, the
/// task-id bitset, and the cancellation flag.
pub struct JobState {
    task: Arc<dyn JobTask>,
    workers: Arc<WorkerTaskRunner>,
    locked: Mutex<Locked>,
    worker_released: Condvar,
    assigned_task_ids: AtomicU64,
    canceled: AtomicBool,
}

impl JobState {
    fn new(
        task: Arc<dyn JobTask>,
        workers: Arc<WorkerTaskRunner>,
        priority: TaskPriority,
        num_workers_available: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            task,
            workers,
            locked: Mutex::new(Locked {
                priority,
                active_tasks: 0,
                pending_tasks: 0,
                num_workers_available,
            }),
            worker_released: Condvar::new(),
            assigned_task_ids: AtomicU64::new(0),
            canceled: AtomicBool::new(false),
        })
    }

    fn max_concurrency(&self, active_tasks: usize) -> usize {
        let num_workers_available = self.locked.lock().unwrap().num_workers_available;
        self.task.max_concurrency(active_tasks).min(num_workers_available)
    }

    fn acquire_task_id(&self) -> u8 {
        loop {
            let assigned = self.assigned_task_ids.load(Ordering::Relaxed);
            let task_id = find_first_free_task_id(assigned);
            if task_id == INVALID_TASK_ID {
                return task_id;
            }
            let updated = assigned | (1u64 << task_id);
            if self
                .assigned_task_ids
                .compare_exchange_weak(assigned, updated, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return task_id;
            }
        }
    }

    fn release_task_id(&self, task_id: u8) {
        self.assigned_task_ids
            .fetch_and(!(1u64 << task_id), Ordering::Release);
    }

    fn notify_concurrency_increase(&self) {
        if self.canceled.load(Ordering::Relaxed) {
            return;
        }
        let priority = self.locked.lock().unwrap().priority;
        let active = self.locked.lock().unwrap().active_tasks;
        let to_post = self.compute_tasks_to_post(self.max_concurrency(active));
        self.post_on_worker_thread(to_post, priority);
    }

    fn compute_tasks_to_post(&self, max_concurrency: usize) -> usize {
        let mut locked = self.locked.lock().unwrap();
        let outstanding = locked.active_tasks + locked.pending_tasks;
        if max_concurrency > outstanding {
            let to_post = max_concurrency - outstanding;
            locked.pending_tasks += to_post;
            to_post
        } else {
            0
        }
    }

    fn post_on_worker_thread(self: &Arc<Self>, count: usize, priority: TaskPriority) {
        for _ in 0..count {
            let weak_state = Arc::downgrade(self);
            self.workers.post(Box::new(move || run_job_worker(weak_state)), priority);
        }
    }

    fn can_run_first_task(&self) -> bool {
        let mut locked = self.locked.lock().unwrap();
        locked.pending_tasks -= 1;
        if self.canceled.load(Ordering::Relaxed) {
            return false;
        }
        let max_concurrency = self.task.max_concurrency(locked.active_tasks).min(locked.num_workers_available);
        if locked.active_tasks >= max_concurrency {
            return false;
        }
        locked.active_tasks += 1;
        true
    }

    fn did_run_first_task(self: &Arc<Self>) -> bool {
        let priority;
        {
            let mut locked = self.locked.lock().unwrap();
            priority = locked.priority;
            let max_concurrency = self
                .task
                .max_concurrency(locked.active_tasks - 1)
                .min(locked.num_workers_available);
            if self.canceled.load(Ordering::Relaxed) || locked.active_tasks > max_concurrency {
                locked.active_tasks -= 1;
                self.worker_released.notify_one();
                return false;
            }
        }
        let active_tasks_minus_one = self.locked.lock().unwrap().active_tasks - 1;
        let max_concurrency = self.max_concurrency(active_tasks_minus_one);
        let to_post = self.compute_tasks_to_post(max_concurrency);
        self.post_on_worker_thread(to_post, priority);
        true
    }

    fn wait_for_run_opportunity(&self) -> usize {
        let mut locked = self.locked.lock().unwrap();
        let mut max_concurrency = self
            .task
            .max_concurrency(locked.active_tasks - 1)
            .min(locked.num_workers_available);
        while locked.active_tasks > max_concurrency && locked.active_tasks > 1 {
            locked = self.worker_released.wait(locked).unwrap();
            max_concurrency = self
                .task
                .max_concurrency(locked.active_tasks - 1)
                .min(locked.num_workers_available);
        }
        if max_concurrency != 0 {
            return max_concurrency;
        }
        locked.active_tasks = 0;
        self.canceled.store(true, Ordering::Relaxed);
        0
    }

    fn join(self: &Arc<Self>) {
        {
            let mut locked = self.locked.lock().unwrap();
            locked.priority = TaskPriority::UserBlocking;
            locked.active_tasks += 1;
            locked.num_workers_available += 1;
        }
        let max_concurrency = self.wait_for_run_opportunity();
        if max_concurrency == 0 {
            return;
        }
        let priority = self.locked.lock().unwrap().priority;
        let to_post = self.compute_tasks_to_post(max_concurrency);
        self.post_on_worker_thread(to_post, priority);

        let delegate = JobDelegate::new(self.clone(), true);
        loop {
            self.task.run(&delegate);
            if self.wait_for_run_opportunity() == 0 {
                return;
            }
        }
    }

    fn cancel_and_wait(&self) {
        let mut locked = self.locked.lock().unwrap();
        self.canceled.store(true, Ordering::Relaxed);
        while locked.active_tasks > 0 {
            locked = self.worker_released.wait(locked).unwrap();
        }
    }

    fn cancel_and_detach(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }

    fn is_active(&self) -> bool {
        let locked = self.locked.lock().unwrap();
        self.task.max_concurrency(locked.active_tasks) != 0 || locked.active_tasks != 0
    }

    fn update_priority(&self, priority: TaskPriority) {
        self.locked.lock().unwrap().priority = priority;
    }
}

fn find_first_free_task_id(assigned: u64) -> u8 {
    for idx in 0..INVALID_TASK_ID {
        if assigned & (1u64 << idx) == 0 {
            return idx;
        }
    }
    INVALID_TASK_ID
}

fn run_job_worker(state: Weak<JobState>) {
    let Some(state) = state.upgrade() else {
        return;
    };
    if !state.can_run_first_task() {
        return;
    }
    loop {
        let delegate = JobDelegate::new(state.clone(), false);
        state.task.run(&delegate);
        if !state.did_run_first_task() {
            return;
        }
    }
}

/// Passed to every invocation of a [`JobTask`], giving it a stable task id,
/// a cooperative yield signal, and a concurrency-increase hook.
pub struct JobDelegate {
    state: Arc<JobState>,
    task_id: Cell<Option<u8>>,
    yielded: Cell<bool>,
    is_joining_thread: bool,
}

impl JobDelegate {
    fn new(state: Arc<JobState>, is_joining_thread: bool) -> Self {
        Self {
            state,
            task_id: Cell::new(None),
            yielded: Cell::new(false),
            is_joining_thread,
        }
    }

    /// A stable id in `0..63`, lazily acquired on first call and released
    /// when this delegate is dropped. Returns the sentinel `63` if every id
    /// is already assigned.
    pub fn task_id(&self) -> u8 {
        if let Some(id) = self.task_id.get() {
            return id;
        }
        let id = self.state.acquire_task_id();
        self.task_id.set(Some(id));
        id
    }

    /// Sticky yield check: once it returns `true` it keeps returning `true`.
    /// The calling closure must not call it again after that (debug-only
    /// assertion, matching the original's `DCHECK_FALSE(m_Yielded)`).
    pub fn should_yield(&self) -> bool {
        debug_assert!(!self.yielded.get(), "should_yield called after it returned true");
        let yielded = self.yielded.get() || self.state.canceled.load(Ordering::Relaxed);
        self.yielded.set(yielded);
        yielded
    }

    /// Ask the Job to post more workers, e.g. after the closure discovers
    /// more work than it first estimated.
    pub fn notify_concurrency_increase(&self) {
        self.state.notify_concurrency_increase();
    }

    /// Whether this delegate was handed to the thread that called
    /// [`JobHandle::join`], rather than to a pool worker.
    pub fn is_joining_thread(&self) -> bool {
        self.is_joining_thread
    }
}

impl Drop for JobDelegate {
    fn drop(&mut self) {
        if let Some(id) = self.task_id.get() {
            if id != INVALID_TASK_ID {
                self.state.release_task_id(id);
            }
        }
    }
}

/// Owner-visible handle to a running [`Job`]. Every consuming method
/// (`join`, `cancel`, `cancel_and_detach`) takes `self` by value, matching
/// the original's `m_State = nullptr` after use.
pub struct JobHandle {
    state: Arc<JobState>,
}

impl JobHandle {
    /// Ask the Job to post more workers now that more concurrency is
    /// available (without blocking).
    pub fn notify_concurrency_increase(&self) {
        self.state.notify_concurrency_increase();
    }

    /// Block the calling thread, folding it in as an extra worker until the
    /// Job's concurrency target drops to zero.
    pub fn join(self) {
        self.state.join();
    }

    /// Cancel the Job and block until every active worker has exited.
    pub fn cancel(self) {
        self.state.cancel_and_wait();
    }

    /// Cancel the Job without waiting for active workers to exit.
    pub fn cancel_and_detach(self) {
        self.state.cancel_and_detach();
    }

    /// Whether the Job still wants to run more work or has active workers.
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Update the priority lane used for future posted workers.
    pub fn update_priority(&self, priority: TaskPriority) {
        self.state.update_priority(priority);
    }
}

/// Entry point for starting a new Job: spawns up to
/// `task.max_concurrency(0)` workers on `workers` at `priority`.
pub struct Job;

impl Job {
    /// Start `task` on `workers`, capped at `num_workers_available`
    /// concurrent invocations, and return a handle to it.
    pub fn post(
        task: Arc<dyn JobTask>,
        workers: Arc<WorkerTaskRunner>,
        priority: TaskPriority,
        num_workers_available: usize,
    ) -> JobHandle {
        let state = JobState::new(task, workers, priority, num_workers_available);
        let max_concurrency = state.max_concurrency(0);
        let to_post = state.compute_tasks_to_post(max_concurrency);
        state.post_on_worker_thread(to_post, priority);
        JobHandle { state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SystemTimeSource;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingTask {
        remaining: AtomicUsize,
        completed: AtomicUsize,
        concurrency: usize,
    }

    impl JobTask for CountingTask {
        fn run(&self, delegate: &JobDelegate) {
            loop {
                if delegate.should_yield() {
                    return;
                }
                let prev = self.remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    if n == 0 {
                        None
                    } else {
                        Some(n - 1)
                    }
                });
                match prev {
                    Ok(_) => {
                        self.completed.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(_) => return,
                }
            }
        }

        fn max_concurrency(&self, _active_tasks: usize) -> usize {
            if self.remaining.load(Ordering::SeqCst) == 0 {
                0
            } else {
                self.concurrency
            }
        }
    }

    fn workers() -> Arc<WorkerTaskRunner> {
        Arc::new(WorkerTaskRunner::new(Arc::new(SystemTimeSource::new())))
    }

    #[test]
    fn join_drains_all_remaining_work() {
        let task = Arc::new(CountingTask {
            remaining: AtomicUsize::new(50),
            completed: AtomicUsize::new(0),
            concurrency: 4,
        });
        let handle = Job::post(task.clone(), workers(), TaskPriority::UserVisible, 4);
        handle.join();
        assert_eq!(task.completed.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn cancel_and_wait_stops_workers() {
        struct Forever;
        impl JobTask for Forever {
            fn run(&self, delegate: &JobDelegate) {
                while !delegate.should_yield() {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            fn max_concurrency(&self, _active_tasks: usize) -> usize {
                2
            }
        }
        let handle = Job::post(Arc::new(Forever), workers(), TaskPriority::UserVisible, 2);
        std::thread::sleep(Duration::from_millis(20));
        handle.cancel();
    }

    #[test]
    fn task_id_sentinel_is_sixty_three() {
        assert_eq!(INVALID_TASK_ID, 63);
    }
}
