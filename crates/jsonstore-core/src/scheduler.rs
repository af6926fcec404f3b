//! Delayed task execution for deferred commits
//!
//! The storage engine only needs "run this later, unless I change my mind":
//! `Scheduler::schedule` returns a `TaskHandle` whose `cancel()` stops a task
//! that has not started yet. It never waits for a task that is already
//! running.
//!
//! `ThreadScheduler` is the bundled implementation: one background thread
//! sleeping on a condvar until the earliest due task. One scheduler can serve
//! any number of stores.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{error, trace};

use crate::error::{StoreError, StoreResult};

/// Due time used when `now + delay` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Executes tasks after a delay.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, task: Task, delay: Duration) -> TaskHandle;
}

/// Cancellation handle for a scheduled task.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prevent the task from running if it has not started yet.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct Scheduled {
    due: Instant,
    seq: u64,
    handle: TaskHandle,
    task: Task,
}

// BinaryHeap is a max-heap; invert so the earliest (due, seq) pops first.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.due.cmp(&self.due).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
    executed: AtomicU64,
}

/// A scheduler backed by one dedicated thread.
pub struct ThreadScheduler {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ThreadScheduler {
    /// Spawn the worker thread.
    pub fn new(name: &str) -> StoreResult<Self> {
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(worker_shared))
            .map_err(|e| StoreError::Io {
                path: None,
                kind: e.kind(),
                message: format!("Failed to spawn scheduler thread: {}", e),
            })?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Tasks queued and not cancelled.
    pub fn pending(&self) -> usize {
        let queue = self.shared.queue.lock();
        queue.heap.iter().filter(|s| !s.handle.is_cancelled()).count()
    }

    /// Tasks run to completion (or panicked) since start.
    pub fn executed(&self) -> u64 {
        self.shared.executed.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Stop the worker and wait for it. Pending tasks are discarded.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            queue.heap.clear();
        }
        self.shared.wakeup.notify_all();

        if let Some(handle) = self.thread.lock().take() {
            // The last owner may be dropped from inside one of our own tasks.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, task: Task, delay: Duration) -> TaskHandle {
        let handle = TaskHandle::new();
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                handle.cancel();
                return handle;
            }
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.heap.push(Scheduled {
                due: due_after(delay),
                seq,
                handle: handle.clone(),
                task,
            });
        }
        self.shared.wakeup.notify_one();
        handle
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A scheduler that runs tasks only when `run_pending` is called.
///
/// Delays are recorded but not honoured; the caller decides when time has
/// passed. Useful for single-threaded embedding and deterministic tests.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<Vec<(Duration, TaskHandle, Task)>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks queued and not cancelled.
    pub fn pending(&self) -> usize {
        self.queue.lock().iter().filter(|(_, h, _)| !h.is_cancelled()).count()
    }

    /// Delay requested by the most recent live task.
    pub fn last_delay(&self) -> Option<Duration> {
        self.queue
            .lock()
            .iter()
            .rev()
            .find(|(_, h, _)| !h.is_cancelled())
            .map(|(d, _, _)| *d)
    }

    /// Run every task that is queued and not cancelled. Returns how many ran.
    ///
    /// Tasks scheduled while this runs stay queued for the next call.
    pub fn run_pending(&self) -> usize {
        let due = std::mem::take(&mut *self.queue.lock());
        let mut ran = 0;
        for (_, handle, task) in due {
            if !handle.is_cancelled() {
                task();
                ran += 1;
            }
        }
        ran
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, task: Task, delay: Duration) -> TaskHandle {
        let handle = TaskHandle::new();
        self.queue.lock().push((delay, handle.clone(), task));
        handle
    }
}

fn due_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

fn worker_loop(shared: Arc<Shared>) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            return;
        }

        let next = queue.heap.peek().map(|n| (n.due, n.handle.is_cancelled()));
        let Some((due, cancelled)) = next else {
            shared.wakeup.wait(&mut queue);
            continue;
        };

        if cancelled {
            queue.heap.pop();
            continue;
        }
        if due > Instant::now() {
            shared.wakeup.wait_until(&mut queue, due);
            continue;
        }

        if let Some(job) = queue.heap.pop() {
            MutexGuard::unlocked(&mut queue, || run(&shared, job));
        }
    }
}

fn run(shared: &Shared, job: Scheduled) {
    if job.handle.is_cancelled() {
        return;
    }
    trace!(seq = job.seq, "Running scheduled task");
    if panic::catch_unwind(AssertUnwindSafe(job.task)).is_err() {
        error!(seq = job.seq, "Scheduled task panicked");
    }
    shared.executed.fetch_add(1, Ordering::Relaxed);
}
