use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;

/// A unit of work scheduled on a queue's executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Ordered task execution surface owned by a queue.
///
/// Everything that writes to a consumer's wire connection on behalf of a
/// queue (large-message continuations, forced-delivery probes, browser runs)
/// goes through this, so tasks for one queue never interleave.
pub trait QueueExecutor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Production executor: a dedicated thread draining a channel in FIFO order.
pub struct SerialExecutor {
    sender: Option<crossbeam_channel::Sender<Task>>,
    worker: Option<JoinHandle<()>>,
}

impl SerialExecutor {
    pub fn new(name: &str) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
        let thread_name = format!("queue-executor-{name}");
        let worker = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                for task in receiver {
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        tracing::error!("queue executor task panicked");
                    }
                }
            })
            .expect("spawn queue executor thread");
        Self {
            sender: Some(sender),
            worker: Some(worker),
        }
    }
}

impl QueueExecutor for SerialExecutor {
    fn execute(&self, task: Task) {
        if let Some(sender) = &self.sender {
            if sender.send(task).is_err() {
                tracing::warn!("queue executor is shut down, dropping task");
            }
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Deterministic executor for tests and simulation: tasks queue up until the
/// caller drains them explicitly.
#[derive(Default)]
pub struct ManualExecutor {
    tasks: Mutex<VecDeque<Task>>,
}

impl ManualExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Run the next queued task, if any.
    pub fn run_next(&self) -> bool {
        let task = self.tasks.lock().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Run every task queued at the time of the call. Tasks enqueued by the
    /// tasks themselves stay queued for the next round, so self-rescheduling
    /// work cannot spin this forever.
    pub fn run_pending(&self) -> usize {
        let batch = self.pending();
        let mut ran = 0;
        while ran < batch && self.run_next() {
            ran += 1;
        }
        ran
    }
}

impl QueueExecutor for ManualExecutor {
    fn execute(&self, task: Task) {
        self.tasks.lock().push_back(task);
    }
}
