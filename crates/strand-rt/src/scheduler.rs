// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler: shared ready queue, counters and worker threads.
//!
//! N blocking workers pull from one ready queue. Tasks bound to their own
//! thread bypass the queue. With zero workers the embedding thread drives
//! [`Scheduler::run_until_empty`] itself.
//!
//! The scheduler is quiescent when nothing is runnable and nothing waits on
//! an external event. Tasks blocked on resources or joins that nobody will
//! ever release do not keep it alive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};

use crate::cell::AtomicCell;
use crate::config::SchedulerConfig;
use crate::error::{invariant_violation, Result, RuntimeError};
use crate::frame::FrameRef;
use crate::queue::Queue;
use crate::registry::Registry;
use crate::task::{Task, TaskId, TaskRef, TaskState, WaitTarget};
use crate::worker::{Signal, Worker, WorkerId};

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    /// Spawned and not yet finished.
    pub tasks: usize,
    /// Ready or Running.
    pub runnable: usize,
    pub waiting_external: usize,
    /// Waiting on a resource or another task.
    pub blocked: usize,
    pub ready_queue: usize,
}

impl Stats {
    pub fn is_quiescent(&self) -> bool {
        self.runnable == 0 && self.waiting_external == 0
    }
}

/// State shared by workers, tasks and the embedding thread.
pub(crate) struct Shared {
    pub(crate) ready: Queue<Task>,
    tasks: AtomicCell<()>,
    runnable: AtomicCell<()>,
    waiting_external: AtomicCell<()>,
    /// Id -> task, for resolving resource owners.
    table: RwLock<HashMap<TaskId, Weak<Task>>>,
    /// Held while checking for deadlock and publishing a wait edge.
    wait_graph: Mutex<()>,
    pub(crate) work_available: (Mutex<bool>, Condvar),
    quiescent: (Mutex<()>, Condvar),
    shutdown: AtomicBool,
    config: SchedulerConfig,
    registry: Arc<Registry>,
}

fn count(cell: &AtomicCell<()>) -> usize {
    cell.load().as_int().unwrap_or(0).max(0) as usize
}

impl Shared {
    fn new(config: SchedulerConfig, registry: Arc<Registry>) -> Self {
        Self {
            ready: Queue::new(),
            tasks: AtomicCell::int(0),
            runnable: AtomicCell::int(0),
            waiting_external: AtomicCell::int(0),
            table: RwLock::new(HashMap::new()),
            wait_graph: Mutex::new(()),
            work_available: (Mutex::new(false), Condvar::new()),
            quiescent: (Mutex::new(()), Condvar::new()),
            shutdown: AtomicBool::new(false),
            config,
            registry,
        }
    }

    pub(crate) fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn wait_graph(&self) -> MutexGuard<'_, ()> {
        self.wait_graph.lock()
    }

    pub(crate) fn lookup(&self, id: TaskId) -> Option<TaskRef> {
        self.table.read().get(&id).and_then(Weak::upgrade)
    }

    pub(crate) fn live_tasks(&self) -> usize {
        count(&self.tasks)
    }

    /// Hand a Ready task to whoever runs it.
    pub(crate) fn schedule(&self, task: TaskRef) {
        if let Some(signal) = task.signal() {
            signal.notify();
            return;
        }
        self.ready.put(task);
        let (lock, cvar) = &self.work_available;
        *lock.lock() = true;
        cvar.notify_one();
    }

    pub(crate) fn runnable_add(&self, delta: isize) {
        Self::adjust(&self.runnable, delta, "runnable");
        if delta < 0 {
            self.notify_if_quiescent();
        }
    }

    pub(crate) fn external_add(&self, delta: isize) {
        Self::adjust(&self.waiting_external, delta, "waiting_external");
        if delta < 0 {
            self.notify_if_quiescent();
        }
    }

    fn adjust(cell: &AtomicCell<()>, delta: isize, name: &str) {
        let prev = cell.fetch_add(delta);
        if prev + delta < 0 {
            invariant_violation(&format!("{} counter went negative", name));
        }
    }

    fn is_quiescent(&self) -> bool {
        count(&self.runnable) == 0 && count(&self.waiting_external) == 0
    }

    fn notify_if_quiescent(&self) {
        if self.is_quiescent() {
            let (lock, cvar) = &self.quiescent;
            let _guard = lock.lock();
            cvar.notify_all();
        }
    }

    fn register(&self, task: &TaskRef) {
        self.table.write().insert(task.id(), Arc::downgrade(task));
        self.tasks.fetch_add(1);
    }

    /// A finished task leaves the books.
    pub(crate) fn retire(&self, id: TaskId) {
        self.table.write().remove(&id);
        Self::adjust(&self.tasks, -1, "tasks");
        self.runnable_add(-1);
    }

    fn stats(&self) -> Stats {
        let blocked = self
            .table
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|t| {
                t.state() == TaskState::Waiting
                    && !matches!(t.waiting_for(), Some(WaitTarget::External))
            })
            .count();
        Stats {
            tasks: count(&self.tasks),
            runnable: count(&self.runnable),
            waiting_external: count(&self.waiting_external),
            blocked,
            ready_queue: self.ready.len(),
        }
    }
}

/// Scheduler runtime. Dropping it shuts it down.
pub struct Scheduler {
    /// Worker and bound-worker handles for join-on-shutdown.
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    shared: Arc<Shared>,
    worker_count: usize,
    next_worker: AtomicUsize,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        Self::with_registry(config, Registry::init())
    }

    pub fn with_registry(config: SchedulerConfig, registry: Arc<Registry>) -> Result<Self> {
        config.validate()?;
        let worker_count = config.resolved_worker_threads();
        let shared = Arc::new(Shared::new(config, registry));
        let sched = Self {
            workers: Mutex::new(Vec::with_capacity(worker_count)),
            shared,
            worker_count,
            next_worker: AtomicUsize::new(worker_count),
        };

        for index in 0..worker_count {
            let worker = Worker::new(WorkerId::new(index), sched.shared.clone());
            // On failure `sched` is dropped, which stops the workers
            // started so far.
            let handle = sched.spawn_thread(index, move || worker.run_blocking())?;
            sched.workers.lock().push(handle);
        }

        debug!(workers = worker_count, "scheduler started");
        Ok(sched)
    }

    fn spawn_thread<F>(&self, index: usize, body: F) -> Result<thread::JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        let config = self.shared.config();
        let mut builder =
            thread::Builder::new().name(format!("{}-{}", config.thread_name_prefix, index));
        if let Some(size) = config.stack_size {
            builder = builder.stack_size(size);
        }
        Ok(builder.spawn(body)?)
    }

    pub fn config(&self) -> &SchedulerConfig {
        self.shared.config()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.shared.registry()
    }

    /// Number of background (shared-queue) workers.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Create a task in `Init` that will begin at `entry`.
    pub fn spawn(&self, entry: FrameRef) -> Result<TaskRef> {
        if self.is_shut_down() {
            return Err(RuntimeError::ShutDown);
        }
        let task = Task::new(self.shared.clone(), TaskId::next(), entry, None);
        self.shared.register(&task);
        debug!(task.id = %task.id(), "task spawned");
        Ok(task)
    }

    /// Init -> Ready.
    pub fn start(&self, task: &TaskRef) {
        task.start();
    }

    /// Spawn and start.
    pub fn run(&self, entry: FrameRef) -> Result<TaskRef> {
        let task = self.spawn(entry)?;
        task.start();
        Ok(task)
    }

    /// Spawn and start a task on a dedicated thread. The thread sleeps on
    /// the task's own signal whenever the task is not ready.
    pub fn spawn_bound(&self, entry: FrameRef) -> Result<TaskRef> {
        if self.is_shut_down() {
            return Err(RuntimeError::ShutDown);
        }
        let signal = Arc::new(Signal::default());
        let task = Task::new(
            self.shared.clone(),
            TaskId::next(),
            entry,
            Some(signal),
        );
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let worker = Worker::new(WorkerId::new(index), self.shared.clone());
        let bound = task.clone();
        let handle = self.spawn_thread(index, move || worker.run_bound(bound))?;
        self.workers.lock().push(handle);

        self.shared.register(&task);
        debug!(task.id = %task.id(), worker.index = index, "bound task spawned");
        task.start();
        Ok(task)
    }

    /// A worker that runs on the calling thread.
    pub fn embedded_worker(&self) -> Worker {
        Worker::new(WorkerId::EMBEDDED, self.shared.clone())
    }

    /// Run ready tasks on the calling thread until the ready queue is empty.
    pub fn run_until_empty(&self) -> usize {
        self.embedded_worker().run_until_empty()
    }

    pub fn stats(&self) -> Stats {
        self.shared.stats()
    }

    /// Block until nothing is runnable and nothing waits on an external
    /// event. Without background workers, the calling thread runs tasks.
    pub fn wait_quiescent(&self) {
        let (lock, cvar) = &self.shared.quiescent;
        loop {
            if self.worker_count == 0 {
                self.run_until_empty();
            }
            if self.shared.is_quiescent() {
                return;
            }
            let mut guard = lock.lock();
            if self.shared.is_quiescent() {
                return;
            }
            cvar.wait_for(&mut guard, self.shared.config().idle_timeout);
        }
    }

    /// Wait for quiescence, then stop and join every worker thread.
    pub fn shutdown(&self) {
        self.wait_quiescent();

        let stats = self.stats();
        if stats.tasks > 0 {
            warn!(
                tasks = stats.tasks,
                blocked = stats.blocked,
                "shutting down with unfinished tasks"
            );
        }
        self.stop_workers();

        // Anything readied after quiescence never runs.
        let mut dropped = 0;
        while self.shared.ready.get().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, "discarded ready tasks at shutdown");
        }
        debug!("scheduler stopped");
    }

    fn stop_workers(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        {
            let (lock, cvar) = &self.shared.work_available;
            *lock.lock() = true;
            cvar.notify_all();
        }
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.is_shut_down() {
            return;
        }
        if thread::panicking() {
            // Tasks may be stuck mid-run; do not wait for them.
            self.stop_workers();
        } else {
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.worker_count)
            .field("stats", &self.stats())
            .finish()
    }
}
