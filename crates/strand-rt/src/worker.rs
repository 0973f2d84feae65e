// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Workers: OS threads that run tasks through the trampoline.
//!
//! The trampoline resumes the top frame of a task over and over, acting on
//! each [`StepResult`], until the task suspends or its root frame finishes.
//! Frames never call each other on the native stack.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::error::{invariant_violation, Error};
use crate::frame::StepResult;
use crate::scheduler::Shared;
use crate::task::{TaskRef, TaskState};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(usize);

impl WorkerId {
    /// The thread that called [`crate::Scheduler::run_until_empty`].
    pub const EMBEDDED: WorkerId = WorkerId(usize::MAX);

    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::EMBEDDED {
            f.write_str("embedded")
        } else {
            write!(f, "worker-{}", self.0)
        }
    }
}

/// Wakeup flag a bound worker sleeps on.
#[derive(Default)]
pub(crate) struct Signal {
    pending: Mutex<bool>,
    cvar: Condvar,
}

impl Signal {
    pub(crate) fn notify(&self) {
        *self.pending.lock() = true;
        self.cvar.notify_one();
    }

    /// Sleep until notified or `timeout` passes. Consumes the notification.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cvar.wait_for(&mut pending, timeout);
        }
        std::mem::replace(&mut *pending, false)
    }
}

enum Exit {
    Suspended,
    Finished(Result<Value, Error>),
}

fn trampoline(task: &TaskRef) -> Exit {
    loop {
        let Some((frame, value, error)) = task.next_step() else {
            invariant_violation(&format!("running task {} has no frames", task.id()));
        };
        match frame.resume(task, value, error) {
            StepResult::Done(v) => {
                if let Some(result) = task.complete_frame(&frame, Ok(v)) {
                    return Exit::Finished(result);
                }
            }
            StepResult::Throw(e) => {
                if let Some(result) = task.complete_frame(&frame, Err(e)) {
                    return Exit::Finished(result);
                }
            }
            StepResult::Suspended => return Exit::Suspended,
            StepResult::Jump { target, value } => task.jump(&frame, &target, value),
        }
    }
}

pub struct Worker {
    id: WorkerId,
    shared: Arc<Shared>,
}

impl Worker {
    pub(crate) fn new(id: WorkerId, shared: Arc<Shared>) -> Self {
        Self { id, shared }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Run ready tasks until the ready queue is empty. Returns how many
    /// task runs happened.
    pub fn run_until_empty(&self) -> usize {
        let mut runs = 0;
        while let Some(task) = self.shared.ready.get() {
            self.run_task(task);
            runs += 1;
        }
        runs
    }

    /// Pull from the shared ready queue until shutdown, sleeping while idle.
    pub(crate) fn run_blocking(&self) {
        debug!(worker.id = %self.id, "worker started");
        loop {
            self.run_until_empty();

            if self.shared.is_shut_down() {
                break;
            }

            let (lock, cvar) = &self.shared.work_available;
            let mut available = lock.lock();
            if !self.shared.ready.is_empty() {
                continue;
            }
            if self.shared.is_shut_down() {
                break;
            }
            // Timed, so a missed notification only costs one idle period.
            cvar.wait_for(&mut available, self.shared.config().idle_timeout);
            *available = false;
        }
        debug!(worker.id = %self.id, "worker stopped");
    }

    /// Drive one bound task on this thread until it finishes.
    pub(crate) fn run_bound(&self, task: TaskRef) {
        let Some(signal) = task.signal().cloned() else {
            invariant_violation(&format!("task {} is not bound to a worker", task.id()));
        };
        debug!(worker.id = %self.id, task.id = %task.id(), "bound worker started");
        loop {
            match task.state() {
                TaskState::Ready => self.run_task(task.clone()),
                TaskState::Done | TaskState::Failed => break,
                _ => {
                    if self.shared.is_shut_down() {
                        break;
                    }
                    signal.wait(self.shared.config().idle_timeout);
                }
            }
        }
        debug!(worker.id = %self.id, task.id = %task.id(), "bound worker stopped");
    }

    fn run_task(&self, task: TaskRef) {
        task.bind(self.id);
        trace!(worker.id = %self.id, task.id = %task.id(), "running task");
        let exit = trampoline(&task);
        // Unbind first: once parked, another worker may pick the task up.
        task.unbind();
        match exit {
            Exit::Suspended => task.park(),
            Exit::Finished(result) => task.finalize(result),
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker").field("id", &self.id).finish()
    }
}
