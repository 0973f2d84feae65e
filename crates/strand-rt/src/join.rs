// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task completion and joining.
//!
//! A finished task keeps its [`Outcome`]. OS threads block on it with
//! [`Task::join`]; tasks wait for each other through [`wait_for`], which
//! parks the caller instead of blocking its worker.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::deadlock;
use crate::error::{DeadlockError, Error, UncaughtError};
use crate::frame::{Frame, FrameRef, StepResult};
use crate::task::{Task, TaskRef, WaitTarget};
use crate::value::Value;

/// How a task ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    Done(Value),
    Failed(UncaughtError),
}

impl Outcome {
    pub fn is_done(&self) -> bool {
        matches!(self, Outcome::Done(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Outcome::Done(v) => Some(v),
            Outcome::Failed(_) => None,
        }
    }

    pub fn into_result(self) -> Result<Value, UncaughtError> {
        match self {
            Outcome::Done(v) => Ok(v),
            Outcome::Failed(e) => Err(e),
        }
    }
}

pub(crate) struct Completion {
    state: Mutex<CompletionState>,
    finished: Condvar,
}

#[derive(Default)]
struct CompletionState {
    outcome: Option<Outcome>,
    waiters: Vec<TaskRef>,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(CompletionState::default()),
            finished: Condvar::new(),
        }
    }

    pub(crate) fn outcome(&self) -> Option<Outcome> {
        self.state.lock().outcome.clone()
    }

    /// Store the outcome, wake blocked threads and hand back the waiting
    /// tasks for the caller to ready.
    pub(crate) fn complete(&self, outcome: Outcome) -> Vec<TaskRef> {
        let mut state = self.state.lock();
        state.outcome = Some(outcome);
        self.finished.notify_all();
        std::mem::take(&mut state.waiters)
    }

    /// Register `waiter`, or return the outcome if it is already there.
    pub(crate) fn register(&self, waiter: TaskRef) -> Result<(), Outcome> {
        let mut state = self.state.lock();
        match &state.outcome {
            Some(outcome) => Err(outcome.clone()),
            None => {
                state.waiters.push(waiter);
                Ok(())
            }
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> Option<Outcome> {
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return Some(outcome.clone());
            }
            match timeout {
                None => self.finished.wait(&mut state),
                Some(t) => {
                    if self.finished.wait_for(&mut state, t).timed_out() {
                        return state.outcome.clone();
                    }
                }
            }
        }
    }
}

impl Task {
    /// The outcome, once the task has finished.
    pub fn outcome(&self) -> Option<Outcome> {
        self.completion.outcome()
    }

    /// Block the calling OS thread until the task finishes.
    ///
    /// Never call this from task code: it holds the worker hostage. Tasks
    /// use [`wait_for`] or [`join_frame`].
    pub fn join(&self) -> Outcome {
        match self.completion.wait(None) {
            Some(outcome) => outcome,
            None => crate::error::invariant_violation("untimed join returned without an outcome"),
        }
    }

    pub fn join_timeout(&self, timeout: Duration) -> Option<Outcome> {
        self.completion.wait(Some(timeout))
    }
}

/// Wait for `child` from inside `task`.
///
/// `Ok(Some(_))` means the child had already finished. `Ok(None)` means
/// `task` is registered as a waiter and the frame must return `Suspended`;
/// the child's completion readies it. A join that closes a wait cycle
/// (including joining yourself) fails instead.
pub fn wait_for(task: &TaskRef, child: &TaskRef) -> Result<Option<Outcome>, DeadlockError> {
    if let Some(outcome) = child.outcome() {
        return Ok(Some(outcome));
    }
    let target = WaitTarget::Task(child.clone());
    {
        let shared = task.shared();
        let _graph = shared.wait_graph();
        deadlock::check(task, &target)?;
        task.set_waiting_for(Some(target));
    }
    match child.completion.register(task.clone()) {
        Ok(()) => Ok(None),
        Err(outcome) => {
            task.set_waiting_for(None);
            Ok(Some(outcome))
        }
    }
}

fn outcome_step(outcome: Outcome) -> StepResult {
    match outcome {
        Outcome::Done(v) => StepResult::Done(v),
        Outcome::Failed(e) => StepResult::Throw(e.error),
    }
}

/// A frame that finishes with `child`'s value, or rethrows its error.
pub fn join_frame(child: TaskRef) -> FrameRef {
    let parked = Mutex::new(false);
    Frame::labeled("join", move |cx, _value, error| {
        if let Some(e) = error {
            return StepResult::Throw(e);
        }
        let mut parked = parked.lock();
        if *parked {
            return match child.outcome() {
                Some(outcome) => outcome_step(outcome),
                None => crate::error::invariant_violation("join resumed before the child finished"),
            };
        }
        match wait_for(cx.task(), &child) {
            Ok(Some(outcome)) => outcome_step(outcome),
            Ok(None) => {
                *parked = true;
                StepResult::Suspended
            }
            Err(deadlock) => StepResult::Throw(Error::Deadlock(deadlock)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::scheduler::Scheduler;
    use crate::task::TaskState;

    fn manual() -> Scheduler {
        Scheduler::new(SchedulerConfig::manual()).unwrap()
    }

    #[test]
    fn join_returns_value() {
        let sched = manual();
        let task = sched
            .run(Frame::alloc(|_, _, _| StepResult::Done(Value::new(41u32))))
            .unwrap();
        assert!(task.outcome().is_none());
        sched.run_until_empty();
        let outcome = task.join();
        assert!(outcome.is_done());
        assert_eq!(outcome.value().unwrap().downcast_ref::<u32>(), Some(&41));
    }

    #[test]
    fn failed_task_reports_uncaught_error() {
        let sched = manual();
        let task = sched
            .run(Frame::alloc(|_, _, _| {
                StepResult::Throw(Error::thrown("boom"))
            }))
            .unwrap();
        sched.run_until_empty();
        assert_eq!(task.state(), TaskState::Failed);
        let err = task.join().into_result().unwrap_err();
        assert_eq!(err.task, task.id());
        assert!(matches!(err.error, Error::Thrown(_)));
    }

    #[test]
    fn join_timeout_expires() {
        let sched = manual();
        let task = sched
            .spawn(Frame::alloc(|_, v, e| StepResult::forward(v, e)))
            .unwrap();
        assert!(task.join_timeout(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn parent_waits_for_child() {
        let sched = manual();
        let child = sched
            .spawn(Frame::alloc(|_, _, _| StepResult::Done(Value::new("child"))))
            .unwrap();
        let parent = sched.run(join_frame(child.clone())).unwrap();

        // Parent runs first and parks on the child.
        sched.run_until_empty();
        assert_eq!(parent.state(), TaskState::Waiting);
        assert!(matches!(parent.waiting_for(), Some(WaitTarget::Task(_))));

        child.start();
        sched.run_until_empty();
        assert_eq!(child.state(), TaskState::Done);
        let outcome = parent.join();
        assert_eq!(outcome.value().unwrap().downcast_ref::<&str>(), Some(&"child"));
    }

    #[test]
    fn joining_yourself_is_a_deadlock() {
        let sched = manual();
        let slot: std::sync::Arc<Mutex<Option<TaskRef>>> = Default::default();
        let me = slot.clone();
        let task = sched
            .spawn(Frame::alloc(move |cx, _, _| {
                let me = me.lock().clone().unwrap();
                match wait_for(cx.task(), &me) {
                    Err(d) => StepResult::Throw(d.into()),
                    Ok(_) => StepResult::Done(Value::unit()),
                }
            }))
            .unwrap();
        *slot.lock() = Some(task.clone());
        task.start();
        sched.run_until_empty();
        let err = task.join().into_result().unwrap_err();
        assert!(matches!(err.error, Error::Deadlock(_)));
        slot.lock().take();
    }
}
