// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scoped acquisition: acquire, run a body, always release.
//!
//! [`acquire`] builds a guard frame. It claims the resource (parking the
//! task while someone else holds it), runs the body as its callee, and
//! releases when the body comes back, whether with a value, an error, or
//! the `Cancelled` error an unwind delivers.

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{invariant_violation, Error};
use crate::frame::{Cx, Frame, FrameRef, Resume, StepResult};
use crate::resource::{Acquire, ExclusiveResource};
use crate::value::Value;

enum Phase {
    Start(FrameRef),
    /// Parked on the wait queue, holding the value meant for the body.
    Waiting(FrameRef, Value),
    Held,
    Released,
}

struct Guard {
    resource: ExclusiveResource,
    // The body is dropped once called; it links back to the guard.
    phase: Mutex<Phase>,
}

impl Resume for Guard {
    fn resume(&self, cx: &Cx<'_>, value: Value, error: Option<Error>) -> StepResult {
        let mut phase = self.phase.lock();
        match std::mem::replace(&mut *phase, Phase::Released) {
            Phase::Start(body) => {
                if let Some(e) = error {
                    // Cancelled before it ever ran: nothing to let go of.
                    return StepResult::Throw(e);
                }
                match self.resource.acquire_or_block(cx.task()) {
                    Ok(Acquire::Acquired) => {
                        *phase = Phase::Held;
                        drop(phase);
                        cx.call(body, value)
                    }
                    Ok(Acquire::Blocked) => {
                        *phase = Phase::Waiting(body, value);
                        StepResult::Suspended
                    }
                    Err(deadlock) => StepResult::Throw(Error::Deadlock(deadlock)),
                }
            }
            Phase::Waiting(body, stashed) => {
                if error.is_some() {
                    invariant_violation("error delivered to a task parked on a resource");
                }
                if !self.resource.is_owned_by(cx.task()) {
                    invariant_violation("woken without ownership of the awaited resource");
                }
                trace!(resource.id = %self.resource.id(), task.id = %cx.task().id(), "acquired after wait");
                *phase = Phase::Held;
                drop(phase);
                cx.call(body, stashed)
            }
            Phase::Held => {
                drop(phase);
                self.resource.release(cx.task());
                StepResult::forward(value, error)
            }
            Phase::Released => invariant_violation("scoped acquisition resumed after release"),
        }
    }
}

/// A frame that runs `body` while holding `resource`. The body's result
/// becomes the frame's result. A deadlock is thrown as `Error::Deadlock`
/// without running the body.
///
/// Each frame acquires once; build a new one per acquisition.
pub fn acquire(resource: ExclusiveResource, body: FrameRef) -> FrameRef {
    Frame::with_code(
        "scoped-acquire",
        Guard {
            resource,
            phase: Mutex::new(Phase::Start(body)),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::scheduler::Scheduler;
    use crate::task::TaskState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn manual() -> Scheduler {
        Scheduler::new(SchedulerConfig::manual()).unwrap()
    }

    #[test]
    fn body_runs_while_owned_and_resource_is_released() {
        let sched = manual();
        let res = ExclusiveResource::new();
        let owned_inside = Arc::new(AtomicUsize::new(0));
        let seen = owned_inside.clone();
        let check = res.clone();
        let body = Frame::alloc(move |cx, v, e| {
            if check.is_owned_by(cx.task()) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
            StepResult::forward(v, e)
        });
        let task = sched.run(acquire(res.clone(), body)).unwrap();
        sched.run_until_empty();
        assert_eq!(owned_inside.load(Ordering::SeqCst), 1);
        assert_eq!(res.owner(), None);
        assert_eq!(task.state(), TaskState::Done);
    }

    #[test]
    fn release_happens_on_error() {
        let sched = manual();
        let res = ExclusiveResource::new();
        let body = Frame::alloc(|_, _, _| StepResult::Throw(Error::thrown("oops")));
        let task = sched.run(acquire(res.clone(), body)).unwrap();
        sched.run_until_empty();
        assert_eq!(res.owner(), None);
        assert_eq!(task.state(), TaskState::Failed);
    }

    #[test]
    fn second_task_waits_for_first() {
        let sched = manual();
        let res = ExclusiveResource::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        // The first body suspends on an external event while holding.
        let log = order.clone();
        let parked = Arc::new(AtomicUsize::new(0));
        let p = parked.clone();
        let first_body = Frame::alloc(move |cx, v, e| {
            if p.fetch_add(1, Ordering::SeqCst) == 0 {
                log.lock().push("first-in");
                cx.task().wait_external();
                return StepResult::Suspended;
            }
            log.lock().push("first-out");
            StepResult::forward(v, e)
        });
        let log = order.clone();
        let second_body = Frame::alloc(move |_, v, e| {
            log.lock().push("second");
            StepResult::forward(v, e)
        });

        let first = sched.run(acquire(res.clone(), first_body)).unwrap();
        let second = sched.run(acquire(res.clone(), second_body)).unwrap();
        sched.run_until_empty();
        assert_eq!(first.state(), TaskState::Waiting);
        assert_eq!(second.state(), TaskState::Waiting);
        assert_eq!(res.owner(), Some(first.id()));
        assert_eq!(res.waiters(), 1);
        assert_eq!(sched.stats().blocked, 1);

        first.ready();
        sched.run_until_empty();
        assert_eq!(*order.lock(), vec!["first-in", "first-out", "second"]);
        assert_eq!(res.owner(), None);
        assert_eq!(second.state(), TaskState::Done);
    }
}
