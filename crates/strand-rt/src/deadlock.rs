// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Wait-graph cycle detection.
//!
//! Edges: a task waiting on a resource points at the resource's owner; a
//! task joining another points at that task. Before a task blocks, the
//! chain starting at what it is about to wait for is walked; reaching the
//! requester again means blocking would never end.
//!
//! Callers hold the scheduler's wait-graph lock while checking and while
//! publishing their own edge, so of two tasks closing a cycle at the same
//! time exactly one sees it. The walk is still bounded by the number of
//! live tasks.

use std::sync::Arc;

use tracing::debug;

use crate::error::DeadlockError;
use crate::resource::ExclusiveResource;
use crate::scheduler::Shared;
use crate::task::{TaskId, TaskRef, WaitTarget};

/// The task `target` is currently waiting on, if any.
fn blocker(shared: &Shared, target: &WaitTarget) -> Option<TaskRef> {
    match target {
        WaitTarget::Resource(resource) => resource.owner().and_then(|id| shared.lookup(id)),
        WaitTarget::Task(task) if !task.is_finished() => Some(task.clone()),
        WaitTarget::Task(_) | WaitTarget::External => None,
    }
}

/// Follow wait edges from `target`. Returns the cycle, starting and ending
/// with `requester`, when the walk leads back to it.
pub fn find_cycle(requester: &TaskRef, target: &WaitTarget) -> Option<Vec<TaskId>> {
    let shared = requester.shared();
    let limit = shared.live_tasks() + 1;
    let mut path = vec![requester.id()];
    let mut current = blocker(shared, target)?;
    for _ in 0..limit {
        path.push(current.id());
        if Arc::ptr_eq(&current, requester) {
            return Some(path);
        }
        let next = current.waiting_for()?;
        current = blocker(shared, &next)?;
    }
    None
}

/// Whether `task` blocking on `resource` would close a cycle.
pub fn would_deadlock(task: &TaskRef, resource: &ExclusiveResource) -> bool {
    find_cycle(task, &WaitTarget::Resource(resource.clone())).is_some()
}

/// Fail with the cycle if blocking on `target` would deadlock. Skipped when
/// detection is turned off in the scheduler config.
pub(crate) fn check(requester: &TaskRef, target: &WaitTarget) -> Result<(), DeadlockError> {
    if !requester.shared().config().deadlock_detection {
        return Ok(());
    }
    match find_cycle(requester, target) {
        None => Ok(()),
        Some(path) => {
            let err = DeadlockError {
                requester: requester.id(),
                path,
            };
            debug!(task.id = %requester.id(), %err, "refusing to block");
            Err(err)
        }
    }
}
