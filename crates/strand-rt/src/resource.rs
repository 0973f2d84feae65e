// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Exclusive resources: single-task ownership with a FIFO wait queue.
//!
//! `owner` holds the owning task's id (an integer word) or null. A task
//! that finds the resource taken publishes its wait edge, queues itself,
//! and then retries the claim once, which closes the window where the
//! owner released between the failed claim and the enqueue.
//!
//! Release hands ownership straight to the oldest waiter and readies it;
//! the resource is never observed unowned while someone is queued, except
//! in the short window that the retry covers.
//!
//! Resources are not reentrant. Asking for a resource you already own is
//! reported as a one-task deadlock.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::cell::{AtomicCell, Word};
use crate::deadlock;
use crate::error::{invariant_violation, DeadlockError};
use crate::queue::Queue;
use crate::task::{Task, TaskId, TaskRef, WaitTarget};

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The caller owns the resource now.
    Acquired,
    /// The caller is queued. Return `Suspended`; the task is readied once
    /// ownership has been handed to it.
    Blocked,
}

/// Handle to a shared exclusive resource. Clones refer to the same resource.
#[derive(Clone)]
pub struct ExclusiveResource {
    inner: Arc<ResourceInner>,
}

struct ResourceInner {
    id: ResourceId,
    name: Option<String>,
    owner: AtomicCell<Task>,
    wait_queue: Queue<Task>,
}

fn owner_word(task: &Task) -> Word<Task> {
    Word::Int(task.id().as_u64() as isize)
}

impl ExclusiveResource {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::build(Some(name.into()))
    }

    fn build(name: Option<String>) -> Self {
        Self {
            inner: Arc::new(ResourceInner {
                id: ResourceId(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed)),
                name,
                owner: AtomicCell::null(),
                wait_queue: Queue::new(),
            }),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Whether both handles refer to the same resource.
    pub fn same(&self, other: &ExclusiveResource) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn owner(&self) -> Option<TaskId> {
        match self.inner.owner.load() {
            Word::Int(id) => Some(TaskId::from_raw(id as u64)),
            Word::Ptr(p) if p.is_null() => None,
            Word::Ptr(_) => invariant_violation("resource owner holds a pointer"),
        }
    }

    pub fn is_owned_by(&self, task: &Task) -> bool {
        self.inner.owner.load() == owner_word(task)
    }

    /// Number of queued waiters (approximate under contention).
    pub fn waiters(&self) -> usize {
        self.inner.wait_queue.len()
    }

    /// Claim the resource if it is free. Never blocks or queues.
    pub fn try_acquire(&self, task: &TaskRef) -> bool {
        self.inner
            .owner
            .compare_and_swap(Word::null(), owner_word(task))
            .is_null()
    }

    /// Claim the resource, or queue `task` behind the current owner.
    ///
    /// On `Blocked` the task is already on the wait queue with its wait edge
    /// set; the calling frame must return `Suspended`. A request that would
    /// close a cycle in the wait graph fails instead of blocking.
    pub fn acquire_or_block(&self, task: &TaskRef) -> Result<Acquire, DeadlockError> {
        if self.try_acquire(task) {
            trace!(resource.id = %self.id(), task.id = %task.id(), "acquired");
            return Ok(Acquire::Acquired);
        }

        let target = WaitTarget::Resource(self.clone());
        {
            let shared = task.shared();
            let _graph = shared.wait_graph();
            deadlock::check(task, &target)?;
            task.set_waiting_for(Some(target));
        }
        self.inner.wait_queue.put(task.clone());
        Ok(self.retry_after_enqueue(task))
    }

    /// Second claim attempt by a task that is already queued. The owner may
    /// have released between the failed claim and the enqueue.
    fn retry_after_enqueue(&self, task: &TaskRef) -> Acquire {
        if !self.try_acquire(task) {
            debug!(
                resource.id = %self.id(),
                task.id = %task.id(),
                owner = ?self.owner(),
                "contended, task blocked"
            );
            return Acquire::Blocked;
        }

        // Our retry won. Whoever is first in line gets the resource.
        match self.inner.wait_queue.get() {
            Some(head) if Arc::ptr_eq(&head, task) => {
                task.set_waiting_for(None);
                trace!(resource.id = %self.id(), task.id = %task.id(), "acquired on retry");
                Acquire::Acquired
            }
            Some(head) => {
                self.hand_to(head);
                Acquire::Blocked
            }
            None => invariant_violation("wait queue lost a queued task"),
        }
    }

    /// Give up ownership. The oldest waiter, if any, becomes owner and is
    /// readied. Releasing a resource the task does not own is fatal.
    pub fn release(&self, task: &TaskRef) {
        if !self.is_owned_by(task) {
            invariant_violation(&format!(
                "task {} released resource {} owned by {:?}",
                task.id(),
                self.id(),
                self.owner()
            ));
        }
        loop {
            if let Some(next) = self.inner.wait_queue.get() {
                self.hand_to(next);
                return;
            }
            self.inner.owner.store(Word::null());
            trace!(resource.id = %self.id(), task.id = %task.id(), "released");
            if !self.reclaim(task) {
                return;
            }
        }
    }

    /// After clearing the owner: if someone queued after our `get` and its
    /// own retry has not claimed the resource, take it back so the waiter
    /// can be handed ownership.
    fn reclaim(&self, task: &TaskRef) -> bool {
        if self.inner.wait_queue.is_empty() {
            return false;
        }
        self.inner
            .owner
            .compare_and_swap(Word::null(), owner_word(task))
            .is_null()
    }

    fn hand_to(&self, next: TaskRef) {
        self.inner.owner.store(owner_word(&next));
        debug!(resource.id = %self.id(), task.id = %next.id(), "ownership handed off");
        next.ready();
    }
}

impl Default for ExclusiveResource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExclusiveResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusiveResource")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("owner", &self.owner())
            .field("waiters", &self.waiters())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::frame::{Frame, StepResult};
    use crate::scheduler::Scheduler;
    use crate::task::TaskState;

    fn manual() -> Scheduler {
        Scheduler::new(SchedulerConfig::manual()).unwrap()
    }

    fn idle_task(sched: &Scheduler) -> TaskRef {
        sched
            .spawn(Frame::alloc(|_, v, e| StepResult::forward(v, e)))
            .unwrap()
    }

    #[test]
    fn free_resource_is_acquired_immediately() {
        let sched = manual();
        let task = idle_task(&sched);
        let res = ExclusiveResource::named("counter");
        assert_eq!(res.acquire_or_block(&task), Ok(Acquire::Acquired));
        assert_eq!(res.owner(), Some(task.id()));
        assert!(res.is_owned_by(&task));
        res.release(&task);
        assert_eq!(res.owner(), None);
    }

    #[test]
    fn try_acquire_fails_when_owned() {
        let sched = manual();
        let a = idle_task(&sched);
        let b = idle_task(&sched);
        let res = ExclusiveResource::new();
        assert!(res.try_acquire(&a));
        assert!(!res.try_acquire(&b));
        assert!(!res.try_acquire(&a));
        res.release(&a);
        assert!(res.try_acquire(&b));
    }

    #[test]
    fn reacquiring_own_resource_is_a_deadlock() {
        let sched = manual();
        let task = idle_task(&sched);
        let res = ExclusiveResource::new();
        res.acquire_or_block(&task).unwrap();
        let err = res.acquire_or_block(&task).unwrap_err();
        assert_eq!(err.requester, task.id());
        assert_eq!(err.path, vec![task.id(), task.id()]);
        assert_eq!(res.waiters(), 0);
        assert!(task.waiting_for().is_none());
    }

    #[test]
    fn release_hands_off_to_first_waiter() {
        let sched = manual();
        let owner = idle_task(&sched);
        let waiter = idle_task(&sched);
        let res = ExclusiveResource::new();
        res.acquire_or_block(&owner).unwrap();

        // The waiter must be running to block.
        waiter.start();
        let picked = sched.shared().ready.get().unwrap();
        assert!(Arc::ptr_eq(&picked, &waiter));
        waiter.bind(crate::worker::WorkerId::EMBEDDED);

        assert_eq!(res.acquire_or_block(&waiter), Ok(Acquire::Blocked));
        assert_eq!(res.waiters(), 1);
        assert!(matches!(waiter.waiting_for(), Some(WaitTarget::Resource(_))));
        waiter.unbind();
        waiter.park();
        assert_eq!(waiter.state(), TaskState::Waiting);

        res.release(&owner);
        assert_eq!(res.owner(), Some(waiter.id()));
        assert_eq!(waiter.state(), TaskState::Ready);
        assert!(waiter.waiting_for().is_none());
        assert_eq!(res.waiters(), 0);
    }

    /// A started task parked on `res` and sitting in its wait queue, as if
    /// its `acquire_or_block` had blocked.
    fn parked_waiter(sched: &Scheduler, res: &ExclusiveResource) -> TaskRef {
        let task = idle_task(sched);
        task.start();
        let picked = sched.shared().ready.get().unwrap();
        assert!(Arc::ptr_eq(&picked, &task));
        task.bind(crate::worker::WorkerId::EMBEDDED);
        task.set_waiting_for(Some(WaitTarget::Resource(res.clone())));
        task.unbind();
        task.park();
        res.inner.wait_queue.put(task.clone());
        task
    }

    #[test]
    fn retry_wins_when_first_in_line() {
        let sched = manual();
        let task = idle_task(&sched);
        let res = ExclusiveResource::new();
        // Queued, and the owner released before the retry.
        task.set_waiting_for(Some(WaitTarget::Resource(res.clone())));
        res.inner.wait_queue.put(task.clone());

        assert_eq!(res.retry_after_enqueue(&task), Acquire::Acquired);
        assert_eq!(res.owner(), Some(task.id()));
        assert_eq!(res.waiters(), 0);
        assert!(task.waiting_for().is_none());
    }

    #[test]
    fn retry_winner_hands_off_to_earlier_waiter() {
        let sched = manual();
        let res = ExclusiveResource::new();
        let earlier = parked_waiter(&sched, &res);
        let late = idle_task(&sched);
        late.set_waiting_for(Some(WaitTarget::Resource(res.clone())));
        res.inner.wait_queue.put(late.clone());

        assert_eq!(res.retry_after_enqueue(&late), Acquire::Blocked);
        assert_eq!(res.owner(), Some(earlier.id()));
        assert_eq!(earlier.state(), TaskState::Ready);
        assert!(earlier.waiting_for().is_none());
        assert_eq!(res.waiters(), 1);
        assert!(Arc::ptr_eq(&res.inner.wait_queue.peek().unwrap(), &late));
        assert!(matches!(late.waiting_for(), Some(WaitTarget::Resource(_))));
    }

    #[test]
    fn retry_loses_while_owner_holds() {
        let sched = manual();
        let owner = idle_task(&sched);
        let task = idle_task(&sched);
        let res = ExclusiveResource::new();
        assert!(res.try_acquire(&owner));
        res.inner.wait_queue.put(task.clone());

        assert_eq!(res.retry_after_enqueue(&task), Acquire::Blocked);
        assert_eq!(res.owner(), Some(owner.id()));
        assert_eq!(res.waiters(), 1);
    }

    #[test]
    fn release_takes_back_for_late_waiter() {
        let sched = manual();
        let owner = idle_task(&sched);
        let res = ExclusiveResource::new();
        assert!(res.try_acquire(&owner));
        // Owner cleared, then a waiter queued whose retry lost the race.
        res.inner.owner.store(Word::null());
        let waiter = parked_waiter(&sched, &res);

        assert!(res.reclaim(&owner));
        assert_eq!(res.owner(), Some(owner.id()));
        assert_eq!(res.waiters(), 1);

        // The next turn of the release loop hands it over.
        res.release(&owner);
        assert_eq!(res.owner(), Some(waiter.id()));
        assert_eq!(waiter.state(), TaskState::Ready);
        assert_eq!(res.waiters(), 0);
    }

    #[test]
    fn release_leaves_resource_to_waiter_that_claimed_it() {
        let sched = manual();
        let owner = idle_task(&sched);
        let waiter = idle_task(&sched);
        let res = ExclusiveResource::new();
        // The late waiter's own retry already took the resource.
        res.inner.wait_queue.put(waiter.clone());
        assert!(res.try_acquire(&waiter));

        assert!(!res.reclaim(&owner));
        assert_eq!(res.owner(), Some(waiter.id()));
        assert_eq!(res.waiters(), 1);
    }

    #[test]
    fn release_with_no_waiters_stays_free() {
        let sched = manual();
        let owner = idle_task(&sched);
        let res = ExclusiveResource::new();
        assert!(!res.reclaim(&owner));
        assert_eq!(res.owner(), None);
    }

    #[test]
    fn tasks_of_different_schedulers_are_distinct_owners() {
        let first = manual();
        let second = manual();
        let a = idle_task(&first);
        let b = idle_task(&second);
        assert_ne!(a.id(), b.id());

        let res = ExclusiveResource::new();
        let payload = crate::actor::Exclusive::with_resource(res.clone(), 1u32);
        assert!(res.try_acquire(&a));
        assert!(!res.is_owned_by(&b));
        assert!(!res.try_acquire(&b));
        assert_eq!(payload.with(&b, |v| *v), None);
        assert_eq!(payload.with(&a, |v| *v), Some(1));
        assert!(!crate::deadlock::would_deadlock(&b, &res));

        res.release(&a);
        assert_eq!(res.owner(), None);
    }

    #[test]
    #[should_panic(expected = "released resource")]
    fn foreign_scheduler_task_cannot_release() {
        let first = manual();
        let second = manual();
        let a = idle_task(&first);
        let b = idle_task(&second);
        let res = ExclusiveResource::new();
        assert!(res.try_acquire(&a));
        res.release(&b);
    }

    #[test]
    #[should_panic(expected = "released resource")]
    fn releasing_unowned_resource_is_fatal() {
        let sched = manual();
        let task = idle_task(&sched);
        ExclusiveResource::new().release(&task);
    }
}
