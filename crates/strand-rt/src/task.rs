// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tasks and their state machine.
//!
//! ```text
//! Init --start--> Ready --pick up--> Running --Done-------> Done
//!                   ^                   |  \---uncaught---> Failed
//!                   |                   |---Suspended-----> Waiting
//!                   +------ready--------+---yield---------> Ready
//! ```
//!
//! The state lives in one atomic byte. The low bits hold the [`TaskState`];
//! bit 3 records a wakeup that arrived while the task was still Running
//! (it had published itself on a wait queue but its worker had not parked
//! it yet). Parking consumes that bit and goes back to Ready instead of
//! Waiting, so no wakeup is lost.
//!
//! Only the worker bound to a Running task touches its frame chain. Every
//! other party changes a task through [`Task::ready`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{invariant_violation, Error, IllegalTransition, UncaughtError};
use crate::frame::{FrameRef, StepResult};
use crate::join::{Completion, Outcome};
use crate::queue::{Linked, QueueNode};
use crate::registry::Registry;
use crate::resource::ExclusiveResource;
use crate::scheduler::Shared;
use crate::value::Value;
use crate::worker::{Signal, WorkerId};

pub type TaskRef = Arc<Task>;

// Process-wide: resources outlive any one scheduler and name owners by id.
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Spawned, not started.
    Init = 0,
    /// On a ready queue (or signalled, for a bound task).
    Ready = 1,
    /// A worker is running its frames.
    Running = 2,
    /// Parked on a resource, another task, or an external event.
    Waiting = 3,
    Done = 4,
    Failed = 5,
}

const STATE_MASK: u8 = 0b0111;
const NOTIFIED: u8 = 0b1000;

impl TaskState {
    fn from_bits(raw: u8) -> Self {
        match raw & STATE_MASK {
            0 => Self::Init,
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Waiting,
            4 => Self::Done,
            5 => Self::Failed,
            _ => invariant_violation("corrupt task state"),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether `self -> to` is an edge of the state machine.
    pub fn can_transition(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Init, Ready)
                | (Ready, Running)
                | (Running, Waiting)
                | (Running, Ready)
                | (Running, Done)
                | (Running, Failed)
                | (Waiting, Ready)
        )
    }
}

/// What a Waiting task is blocked on.
#[derive(Clone)]
pub enum WaitTarget {
    Resource(ExclusiveResource),
    /// Joining another task.
    Task(TaskRef),
    /// Native I/O, a timer, or anything else outside the scheduler.
    External,
}

impl fmt::Debug for WaitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitTarget::Resource(r) => write!(f, "Resource({})", r.id()),
            WaitTarget::Task(t) => write!(f, "Task({})", t.id()),
            WaitTarget::External => f.write_str("External"),
        }
    }
}

/// Frame chain and trampoline registers. Only the bound worker writes here
/// while the task is Running.
#[derive(Default)]
struct TaskCore {
    top: Option<FrameRef>,
    value: Value,
    pending_error: Option<Error>,
    worker: Option<WorkerId>,
}

#[repr(C)]
pub struct Task {
    // Must stay first: the ready queue and wait queues link tasks through it.
    link: QueueNode,
    id: TaskId,
    state: AtomicU8,
    core: Mutex<TaskCore>,
    waiting_for: Mutex<Option<WaitTarget>>,
    /// Counted in the scheduler's waiting-on-external total.
    external: AtomicBool,
    bound: Option<Arc<Signal>>,
    pub(crate) completion: Completion,
    shared: Arc<Shared>,
}

// SAFETY: `link` is the first field of a `#[repr(C)]` struct.
unsafe impl Linked for Task {
    fn node(&self) -> &QueueNode {
        &self.link
    }
}

impl Task {
    pub(crate) fn new(
        shared: Arc<Shared>,
        id: TaskId,
        entry: FrameRef,
        bound: Option<Arc<Signal>>,
    ) -> TaskRef {
        Arc::new(Self {
            link: QueueNode::new(),
            id,
            state: AtomicU8::new(TaskState::Init as u8),
            core: Mutex::new(TaskCore {
                top: Some(entry),
                ..TaskCore::default()
            }),
            waiting_for: Mutex::new(None),
            external: AtomicBool::new(false),
            bound,
            completion: Completion::new(),
            shared,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_bits(self.state.load(Ordering::SeqCst))
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    /// Worker currently running this task.
    pub fn worker(&self) -> Option<WorkerId> {
        self.core.lock().worker
    }

    /// Top of the frame chain.
    pub fn top(&self) -> Option<FrameRef> {
        self.core.lock().top.clone()
    }

    /// Value the top frame resumes with next.
    pub fn value(&self) -> Value {
        self.core.lock().value.clone()
    }

    pub fn pending_error(&self) -> Option<Error> {
        self.core.lock().pending_error.clone()
    }

    pub fn waiting_for(&self) -> Option<WaitTarget> {
        self.waiting_for.lock().clone()
    }

    /// Checked transition for bindings and tests. The scheduler's own paths
    /// treat a refused transition as fatal instead.
    pub fn try_transition(&self, to: TaskState) -> Result<TaskState, IllegalTransition> {
        let mut raw = self.state.load(Ordering::SeqCst);
        loop {
            let from = TaskState::from_bits(raw);
            if !from.can_transition(to) {
                return Err(IllegalTransition { from, to });
            }
            match self
                .state
                .compare_exchange(raw, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Ok(from),
                Err(actual) => raw = actual,
            }
        }
    }

    pub(crate) fn transition(&self, from: TaskState, to: TaskState) {
        let mut raw = self.state.load(Ordering::SeqCst);
        loop {
            let current = TaskState::from_bits(raw);
            if current != from || !from.can_transition(to) {
                invariant_violation(&format!(
                    "task {} cannot go {:?} -> {:?} (state is {:?})",
                    self.id, from, to, current
                ));
            }
            match self
                .state
                .compare_exchange(raw, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return,
                Err(actual) => raw = actual,
            }
        }
    }

    /// Init -> Ready.
    pub fn start(self: &Arc<Self>) {
        self.transition(TaskState::Init, TaskState::Ready);
        self.shared.runnable_add(1);
        debug!(task.id = %self.id, bound = self.is_bound(), "task started");
        self.shared.schedule(self.clone());
    }

    /// Make a parked task runnable again.
    ///
    /// Waiting -> Ready and enqueue. If the task is still Running (it has
    /// published itself somewhere but not parked yet), the wakeup is
    /// recorded and consumed when it parks.
    pub fn ready(self: &Arc<Self>) {
        let mut raw = self.state.load(Ordering::SeqCst);
        loop {
            match TaskState::from_bits(raw) {
                TaskState::Waiting => {
                    if let Err(actual) = self.state.compare_exchange(
                        raw,
                        TaskState::Ready as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        raw = actual;
                        continue;
                    }
                    // Count as runnable before the external count drops, so
                    // the scheduler never looks quiescent in between.
                    self.shared.runnable_add(1);
                    self.finish_wait();
                    trace!(task.id = %self.id, "task ready");
                    self.shared.schedule(self.clone());
                    return;
                }
                TaskState::Running => {
                    if let Err(actual) = self.state.compare_exchange(
                        raw,
                        raw | NOTIFIED,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        raw = actual;
                        continue;
                    }
                    self.finish_wait();
                    trace!(task.id = %self.id, "task woken before parking");
                    return;
                }
                other => invariant_violation(&format!(
                    "task {} woken while {:?}",
                    self.id, other
                )),
            }
        }
    }

    /// Mark the running task as waiting on something outside the scheduler.
    /// The frame then returns `Suspended`; whoever completes the event calls
    /// [`Task::ready`].
    pub fn wait_external(&self) {
        if self.state() != TaskState::Running {
            invariant_violation(&format!(
                "task {} waits on an external event while {:?}",
                self.id,
                self.state()
            ));
        }
        *self.waiting_for.lock() = Some(WaitTarget::External);
        if !self.external.swap(true, Ordering::SeqCst) {
            self.shared.external_add(1);
        }
    }

    /// Ask to be re-queued behind the tasks already ready. The frame then
    /// returns `Suspended`.
    pub fn yield_now(&self) {
        let raw = self.state.fetch_or(NOTIFIED, Ordering::SeqCst);
        if TaskState::from_bits(raw) != TaskState::Running {
            invariant_violation(&format!("task {} yields while not running", self.id));
        }
    }

    /// Make `frame` the top of the chain.
    pub fn pause(&self, frame: FrameRef) {
        self.core.lock().top = Some(frame);
    }

    /// Unwind the chain down to `target`, cancelling every frame above it,
    /// then continue at `target` with `value`.
    ///
    /// Each skipped frame is resumed once with [`Error::Cancelled`] so it can
    /// let go of what it holds. `target` must be on the chain.
    pub fn unwind_to(self: &Arc<Self>, target: &FrameRef, value: Value) {
        let state = self.state();
        if !matches!(state, TaskState::Init | TaskState::Running) {
            invariant_violation(&format!("unwinding task {} while {:?}", self.id, state));
        }

        let mut doomed = Vec::new();
        let mut cursor = self.top();
        loop {
            match cursor {
                Some(f) if Arc::ptr_eq(&f, target) => break,
                Some(f) => {
                    cursor = f.caller();
                    doomed.push(f);
                }
                None => invariant_violation("unwind target is not on the task's frame chain"),
            }
        }

        for frame in doomed {
            trace!(task.id = %self.id, frame = frame.label(), "cancelling frame");
            if let StepResult::Suspended =
                frame.resume(self, Value::unit(), Some(Error::Cancelled))
            {
                warn!(
                    task.id = %self.id,
                    frame = frame.label(),
                    "frame suspended while being cancelled"
                );
            }
        }

        let mut core = self.core.lock();
        core.top = Some(target.clone());
        core.value = value;
        core.pending_error = None;
    }

    /// Registry of the scheduler that spawned this task.
    pub fn registry(&self) -> &Arc<Registry> {
        self.shared.registry()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn signal(&self) -> Option<&Arc<Signal>> {
        self.bound.as_ref()
    }

    pub(crate) fn set_waiting_for(&self, target: Option<WaitTarget>) {
        *self.waiting_for.lock() = target;
    }

    pub(crate) fn bind(&self, worker: WorkerId) {
        self.transition(TaskState::Ready, TaskState::Running);
        self.core.lock().worker = Some(worker);
    }

    pub(crate) fn unbind(&self) {
        self.core.lock().worker = None;
    }

    /// Next trampoline step: the top frame and what to resume it with.
    pub(crate) fn next_step(&self) -> Option<(FrameRef, Value, Option<Error>)> {
        let mut core = self.core.lock();
        let frame = core.top.clone()?;
        let value = std::mem::take(&mut core.value);
        Some((frame, value, core.pending_error.take()))
    }

    /// `frame` finished with `result`: pop it and pass the result to its
    /// caller. Returns the result back when `frame` was the root.
    pub(crate) fn complete_frame(
        &self,
        frame: &FrameRef,
        result: Result<Value, Error>,
    ) -> Option<Result<Value, Error>> {
        let mut core = self.core.lock();
        match &core.top {
            Some(top) if Arc::ptr_eq(top, frame) => {}
            _ => invariant_violation("finished frame is not on top of its task's chain"),
        }
        core.top = frame.caller();
        if core.top.is_none() {
            return Some(result);
        }
        match result {
            Ok(v) => core.value = v,
            Err(e) => core.pending_error = Some(e),
        }
        None
    }

    /// `frame` returned `Jump { target, value }`.
    pub(crate) fn jump(self: &Arc<Self>, frame: &FrameRef, target: &FrameRef, value: Value) {
        {
            let mut core = self.core.lock();
            // A frame that jumps elsewhere without pausing first is finished.
            let popped = match &core.top {
                Some(top) => Arc::ptr_eq(top, frame) && !Arc::ptr_eq(frame, target),
                None => false,
            };
            if popped {
                core.top = frame.caller();
            }
            if matches!(&core.top, Some(top) if Arc::ptr_eq(top, target)) {
                core.value = value;
                core.pending_error = None;
                return;
            }
        }
        self.unwind_to(target, value);
    }

    /// After the trampoline stopped on `Suspended`: Running -> Waiting, or
    /// straight back to Ready when a wakeup (or yield) is pending.
    pub(crate) fn park(self: &Arc<Self>) {
        let mut raw = self.state.load(Ordering::SeqCst);
        loop {
            if raw == TaskState::Running as u8 | NOTIFIED {
                if let Err(actual) = self.state.compare_exchange(
                    raw,
                    TaskState::Ready as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    raw = actual;
                    continue;
                }
                trace!(task.id = %self.id, "task requeued");
                self.shared.schedule(self.clone());
                return;
            }
            if raw != TaskState::Running as u8 {
                invariant_violation(&format!(
                    "parking task {} while {:?}",
                    self.id,
                    TaskState::from_bits(raw)
                ));
            }
            if self.waiting_for.lock().is_none() {
                invariant_violation(&format!(
                    "task {} suspended without anything to wait for",
                    self.id
                ));
            }
            if let Err(actual) = self.state.compare_exchange(
                raw,
                TaskState::Waiting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                raw = actual;
                continue;
            }
            trace!(task.id = %self.id, waiting_for = ?self.waiting_for(), "task parked");
            self.shared.runnable_add(-1);
            return;
        }
    }

    /// The root frame finished: Running -> Done or Failed, wake joiners
    /// and leave the scheduler's books.
    pub(crate) fn finalize(self: &Arc<Self>, result: Result<Value, Error>) {
        let outcome = match result {
            Ok(value) => {
                self.force_terminal(TaskState::Done);
                debug!(task.id = %self.id, "task done");
                Outcome::Done(value)
            }
            Err(error) => {
                self.force_terminal(TaskState::Failed);
                warn!(task.id = %self.id, %error, "task failed with an uncaught error");
                Outcome::Failed(UncaughtError {
                    task: self.id,
                    error,
                })
            }
        };
        {
            let mut core = self.core.lock();
            core.top = None;
            core.value = Value::unit();
            core.pending_error = None;
        }
        for waiter in self.completion.complete(outcome) {
            waiter.ready();
        }
        self.shared.retire(self.id);
    }

    // A pending notification no longer matters once the task is finished.
    fn force_terminal(&self, to: TaskState) {
        let mut raw = self.state.load(Ordering::SeqCst);
        loop {
            if TaskState::from_bits(raw) != TaskState::Running {
                invariant_violation(&format!(
                    "task {} finished while {:?}",
                    self.id,
                    TaskState::from_bits(raw)
                ));
            }
            match self
                .state
                .compare_exchange(raw, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return,
                Err(actual) => raw = actual,
            }
        }
    }

    fn finish_wait(&self) {
        *self.waiting_for.lock() = None;
        if self.external.swap(false, Ordering::SeqCst) {
            self.shared.external_add(-1);
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("bound", &self.is_bound())
            .finish()
    }
}
