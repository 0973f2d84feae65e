// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Continuation frames.
//!
//! A frame is one pending step of a computation plus a link to the frame
//! that runs after it (`caller`). A task's chain runs from its top frame back
//! to the root. The task owns the chain while running; captured chains are
//! shared through `Arc` and never mutated concurrently.
//!
//! Frames do not return through the native stack. `resume` reports what
//! happened as a [`StepResult`] and the worker's trampoline acts on it.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{invariant_violation, Error};
use crate::task::TaskRef;
use crate::value::Value;

pub type FrameRef = Arc<Frame>;

/// Outcome of one `resume` call.
#[derive(Debug)]
pub enum StepResult {
    /// The frame finished; its caller resumes with the value.
    Done(Value),
    /// The frame finished by raising; its caller resumes with the error.
    Throw(Error),
    /// The task stopped. Whatever parked it will make it ready again.
    Suspended,
    /// Continue at `target` with `value`. Frames between the current top
    /// and `target` are unwound.
    Jump { target: FrameRef, value: Value },
}

impl StepResult {
    /// Pass an incoming error on to the caller, or finish with `value`.
    pub fn forward(value: Value, error: Option<Error>) -> Self {
        match error {
            Some(e) => StepResult::Throw(e),
            None => StepResult::Done(value),
        }
    }
}

/// The code behind a frame.
pub trait Resume: Send + Sync {
    fn resume(&self, cx: &Cx<'_>, value: Value, error: Option<Error>) -> StepResult;
}

impl<F> Resume for F
where
    F: Fn(&Cx<'_>, Value, Option<Error>) -> StepResult + Send + Sync,
{
    fn resume(&self, cx: &Cx<'_>, value: Value, error: Option<Error>) -> StepResult {
        self(cx, value, error)
    }
}

pub struct Frame {
    label: &'static str,
    caller: Mutex<Option<FrameRef>>,
    code: Box<dyn Resume>,
}

impl Frame {
    /// Create a detached frame.
    pub fn alloc<F>(code: F) -> FrameRef
    where
        F: Fn(&Cx<'_>, Value, Option<Error>) -> StepResult + Send + Sync + 'static,
    {
        Self::with_code("frame", code)
    }

    pub fn labeled<F>(label: &'static str, code: F) -> FrameRef
    where
        F: Fn(&Cx<'_>, Value, Option<Error>) -> StepResult + Send + Sync + 'static,
    {
        Self::with_code(label, code)
    }

    pub fn with_code(label: &'static str, code: impl Resume + 'static) -> FrameRef {
        Arc::new(Self {
            label,
            caller: Mutex::new(None),
            code: Box::new(code),
        })
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn caller(&self) -> Option<FrameRef> {
        self.caller.lock().clone()
    }

    pub(crate) fn resume(
        self: &Arc<Self>,
        task: &TaskRef,
        value: Value,
        error: Option<Error>,
    ) -> StepResult {
        let cx = Cx { task, frame: self };
        self.code.resume(&cx, value, error)
    }
}

/// Link `frame` below `caller`: when `frame` finishes, `caller` resumes.
pub fn attach(frame: &FrameRef, caller: Option<FrameRef>) {
    let mut cursor = caller.clone();
    while let Some(f) = cursor {
        if Arc::ptr_eq(&f, frame) {
            invariant_violation("attaching a frame below itself");
        }
        cursor = f.caller();
    }
    *frame.caller.lock() = caller;
}

/// Number of frames from `frame` down to the root, inclusive.
pub fn depth(frame: &FrameRef) -> usize {
    let mut n = 1;
    let mut cursor = frame.caller();
    while let Some(f) = cursor {
        n += 1;
        cursor = f.caller();
    }
    n
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("label", &self.label)
            .field("has_caller", &self.caller.lock().is_some())
            .finish()
    }
}

impl Drop for Frame {
    // Iterative, so dropping a deep chain cannot overflow the stack.
    fn drop(&mut self) {
        let mut next = self.caller.get_mut().take();
        while let Some(frame) = next {
            match Arc::try_unwrap(frame) {
                Ok(mut owned) => next = owned.caller.get_mut().take(),
                Err(_) => break,
            }
        }
    }
}

/// What a running frame can see: its task and itself.
pub struct Cx<'a> {
    task: &'a TaskRef,
    frame: &'a FrameRef,
}

impl<'a> Cx<'a> {
    pub fn task(&self) -> &'a TaskRef {
        self.task
    }

    pub fn frame(&self) -> &'a FrameRef {
        self.frame
    }

    /// Run `callee` next; its result comes back to this frame.
    pub fn call(&self, callee: FrameRef, value: Value) -> StepResult {
        attach(&callee, Some(self.frame.clone()));
        self.task.pause(callee.clone());
        StepResult::Jump {
            target: callee,
            value,
        }
    }

    /// Replace this frame with `next`, which inherits its caller and becomes
    /// the top of the chain. Follow with `Suspended` to stop, or with a
    /// `Jump` to `next` to keep going.
    pub fn continue_in(&self, next: FrameRef) {
        attach(&next, self.frame.caller());
        self.task.pause(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> FrameRef {
        Frame::alloc(|_, v, e| StepResult::forward(v, e))
    }

    #[test]
    fn attach_links_caller() {
        let root = noop();
        let child = noop();
        attach(&child, Some(root.clone()));
        assert!(Arc::ptr_eq(&child.caller().unwrap(), &root));
        assert_eq!(depth(&child), 2);
        assert_eq!(depth(&root), 1);
    }

    #[test]
    #[should_panic(expected = "below itself")]
    fn attach_rejects_cycles() {
        let a = noop();
        let b = noop();
        attach(&b, Some(a.clone()));
        attach(&a, Some(b));
    }

    #[test]
    fn forward_prefers_error() {
        assert!(matches!(
            StepResult::forward(Value::unit(), Some(Error::Cancelled)),
            StepResult::Throw(Error::Cancelled)
        ));
        assert!(matches!(
            StepResult::forward(Value::new(1u8), None),
            StepResult::Done(_)
        ));
    }

    #[test]
    fn deep_chain_drops_without_overflow() {
        let mut top = noop();
        for _ in 0..200_000 {
            let f = noop();
            *f.caller.lock() = Some(top);
            top = f;
        }
        drop(top);
    }

    #[test]
    fn shared_tail_survives_drop() {
        let root = noop();
        let a = noop();
        attach(&a, Some(root.clone()));
        drop(a);
        assert_eq!(Arc::strong_count(&root), 1);
        assert_eq!(root.label(), "frame");
    }
}
