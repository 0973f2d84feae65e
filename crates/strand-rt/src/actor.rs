// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Payload-carrying resources and the actor flavor built on them.
//!
//! [`Exclusive`] pairs an [`ExclusiveResource`] with data only its owner
//! may touch. Access is closure-based so no reference escapes the
//! ownership window.
//!
//! An [`Actor`] is exclusive state plus a message handler. Sending a
//! message yields a frame that acquires the state, runs the handler and
//! releases. A handler that suspends hands the rest of its work to a
//! continuation with [`Cx::continue_in`]; release then waits until that
//! continuation finishes.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::invariant_violation;
use crate::frame::{Cx, Frame, FrameRef, StepResult};
use crate::resource::ExclusiveResource;
use crate::scoped;
use crate::task::Task;
use crate::value::Value;

pub struct Exclusive<T> {
    resource: ExclusiveResource,
    payload: UnsafeCell<T>,
    in_use: AtomicBool,
}

// SAFETY: the payload is only reached through `with`, which requires the
// caller to own the resource and rejects reentrant use.
unsafe impl<T: Send> Send for Exclusive<T> {}
unsafe impl<T: Send> Sync for Exclusive<T> {}

struct InUse<'a>(&'a AtomicBool);

impl Drop for InUse<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<T> Exclusive<T> {
    pub fn new(value: T) -> Self {
        Self::with_resource(ExclusiveResource::new(), value)
    }

    pub fn with_resource(resource: ExclusiveResource, value: T) -> Self {
        Self {
            resource,
            payload: UnsafeCell::new(value),
            in_use: AtomicBool::new(false),
        }
    }

    pub fn resource(&self) -> &ExclusiveResource {
        &self.resource
    }

    /// Run `f` on the payload if `task` owns the resource; `None` otherwise.
    pub fn with<R>(&self, task: &Task, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        if !self.resource.is_owned_by(task) {
            return None;
        }
        if self.in_use.swap(true, Ordering::SeqCst) {
            invariant_violation("reentrant access to an exclusive payload");
        }
        let _in_use = InUse(&self.in_use);
        // SAFETY: `task` owns the resource and no other borrow is live.
        Some(f(unsafe { &mut *self.payload.get() }))
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.payload.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.payload.into_inner()
    }
}

impl<T> fmt::Debug for Exclusive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exclusive")
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

type Handler<S> = dyn Fn(&Cx<'_>, &mut S, Value) -> StepResult + Send + Sync;

/// Exclusive state driven by messages.
pub struct Actor<S> {
    state: Arc<Exclusive<S>>,
    handler: Arc<Handler<S>>,
}

impl<S> Clone for Actor<S> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<S: Send + 'static> Actor<S> {
    pub fn new<F>(state: S, handler: F) -> Self
    where
        F: Fn(&Cx<'_>, &mut S, Value) -> StepResult + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(Exclusive::new(state)),
            handler: Arc::new(handler),
        }
    }

    pub fn resource(&self) -> &ExclusiveResource {
        self.state.resource()
    }

    /// A frame that delivers `message`. It finishes with the handler's
    /// result once the state has been released.
    pub fn send(&self, message: Value) -> FrameRef {
        let state = self.state.clone();
        let handler = self.handler.clone();
        let delivered = AtomicBool::new(false);
        let body = Frame::labeled("actor-message", move |cx, value, error| {
            // Later resumes carry the result of whatever the handler called.
            if delivered.swap(true, Ordering::SeqCst) {
                return StepResult::forward(value, error);
            }
            if let Some(e) = error {
                return StepResult::Throw(e);
            }
            match state.with(cx.task(), |s| handler(cx, s, message.clone())) {
                Some(step) => step,
                None => invariant_violation("actor handler ran without owning its state"),
            }
        });
        scoped::acquire(self.state.resource().clone(), body)
    }

    /// Read or update the state from a task that currently owns it, e.g.
    /// from a handler's continuation.
    pub fn with_state<R>(&self, task: &Task, f: impl FnOnce(&mut S) -> R) -> Option<R> {
        self.state.with(task, f)
    }
}

impl<S> fmt::Debug for Actor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actor")
            .field("resource", self.state.resource())
            .finish_non_exhaustive()
    }
}
