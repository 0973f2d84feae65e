// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error kinds.
//!
//! `Error` travels through frame chains like a value does. `RuntimeError`
//! is for the embedding host. Broken scheduler invariants are neither: they
//! go through [`invariant_violation`] and take the process down.

use crate::task::{TaskId, TaskState};
use crate::value::Value;

/// Host-facing result.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Recoverable error delivered to a frame's `resume`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A host-level exception.
    #[error("thrown {0:?}")]
    Thrown(Value),

    #[error(transparent)]
    Deadlock(#[from] DeadlockError),

    /// Delivered to frames skipped by an unwind so they can clean up.
    #[error("frame cancelled by unwind")]
    Cancelled,
}

impl Error {
    pub fn thrown<T: std::any::Any + Send + Sync>(value: T) -> Self {
        Error::Thrown(Value::new(value))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Blocking would close a cycle in the wait graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("deadlock detected: {}", render_path(.path))]
pub struct DeadlockError {
    pub requester: TaskId,
    /// Tasks along the cycle, starting and ending with the requester.
    pub path: Vec<TaskId>,
}

fn render_path(path: &[TaskId]) -> String {
    path.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// An error walked off the root frame of a task.
#[derive(Debug, Clone, thiserror::Error)]
#[error("task {task} failed: {error}")]
pub struct UncaughtError {
    pub task: TaskId,
    pub error: Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal task transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: TaskState,
    pub to: TaskState,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to spawn worker thread: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("registry is shut down")]
    RegistryClosed,

    #[error("native function `{0}` is already registered")]
    DuplicateNative(String),

    #[error("unknown native function `{0}`")]
    UnknownNative(String),

    #[error("scheduler is shut down")]
    ShutDown,
}

impl RuntimeError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        RuntimeError::Config(msg.into())
    }
}

/// The scheduler's own bookkeeping is no longer trustworthy.
#[cold]
#[track_caller]
pub fn invariant_violation(msg: &str) -> ! {
    tracing::error!(reason = msg, "scheduler invariant violated");
    panic!("invariant violation: {}", msg);
}
