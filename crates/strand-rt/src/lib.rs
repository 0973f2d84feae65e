// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Strand runtime core: cooperative tasks over a pool of worker threads.
//!
//! Tasks are chains of heap frames driven by a trampoline, so a task can
//! stop at any frame boundary and resume later on any worker. Shared
//! mutable objects are exclusive resources with one owning task at a time;
//! blocking on one either queues the task or, when it would close a wait
//! cycle, fails with a deadlock error.
//!
//! Components:
//! - cell/queue: tagged atomic word and the intrusive lock-free queue
//! - frame: continuation frames and `StepResult`
//! - task: task state machine, pause/unwind
//! - resource/deadlock: ownership protocol and cycle detection
//! - scoped/actor: guaranteed-release acquisition, payloads, actors
//! - join: task outcomes and waiting on tasks
//! - worker/scheduler: trampoline, workers, counters, lifecycle
//! - registry: interned symbols and native functions

pub mod actor;
pub mod cell;
pub mod config;
pub mod deadlock;
pub mod error;
pub mod frame;
pub mod join;
pub mod queue;
pub mod registry;
pub mod resource;
pub mod scheduler;
pub mod scoped;
pub mod task;
pub mod value;
pub mod worker;

pub use actor::{Actor, Exclusive};
pub use config::{SchedulerConfig, SchedulerConfigBuilder};
pub use error::{DeadlockError, Error, IllegalTransition, Result, RuntimeError, UncaughtError};
pub use frame::{attach, Cx, Frame, FrameRef, Resume, StepResult};
pub use join::{join_frame, wait_for, Outcome};
pub use registry::{NativeFn, Registry, Symbol};
pub use resource::{Acquire, ExclusiveResource, ResourceId};
pub use scheduler::{Scheduler, Stats};
pub use task::{Task, TaskId, TaskRef, TaskState, WaitTarget};
pub use value::Value;
pub use worker::{Worker, WorkerId};
