// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;
use std::time::Duration;

use strand_rt::{Frame, FrameRef, Scheduler, SchedulerConfig, StepResult, TaskRef, Value};
use tracing_subscriber::EnvFilter;

static INIT_LOGGING: Once = Once::new();

/// Long enough that only a hang trips it.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Install a test-writer subscriber once per test binary. `STRAND_LOG`
/// overrides the default `warn` filter.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter =
            EnvFilter::try_from_env("STRAND_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_thread_names(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Scheduler with no background workers; the test thread runs tasks.
pub fn manual() -> Scheduler {
    init_test_logging();
    Scheduler::new(SchedulerConfig::manual()).expect("manual scheduler")
}

/// Scheduler with `n` background workers.
pub fn workers(n: usize) -> Scheduler {
    init_test_logging();
    let config = SchedulerConfig::builder()
        .worker_threads(n)
        .thread_name_prefix("strand-test")
        .build()
        .expect("valid config");
    Scheduler::new(config).expect("scheduler with workers")
}

/// A frame that runs a fresh child from `make` `times` times in a row, then
/// finishes with the last child's value. Errors from a child propagate.
pub fn repeat<F>(times: usize, make: F) -> FrameRef
where
    F: Fn() -> FrameRef + Send + Sync + 'static,
{
    let calls = AtomicUsize::new(0);
    Frame::labeled("repeat", move |cx, value, error| {
        if let Some(e) = error {
            return StepResult::Throw(e);
        }
        if calls.fetch_add(1, Ordering::SeqCst) < times {
            cx.call(make(), Value::unit())
        } else {
            StepResult::Done(value)
        }
    })
}

/// Block until `task` finishes; panics instead of hanging.
pub fn finish(task: &TaskRef) -> strand_rt::Outcome {
    task.join_timeout(JOIN_TIMEOUT)
        .unwrap_or_else(|| panic!("task {} did not finish", task.id()))
}
