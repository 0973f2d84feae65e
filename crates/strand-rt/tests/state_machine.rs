// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Randomized checks of the task state machine.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use proptest::prelude::*;
use strand_rt::{Error, Frame, StepResult, TaskState, Value};

const STATES: [TaskState; 6] = [
    TaskState::Init,
    TaskState::Ready,
    TaskState::Running,
    TaskState::Waiting,
    TaskState::Done,
    TaskState::Failed,
];

fn any_state() -> impl Strategy<Value = TaskState> {
    (0..STATES.len()).prop_map(|i| STATES[i])
}

/// What a task does on one resume.
#[derive(Debug, Clone, Copy)]
enum Step {
    Yield,
    External,
    Finish,
    Raise,
}

fn any_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::Yield),
        Just(Step::External),
        Just(Step::Finish),
        Just(Step::Raise),
    ]
}

proptest! {
    #[test]
    fn checked_transitions_follow_the_table(targets in prop::collection::vec(any_state(), 1..40)) {
        let sched = common::manual();
        let task = sched.spawn(Frame::alloc(|_, v, e| StepResult::forward(v, e))).unwrap();
        let mut model = TaskState::Init;
        for to in targets {
            let result = task.try_transition(to);
            if model.can_transition(to) {
                prop_assert_eq!(result, Ok(model));
                model = to;
            } else {
                let err = result.unwrap_err();
                prop_assert_eq!(err.from, model);
                prop_assert_eq!(err.to, to);
            }
            prop_assert_eq!(task.state(), model);
        }
    }

    #[test]
    fn terminal_states_are_final(to in any_state()) {
        prop_assert!(!TaskState::Done.can_transition(to));
        prop_assert!(!TaskState::Failed.can_transition(to));
    }

    #[test]
    fn scheduled_runs_end_terminal(plans in prop::collection::vec(prop::collection::vec(any_step(), 0..12), 1..6)) {
        let sched = common::manual();
        let mut tasks = Vec::new();
        for plan in plans {
            let plan = Arc::new(plan);
            let cursor = AtomicUsize::new(0);
            let p = plan.clone();
            let entry = Frame::alloc(move |cx, v, e| {
                let step = p.get(cursor.fetch_add(1, Ordering::SeqCst)).copied();
                match step.unwrap_or(Step::Finish) {
                    Step::Yield => {
                        cx.task().yield_now();
                        StepResult::Suspended
                    }
                    Step::External => {
                        cx.task().wait_external();
                        StepResult::Suspended
                    }
                    Step::Finish => StepResult::forward(v, e),
                    Step::Raise => StepResult::Throw(Error::thrown("raised")),
                }
            });
            tasks.push((sched.run(entry).unwrap(), plan));
        }

        // Drive until everything finished, completing external waits by hand.
        for _ in 0..100 {
            sched.run_until_empty();
            let mut pending = false;
            for (task, _) in &tasks {
                match task.state() {
                    TaskState::Waiting => {
                        pending = true;
                        task.ready();
                    }
                    TaskState::Done | TaskState::Failed => {}
                    other => prop_assert!(false, "unexpected state {:?}", other),
                }
            }
            if !pending {
                break;
            }
        }

        for (task, plan) in &tasks {
            let first_end = plan
                .iter()
                .find(|s| matches!(s, Step::Finish | Step::Raise))
                .copied()
                .unwrap_or(Step::Finish);
            let expected = match first_end {
                Step::Raise => TaskState::Failed,
                _ => TaskState::Done,
            };
            prop_assert_eq!(task.state(), expected);
        }
        prop_assert!(sched.stats().is_quiescent());
        prop_assert_eq!(sched.stats().tasks, 0);
    }
}
