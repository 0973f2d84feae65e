// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `strand deadlock`: two tasks take two resources in opposite order.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use strand_rt::{
    scoped, Error, ExclusiveResource, Frame, FrameRef, Outcome, StepResult, TaskRef, Value,
};

use super::Flags;
use crate::output;

fn inverted(
    first: &ExclusiveResource,
    second: &ExclusiveResource,
    holding: Arc<AtomicUsize>,
) -> FrameRef {
    let second = second.clone();
    let counted = AtomicBool::new(false);
    let asked = AtomicBool::new(false);
    let rendezvous = Frame::labeled("rendezvous", move |cx, value, error| {
        if let Some(e) = error {
            return StepResult::Throw(e);
        }
        if asked.load(Ordering::SeqCst) {
            return StepResult::Done(value);
        }
        if !counted.swap(true, Ordering::SeqCst) {
            holding.fetch_add(1, Ordering::SeqCst);
        }
        // Both sides must hold their first resource before either asks.
        if holding.load(Ordering::SeqCst) < 2 {
            cx.task().yield_now();
            return StepResult::Suspended;
        }
        asked.store(true, Ordering::SeqCst);
        let inner = Frame::alloc(|_, v, e| StepResult::forward(v, e));
        cx.call(scoped::acquire(second.clone(), inner), Value::unit())
    });
    scoped::acquire(first.clone(), rendezvous)
}

fn report(name: &str, task: &TaskRef, outcome: &Outcome) -> bool {
    match outcome {
        Outcome::Done(_) => {
            println!(
                "  {} {} {} finished holding both",
                output::status(true),
                name,
                output::task_id(task.id())
            );
            false
        }
        Outcome::Failed(failed) => match &failed.error {
            Error::Deadlock(deadlock) => {
                println!(
                    "  {} {} {} {}",
                    output::status(true),
                    name,
                    output::task_id(task.id()),
                    deadlock
                );
                true
            }
            other => {
                println!(
                    "  {} {} {} failed: {}",
                    output::status(false),
                    name,
                    output::task_id(task.id()),
                    other
                );
                false
            }
        },
    }
}

pub fn cmd_deadlock(args: &[String]) -> Result<bool, String> {
    let flags = Flags::parse(args, &["workers"])?;
    let sched = super::scheduler(flags.usize("workers")?)?;

    let x = ExclusiveResource::named("x");
    let y = ExclusiveResource::named("y");
    let holding = Arc::new(AtomicUsize::new(0));

    let a = sched
        .run(inverted(&x, &y, holding.clone()))
        .map_err(|e| e.to_string())?;
    let b = sched
        .run(inverted(&y, &x, holding))
        .map_err(|e| e.to_string())?;
    sched.shutdown();

    let outcomes = match (
        a.join_timeout(super::TASK_TIMEOUT),
        b.join_timeout(super::TASK_TIMEOUT),
    ) {
        (Some(oa), Some(ob)) => [oa, ob],
        _ => {
            println!("{}", output::banner("deadlock", Some("tasks hung")));
            return Ok(false);
        }
    };

    let detected = [report("a", &a, &outcomes[0]), report("b", &b, &outcomes[1])]
        .iter()
        .filter(|d| **d)
        .count();
    let done = outcomes.iter().filter(|o| o.is_done()).count();
    let released = x.owner().is_none() && y.owner().is_none();
    super::print_stats(&sched);

    if detected == 1 && done == 1 && released {
        println!("{}", output::banner("deadlock", None));
        Ok(true)
    } else {
        let reason = format!(
            "{} deadlock(s), {} finished, resources released: {}",
            detected, done, released
        );
        println!("{}", output::banner("deadlock", Some(&reason)));
        Ok(false)
    }
}
