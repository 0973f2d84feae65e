// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `strand counter`: N tasks each increment one shared counter once.

use std::sync::Arc;
use std::time::Instant;

use strand_rt::{scoped, Error, Exclusive, Frame, FrameRef, StepResult, Value};

use super::Flags;
use crate::output;

fn bump(counter: &Arc<Exclusive<u64>>) -> FrameRef {
    let c = counter.clone();
    let body = Frame::labeled("increment", move |cx, _, error| {
        if let Some(e) = error {
            return StepResult::Throw(e);
        }
        match c.with(cx.task(), |n| *n += 1) {
            Some(()) => StepResult::Done(Value::unit()),
            None => StepResult::Throw(Error::thrown("counter touched without ownership")),
        }
    });
    scoped::acquire(counter.resource().clone(), body)
}

pub fn cmd_counter(args: &[String]) -> Result<bool, String> {
    let flags = Flags::parse(args, &["tasks", "workers"])?;
    let tasks = flags.usize("tasks")?.unwrap_or(100);
    let sched = super::scheduler(flags.usize("workers")?)?;

    let counter = Arc::new(Exclusive::new(0u64));
    let start = Instant::now();
    let handles = (0..tasks)
        .map(|_| sched.run(bump(&counter)).map_err(|e| e.to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    sched.shutdown();
    let elapsed = start.elapsed();

    if !super::await_all(&handles) {
        println!("{}", output::banner("counter", Some("tasks did not finish")));
        return Ok(false);
    }
    let failed = handles.iter().filter(|t| !t.join().is_done()).count();
    drop(handles);

    let total = match Arc::try_unwrap(counter) {
        Ok(counter) => counter.into_inner(),
        Err(_) => return Err("counter is still referenced after shutdown".to_string()),
    };

    let passed = total == tasks as u64 && failed == 0;
    println!(
        "  {} {} tasks, counter = {} ({:.2?})",
        output::status(passed),
        tasks,
        total,
        elapsed
    );
    super::print_stats(&sched);

    if passed {
        println!("{}", output::banner("counter", None));
        Ok(true)
    } else {
        println!(
            "{}",
            output::banner("counter", Some(&format!("expected {}, got {}", tasks, total)))
        );
        Ok(false)
    }
}
