// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! A hundred tasks bump one shared counter.

mod common;

use std::sync::Arc;

use strand_rt::{
    join_frame, scoped, Actor, Error, Exclusive, Frame, FrameRef, StepResult, TaskRef, Value,
};

fn bump(counter: &Arc<Exclusive<u64>>) -> FrameRef {
    let c = counter.clone();
    let body = Frame::labeled("bump", move |cx, _, error| {
        if let Some(e) = error {
            return StepResult::Throw(e);
        }
        match c.with(cx.task(), |n| *n += 1) {
            Some(()) => StepResult::Done(Value::unit()),
            None => StepResult::Throw(Error::thrown("not the owner")),
        }
    });
    scoped::acquire(counter.resource().clone(), body)
}

fn total(counter: Arc<Exclusive<u64>>, tasks: &[TaskRef]) -> u64 {
    for task in tasks {
        assert!(common::finish(task).is_done());
    }
    assert_eq!(counter.resource().owner(), None);
    match Arc::try_unwrap(counter) {
        Ok(counter) => counter.into_inner(),
        Err(_) => panic!("counter still shared"),
    }
}

#[test]
fn hundred_tasks_with_workers() {
    let sched = common::workers(4);
    let counter = Arc::new(Exclusive::new(0u64));
    let tasks: Vec<_> = (0..100).map(|_| sched.run(bump(&counter)).unwrap()).collect();
    sched.shutdown();
    assert_eq!(total(counter, &tasks), 100);
}

#[test]
fn hundred_tasks_on_the_calling_thread() {
    let sched = common::manual();
    let counter = Arc::new(Exclusive::new(0u64));
    let tasks: Vec<_> = (0..100).map(|_| sched.run(bump(&counter)).unwrap()).collect();
    sched.run_until_empty();
    let stats = sched.stats();
    assert_eq!(stats.tasks, 0);
    assert!(stats.is_quiescent());
    assert_eq!(total(counter, &tasks), 100);
}

#[test]
fn parent_joins_children() {
    let sched = common::workers(3);
    let counter = Arc::new(Exclusive::new(0u64));
    let children: Vec<_> = (0..100).map(|_| sched.spawn(bump(&counter)).unwrap()).collect();

    // The parent waits on every child in turn.
    let pending = parking_lot::Mutex::new(children.clone());
    let parent = sched
        .run(common::repeat(children.len(), move || {
            let child = pending.lock().pop().expect("one child per call");
            join_frame(child)
        }))
        .unwrap();
    for child in &children {
        sched.start(child);
    }
    assert!(common::finish(&parent).is_done());
    assert_eq!(total(counter, &children), 100);
}

#[test]
fn actor_counts_messages() {
    let sched = common::workers(4);
    let actor = Actor::new(0u64, |_, count, _| {
        *count += 1;
        StepResult::Done(Value::new(*count))
    });
    let tasks: Vec<_> = (0..100)
        .map(|_| sched.run(actor.send(Value::unit())).unwrap())
        .collect();
    let mut seen: Vec<u64> = tasks
        .iter()
        .map(|t| {
            let v = common::finish(t).into_result().unwrap();
            *v.downcast_ref::<u64>().unwrap()
        })
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, (1..=100).collect::<Vec<_>>());
    assert_eq!(actor.resource().owner(), None);
}
