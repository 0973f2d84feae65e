// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `strand pingpong`: two tasks take turns messaging one actor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use strand_rt::{Actor, Frame, FrameRef, StepResult, Value};

use super::Flags;
use crate::output;

#[derive(Debug, Default, Clone, Copy)]
struct Rally {
    pings: usize,
    pongs: usize,
}

#[derive(Debug, Clone, Copy)]
enum Shot {
    Ping,
    Pong,
}

/// Send `shot` `rounds` times, yielding to the other player after each
/// reply.
fn player(actor: Actor<Rally>, shot: Shot, rounds: usize) -> FrameRef {
    let steps = AtomicUsize::new(0);
    Frame::labeled("player", move |cx, value, error| {
        if let Some(e) = error {
            return StepResult::Throw(e);
        }
        let n = steps.fetch_add(1, Ordering::SeqCst);
        if n % 2 == 1 {
            // `value` is the actor's reply to send number (n + 1) / 2.
            if (n + 1) / 2 >= rounds {
                return StepResult::Done(value);
            }
            cx.task().yield_now();
            return StepResult::Suspended;
        }
        if rounds == 0 {
            return StepResult::Done(value);
        }
        cx.call(actor.send(Value::new(shot)), Value::unit())
    })
}

pub fn cmd_pingpong(args: &[String]) -> Result<bool, String> {
    let flags = Flags::parse(args, &["rounds", "workers"])?;
    let rounds = flags.usize("rounds")?.unwrap_or(1000);
    let sched = super::scheduler(flags.usize("workers")?)?;

    let actor = Actor::new(Rally::default(), |_, rally, msg| {
        match msg.downcast_ref::<Shot>() {
            Some(Shot::Ping) => rally.pings += 1,
            Some(Shot::Pong) => rally.pongs += 1,
            None => {}
        }
        StepResult::Done(Value::new(*rally))
    });

    let start = Instant::now();
    let players = [
        sched
            .run(player(actor.clone(), Shot::Ping, rounds))
            .map_err(|e| e.to_string())?,
        sched
            .run(player(actor.clone(), Shot::Pong, rounds))
            .map_err(|e| e.to_string())?,
    ];
    sched.shutdown();
    let elapsed = start.elapsed();

    if !super::await_all(&players) {
        println!("{}", output::banner("pingpong", Some("players did not finish")));
        return Ok(false);
    }

    let mut last = Rally::default();
    for task in &players {
        match task.join().into_result() {
            Ok(value) => {
                if let Some(rally) = value.downcast_ref::<Rally>() {
                    if rally.pings + rally.pongs > last.pings + last.pongs {
                        last = *rally;
                    }
                }
            }
            Err(e) => {
                println!("{}", output::banner("pingpong", Some(&e.to_string())));
                return Ok(false);
            }
        }
    }

    println!(
        "  {} pings={} pongs={} ({:.2?})",
        output::label("rally"),
        last.pings,
        last.pongs,
        elapsed
    );
    super::print_stats(&sched);

    if last.pings == rounds && last.pongs == rounds {
        println!("{}", output::banner("pingpong", None));
        Ok(true)
    } else {
        let reason = format!("expected {} each way", rounds);
        println!("{}", output::banner("pingpong", Some(&reason)));
        Ok(false)
    }
}
