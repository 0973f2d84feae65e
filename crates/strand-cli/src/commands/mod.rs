// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scenario commands.

pub mod counter;
pub mod deadlock;
pub mod pingpong;

use std::collections::HashMap;
use std::time::Duration;

use strand_rt::{Scheduler, SchedulerConfig, Stats, TaskRef};

use crate::output;

/// How long a scenario task may take before we call it hung.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(60);

/// `--name value` pairs after the command name.
pub struct Flags {
    values: HashMap<String, String>,
}

impl Flags {
    pub fn parse(args: &[String], allowed: &[&str]) -> Result<Self, String> {
        let mut values = HashMap::new();
        let mut iter = args.iter();
        while let Some(flag) = iter.next() {
            let Some(name) = flag.strip_prefix("--") else {
                return Err(format!("unexpected argument `{}`", flag));
            };
            if !allowed.contains(&name) {
                return Err(format!("unknown option `{}`", flag));
            }
            let Some(value) = iter.next() else {
                return Err(format!("option `{}` needs a value", flag));
            };
            values.insert(name.to_string(), value.clone());
        }
        Ok(Self { values })
    }

    pub fn usize(&self, name: &str) -> Result<Option<usize>, String> {
        match self.values.get(name) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| format!("--{} expects a number, got `{}`", name, raw)),
        }
    }
}

/// Environment config, with `workers` taking precedence when given.
pub fn scheduler(workers: Option<usize>) -> Result<Scheduler, String> {
    let mut config = SchedulerConfig::from_env().map_err(|e| e.to_string())?;
    if let Some(n) = workers {
        config.worker_threads = Some(n);
    }
    Scheduler::new(config).map_err(|e| e.to_string())
}

/// Wait for every task; false if one of them did not finish in time.
pub fn await_all(tasks: &[TaskRef]) -> bool {
    tasks
        .iter()
        .all(|t| t.join_timeout(TASK_TIMEOUT).is_some())
}

pub fn print_stats(sched: &Scheduler) {
    let Stats {
        tasks,
        runnable,
        waiting_external,
        blocked,
        ready_queue,
    } = sched.stats();
    println!(
        "  {} workers={} tasks={} runnable={} external={} blocked={} queued={}",
        output::label("scheduler"),
        sched.worker_count(),
        tasks,
        runnable,
        waiting_external,
        blocked,
        ready_queue
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_known_flags() {
        let flags = Flags::parse(&args(&["--tasks", "12"]), &["tasks", "workers"]).unwrap();
        assert_eq!(flags.usize("tasks").unwrap(), Some(12));
        assert_eq!(flags.usize("workers").unwrap(), None);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(Flags::parse(&args(&["--nope", "1"]), &["tasks"]).is_err());
        assert!(Flags::parse(&args(&["--tasks"]), &["tasks"]).is_err());
        assert!(Flags::parse(&args(&["tasks"]), &["tasks"]).is_err());
        let flags = Flags::parse(&args(&["--tasks", "many"]), &["tasks"]).unwrap();
        assert!(flags.usize("tasks").is_err());
    }
}
