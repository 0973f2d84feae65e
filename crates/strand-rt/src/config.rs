// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler configuration.

use std::env;
use std::time::Duration;

use crate::error::{Result, RuntimeError};

const MIN_STACK_SIZE: usize = 64 * 1024;
const MAX_WORKERS: usize = 1024;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Background workers. `None` uses the available parallelism; `Some(0)`
    /// starts none and the embedding thread drives `run_until_empty`.
    pub worker_threads: Option<usize>,
    pub thread_name_prefix: String,
    pub stack_size: Option<usize>,
    /// How long an idle worker sleeps before rechecking for work.
    pub idle_timeout: Duration,
    pub deadlock_detection: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            thread_name_prefix: "strand-worker".to_string(),
            stack_size: None,
            idle_timeout: Duration::from_millis(5),
            deadlock_detection: true,
        }
    }
}

impl SchedulerConfig {
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::new()
    }

    /// No background workers.
    pub fn manual() -> Self {
        Self {
            worker_threads: Some(0),
            ..Self::default()
        }
    }

    /// Defaults, overridden by `STRAND_WORKERS` and
    /// `STRAND_DEADLOCK_DETECTION` when set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = env::var("STRAND_WORKERS") {
            let n = raw.trim().parse::<usize>().map_err(|_| {
                RuntimeError::config(format!("STRAND_WORKERS must be a number, got `{}`", raw))
            })?;
            config.worker_threads = Some(n);
        }
        if let Ok(raw) = env::var("STRAND_DEADLOCK_DETECTION") {
            config.deadlock_detection = parse_flag(&raw).ok_or_else(|| {
                RuntimeError::config(format!(
                    "STRAND_DEADLOCK_DETECTION must be on/off, got `{}`",
                    raw
                ))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(n) = self.worker_threads {
            if n > MAX_WORKERS {
                return Err(RuntimeError::config(format!(
                    "worker_threads too large (max {})",
                    MAX_WORKERS
                )));
            }
        }
        if self.thread_name_prefix.is_empty() {
            return Err(RuntimeError::config("thread_name_prefix must not be empty"));
        }
        if let Some(size) = self.stack_size {
            if size < MIN_STACK_SIZE {
                return Err(RuntimeError::config(format!(
                    "stack_size must be at least {} bytes",
                    MIN_STACK_SIZE
                )));
            }
        }
        if self.idle_timeout.is_zero() {
            return Err(RuntimeError::config("idle_timeout must be > 0"));
        }
        Ok(())
    }

    /// Number of background workers to start.
    pub fn resolved_worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4)
        })
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SchedulerConfig::default(),
        }
    }

    pub fn worker_threads(mut self, n: usize) -> Self {
        self.config.worker_threads = Some(n);
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn deadlock_detection(mut self, enable: bool) -> Self {
        self.config.deadlock_detection = enable;
        self
    }

    pub fn build(self) -> Result<SchedulerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
