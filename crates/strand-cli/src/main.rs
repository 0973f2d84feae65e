// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Strand CLI - runs canned workloads against the scheduler.

mod commands;
mod help;
mod output;

use std::env;
use std::process;

use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_env("STRAND_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .init();
}

fn main() {
    output::init();
    init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        help::print_usage();
        return;
    }

    let rest = &args[2..];
    let result = match args[1].as_str() {
        "counter" => commands::counter::cmd_counter(rest),
        "deadlock" => commands::deadlock::cmd_deadlock(rest),
        "pingpong" => commands::pingpong::cmd_pingpong(rest),
        "help" | "--help" | "-h" => {
            help::print_usage();
            return;
        }
        "version" | "--version" | "-V" => {
            println!(
                "{} {}",
                output::title("strand"),
                output::version(env!("CARGO_PKG_VERSION"))
            );
            return;
        }
        other => {
            eprintln!("{}: unknown command `{}`", output::error_label(), other);
            eprintln!();
            help::print_usage();
            process::exit(1);
        }
    };

    match result {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(msg) => {
            eprintln!("{}: {}", output::error_label(), msg);
            process::exit(2);
        }
    }
}
