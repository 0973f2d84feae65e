// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Help text for CLI commands.

use crate::output;

pub fn print_usage() {
    println!(
        "{} {} - drive the strand scheduler with canned workloads",
        output::title("strand"),
        output::version(env!("CARGO_PKG_VERSION"))
    );
    println!();
    println!(
        "{}: {} {} {}",
        output::section_header("Usage"),
        output::command("strand"),
        output::arg("<command>"),
        output::arg("[options]")
    );
    println!();
    println!("{}", output::section_header("Scenarios:"));
    println!(
        "  {} {}  Tasks increment one shared counter",
        output::command("counter"),
        output::arg("[--tasks N] [--workers N]")
    );
    println!(
        "  {} {}            Two tasks take two resources in opposite order",
        output::command("deadlock"),
        output::arg("[--workers N]")
    );
    println!(
        "  {} {}  Two tasks message one actor in turns",
        output::command("pingpong"),
        output::arg("[--rounds N] [--workers N]")
    );
    println!();
    println!("{}", output::section_header("Other:"));
    println!("  {}      Show this help", output::command("help"));
    println!("  {}   Show version", output::command("version"));
    println!();
    println!("{}", output::section_header("Environment:"));
    println!(
        "  {}                 Worker threads (default: available cores)",
        output::arg("STRAND_WORKERS")
    );
    println!(
        "  {}      on/off (default: on)",
        output::arg("STRAND_DEADLOCK_DETECTION")
    );
    println!(
        "  {}                     Log filter, e.g. debug or strand_rt=trace",
        output::arg("STRAND_LOG")
    );
}
