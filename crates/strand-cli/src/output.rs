// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Terminal styling for scenario reports.

use colored::{ColoredString, Colorize};

/// Apply `NO_COLOR` / `FORCE_COLOR`. Without either, `colored` decides from
/// whether stdout is a terminal.
pub fn init() {
    if std::env::var_os("NO_COLOR").is_some() {
        colored::control::set_override(false);
    } else if std::env::var_os("FORCE_COLOR").is_some() {
        colored::control::set_override(true);
    }
}

pub fn error_label() -> ColoredString {
    "error".red().bold()
}

/// Closing line of a scenario: `None` when it passed.
pub fn banner(scenario: &str, failure: Option<&str>) -> String {
    let text = match failure {
        None => format!("{} OK", scenario).green().bold(),
        Some(reason) => format!("{} FAILED: {}", scenario, reason).red().bold(),
    };
    format!("{} {} {}", "===".dimmed(), text, "===".dimmed())
}

pub fn status(ok: bool) -> ColoredString {
    if ok {
        "✓".green()
    } else {
        "✗".red()
    }
}

pub fn title(name: &str) -> ColoredString {
    name.bold()
}

pub fn version(v: &str) -> ColoredString {
    v.dimmed()
}

pub fn section_header(header: &str) -> ColoredString {
    header.yellow().bold()
}

pub fn command(name: &str) -> ColoredString {
    name.green()
}

pub fn arg(name: &str) -> ColoredString {
    name.cyan()
}

pub fn label(name: &str) -> ColoredString {
    name.dimmed()
}

pub fn task_id(id: strand_rt::TaskId) -> ColoredString {
    id.to_string().cyan()
}
