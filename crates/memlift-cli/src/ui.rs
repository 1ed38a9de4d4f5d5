//! Terminal output for human-readable summaries.
//!
//! Summaries go to stdout. Errors go to stderr next to the log stream.

use colored::Colorize;

const LABEL_WIDTH: usize = 11;

/// One verification or health line with a pass/fail mark.
pub fn check(passed: bool, msg: &str) {
    if passed {
        println!("  {} {msg}", "\u{2714}".bright_green());
    } else {
        println!("  {} {}", "\u{2718}".bright_red(), msg.bright_red());
    }
}

/// Block heading, preceded by a blank line.
pub fn heading(title: &str) {
    println!();
    println!("  {} {}", ">>".bright_cyan().bold(), title.bold());
}

/// Aligned "Label:  value" line.
pub fn field(label: &str, value: &str) {
    println!("  {:<LABEL_WIDTH$}{value}", format!("{label}:"));
}

/// Aligned field whose value needs attention.
pub fn field_warn(label: &str, value: &str) {
    println!("  {:<LABEL_WIDTH$}{}", format!("{label}:"), value.bright_yellow());
}

pub fn hint(msg: &str) {
    println!();
    println!("  {} {}", "hint:".dimmed(), msg.dimmed());
}

/// Error line on stderr.
pub fn error(msg: &str) {
    eprintln!("  {} {}", "error:".bright_red().bold(), msg);
}
