//! Subcommand handlers. Each returns the process exit status.

pub mod health;
pub mod inspect;
pub mod migrate;

use crate::ui;
use memlift_migrate::ExitStatus;
use memlift_types::error::MemliftError;
use serde::Serialize;

/// Print a value as pretty JSON on stdout.
pub(crate) fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => ui::error(&format!("could not serialize output: {e}")),
    }
}

/// Report a command error and map it to an exit status.
pub(crate) fn fail(err: &MemliftError, json: bool) -> ExitStatus {
    let status = ExitStatus::from_error(err);
    if json {
        print_json(&serde_json::json!({
            "error": err.to_string(),
            "exit_code": status.code(),
        }));
    } else {
        ui::error(&err.to_string());
        if err.is_snapshot_error() {
            ui::hint("re-export the agent to produce a fresh snapshot");
        }
    }
    status
}
