//! `memlift health`.

use super::print_json;
use crate::ui;
use memlift_migrate::report::ServiceHealth;
use memlift_migrate::{ExitStatus, Orchestrator};

pub async fn cmd_health(orchestrator: &Orchestrator, json: bool) -> ExitStatus {
    let report = orchestrator.health().await;
    if json {
        print_json(&report);
    } else {
        ui::heading("Service health");
        print_service("source", &report.source);
        print_service("target", &report.target);
        if !report.healthy() {
            ui::hint("set --source-url/--target-url or MEMLIFT_SOURCE_URL/MEMLIFT_TARGET_URL");
        }
    }

    if report.healthy() {
        ExitStatus::Success
    } else {
        ExitStatus::Fetch
    }
}

fn print_service(name: &str, health: &ServiceHealth) {
    match &health.error {
        None if health.ok => ui::check(true, &format!("{name:<7} {}", health.url)),
        error => ui::check(false, &format!(
            "{name:<7} {}: {}",
            health.url,
            error.as_deref().unwrap_or("unreachable")
        )),
    }
}
