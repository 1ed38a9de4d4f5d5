//! `memlift verify` and `memlift inspect`.

use super::{fail, print_json};
use crate::ui;
use memlift_migrate::format::{self, SnapshotSummary};
use memlift_migrate::{Against, ExitStatus, Orchestrator, VerificationReport};
use std::path::Path;

pub async fn cmd_verify(
    orchestrator: &Orchestrator,
    path: &Path,
    against: Against,
    agent_id: Option<&str>,
    json: bool,
) -> ExitStatus {
    match orchestrator.verify(path, against, agent_id).await {
        Ok(report) => {
            if json {
                print_json(&report);
            } else {
                print_verification(&report);
            }
            ExitStatus::for_verification(&report)
        }
        Err(e) => fail(&e, json),
    }
}

fn print_verification(report: &VerificationReport) {
    ui::heading(&format!(
        "Verify {} against {} ({})",
        report.snapshot_agent_id, report.against, report.live_agent_id
    ));
    for check in &report.checks {
        let name = match check.section {
            Some(section) => format!("{} [{section}]", check.check),
            None => check.check.to_string(),
        };
        if check.passed {
            ui::check(true, &name);
        } else {
            ui::check(
                false,
                &format!("{name}: expected {}, got {}", check.expected, check.actual),
            );
        }
    }
    println!();
    let failed = report.failures().len();
    if failed == 0 {
        ui::field("Result", &format!("passed ({} checks)", report.checks.len()));
    } else {
        let total = report.checks.len();
        ui::field_warn("Result", &format!("{failed} of {total} checks failed"));
    }
}

/// Offline: needs no configuration or services.
pub fn cmd_inspect(path: &Path, json: bool) -> ExitStatus {
    match format::inspect(path) {
        Ok(summary) => {
            if json {
                print_json(&summary);
            } else {
                print_summary(&summary);
            }
            ExitStatus::Success
        }
        Err(e) => fail(&e, json),
    }
}

fn print_summary(summary: &SnapshotSummary) {
    ui::heading(&format!("Snapshot {}", summary.path.display()));
    ui::field("Agent", &summary.source_agent_id);
    ui::field("Exported", &summary.exported_at.to_rfc3339());
    ui::field("Format", &format!("v{}", summary.format_version));
    ui::field("Size", &format!("{} bytes", summary.file_size));
    if !summary.extra_fields.is_empty() {
        ui::field_warn("Unknown", &summary.extra_fields.join(", "));
    }
    println!();
    for section in &summary.sections {
        let reported = section
            .reported_total
            .map(|t| format!(" (service reported {t})"))
            .unwrap_or_default();
        let name = section.section.to_string();
        let line = format!("{name:<16} {:>7} records{reported}", section.records);
        match &section.checksum {
            Some(checksum) if section.complete => {
                let prefix = &checksum[..checksum.len().min(12)];
                ui::check(true, &format!("{line}  sha256:{prefix}"))
            }
            _ => ui::check(false, &format!("{line}  incomplete")),
        }
    }
}
