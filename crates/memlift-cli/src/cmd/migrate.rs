//! `memlift export` and `memlift import`.

use super::{fail, print_json};
use crate::ui;
use memlift_migrate::{ExitStatus, ImportOptions, Orchestrator};
use memlift_types::config::ConflictPolicy;
use memlift_types::error::MemliftError;
use std::path::{Path, PathBuf};

pub async fn cmd_export(
    orchestrator: &Orchestrator,
    agent_id: Option<String>,
    out: Option<PathBuf>,
    json: bool,
) -> ExitStatus {
    let Some(agent_id) = agent_id.or_else(|| orchestrator.config().agent_id.clone()) else {
        return fail(
            &MemliftError::Config(
                "no agent id given; pass one or set MEMLIFT_AGENT_ID".to_string(),
            ),
            json,
        );
    };

    match orchestrator.export(&agent_id, out.as_deref()).await {
        Ok(report) => {
            if json {
                print_json(&report);
            } else {
                report.print_summary();
            }
            ExitStatus::Success
        }
        Err(failure) => {
            let status = ExitStatus::from_error(&failure.error);
            if json {
                print_json(&serde_json::json!({
                    "error": failure.error.to_string(),
                    "exit_code": status.code(),
                    "partial": failure.partial,
                    "sections": failure.sections,
                }));
            } else {
                failure.print_summary();
                ui::error(&failure.error.to_string());
            }
            status
        }
    }
}

pub async fn cmd_import(
    orchestrator: &Orchestrator,
    path: &Path,
    verify: bool,
    target_agent_id: Option<String>,
    conflict: Option<ConflictPolicy>,
    json: bool,
) -> ExitStatus {
    let options = ImportOptions {
        verify,
        target_agent_id,
        conflict,
    };

    match orchestrator.import(path, &options).await {
        Ok(report) => {
            if json {
                print_json(&report);
            } else {
                report.print_summary();
                if report.verification.is_none() && report.succeeded() {
                    let agent_flag = if report.target_agent_id == report.source_agent_id {
                        String::new()
                    } else {
                        format!(" --agent-id {}", report.target_agent_id)
                    };
                    ui::hint(&format!(
                        "run `memlift verify {} --against target{agent_flag}` to compare",
                        path.display()
                    ));
                }
            }
            ExitStatus::for_import(&report)
        }
        Err(e) => fail(&e, json),
    }
}
