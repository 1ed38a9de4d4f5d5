//! Run reports for export, import and health checks.

use crate::plan::{FailedRecord, SectionProgress};
use crate::verify::VerificationReport;
use chrono::{DateTime, Utc};
use memlift_types::error::MemliftError;
use memlift_types::memory::SectionKind;
use memlift_types::snapshot::AgentSnapshot;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Record count of one exported section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionCount {
    pub section: SectionKind,
    pub records: usize,
    /// Total the service reported, if it reported one.
    pub reported_total: Option<u64>,
    /// Whether the section's stream was fully read.
    pub complete: bool,
}

impl SectionCount {
    /// One entry per section, in canonical order.
    pub fn all(snapshot: &AgentSnapshot) -> Vec<Self> {
        SectionKind::ALL
            .into_iter()
            .map(|kind| Self {
                section: kind,
                records: snapshot.sections.len(kind),
                reported_total: snapshot.reported_totals.get(&kind).copied(),
                complete: snapshot.checksum(kind).is_some(),
            })
            .collect()
    }
}

/// Summary of an export run.
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub agent_id: String,
    /// Snapshot file written.
    pub path: PathBuf,
    pub exported_at: DateTime<Utc>,
    /// Size of the snapshot file in bytes.
    pub bytes: u64,
    pub sections: Vec<SectionCount>,
}

impl ExportReport {
    /// Total records exported.
    pub fn total_records(&self) -> usize {
        self.sections.iter().map(|s| s.records).sum()
    }

    /// Generate a human-readable Markdown summary.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# Export Report: {}\n\n", self.agent_id));
        out.push_str(&format!("- File: `{}`\n", self.path.display()));
        out.push_str(&format!("- Exported at: {}\n", self.exported_at.to_rfc3339()));
        out.push_str(&format!("- Records: {}\n\n", self.total_records()));

        out.push_str("| Section | Records | Reported |\n");
        out.push_str("|---------|---------|----------|\n");
        for s in &self.sections {
            out.push_str(&format!(
                "| {} | {} | {} |\n",
                s.section,
                s.records,
                s.reported_total.map(|t| t.to_string()).unwrap_or_else(|| "-".into())
            ));
        }
        out
    }

    /// Print the report to stdout in a friendly format.
    pub fn print_summary(&self) {
        println!("\n  Export complete: {}\n", self.agent_id);
        for s in &self.sections {
            println!("    {:<18} {}", s.section.to_string(), s.records);
        }
        println!("\n  Saved to {} ({} bytes)", self.path.display(), self.bytes);
        println!("\n  Next step:");
        println!("    memlift import {}", self.path.display());
    }
}

/// An export that stopped before every section was read.
#[derive(Debug, Serialize)]
pub struct ExportFailure {
    pub agent_id: String,
    #[serde(serialize_with = "as_display")]
    pub error: MemliftError,
    /// Diagnostic draft written next to the intended output, if writing it
    /// succeeded.
    pub partial: Option<PathBuf>,
    /// What each section held when the export stopped.
    pub sections: Vec<SectionCount>,
}

impl ExportFailure {
    /// Print the per-section state to stdout.
    pub fn print_summary(&self) {
        println!("\n  Export failed: {}\n", self.agent_id);
        for s in &self.sections {
            let state = if s.complete { "complete" } else { "incomplete" };
            let reported = s
                .reported_total
                .map(|t| format!(" of {t} reported"))
                .unwrap_or_default();
            println!("    {:<18} {}{reported} ({state})", s.section.to_string(), s.records);
        }
        if let Some(path) = &self.partial {
            println!("\n  Partial snapshot for diagnosis: {}", path.display());
        }
    }
}

impl fmt::Display for ExportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "export of {} failed: {}", self.agent_id, self.error)
    }
}

impl std::error::Error for ExportFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

fn as_display<T: fmt::Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// How an import run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportOutcome {
    /// Every record is on the target.
    Completed,
    /// Some records failed and are listed in the report.
    Partial,
    /// The run stopped early on a non-recoverable error.
    Fatal,
    /// The run was interrupted; a checkpoint was left behind.
    Interrupted,
}

impl fmt::Display for ImportOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Partial => write!(f, "partial"),
            Self::Fatal => write!(f, "failed"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Summary of an import run.
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub snapshot_path: PathBuf,
    pub source_agent_id: String,
    pub target_agent_id: String,
    pub run_id: String,
    /// Whether this run picked up an earlier checkpoint.
    pub resumed: bool,
    pub outcome: ImportOutcome,
    /// The error that stopped the run, for `Fatal` outcomes.
    pub fatal_error: Option<String>,
    pub sections: BTreeMap<SectionKind, SectionProgress>,
    pub failed: Vec<FailedRecord>,
    /// Checkpoint left behind for a later resume.
    pub checkpoint: Option<PathBuf>,
    /// Post-import verification, when requested.
    pub verification: Option<VerificationReport>,
    /// Why requested verification could not read live state.
    pub verification_error: Option<String>,
}

impl ImportReport {
    /// Whether the run finished and any requested verification passed.
    pub fn succeeded(&self) -> bool {
        self.outcome == ImportOutcome::Completed
            && self.verification_error.is_none()
            && self.verification.as_ref().map_or(true, |v| v.passed())
    }

    /// Generate a human-readable Markdown summary.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "# Import Report: {} -> {}\n\n",
            self.source_agent_id, self.target_agent_id
        ));
        out.push_str(&format!("- Snapshot: `{}`\n", self.snapshot_path.display()));
        let resumed = if self.resumed { " (resumed)" } else { "" };
        out.push_str(&format!("- Run: {}{resumed}\n", self.run_id));
        out.push_str(&format!("- Outcome: {}\n\n", self.outcome));

        out.push_str(
            "| Section | Total | Written | Already present | Kept | Failed | Not attempted |\n",
        );
        out.push_str(
            "|---------|-------|---------|-----------------|------|--------|---------------|\n",
        );
        for (kind, p) in &self.sections {
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} | {} |\n",
                kind,
                p.total,
                p.written,
                p.already_present,
                p.kept_existing,
                p.failed.len(),
                p.not_attempted.len()
            ));
        }

        if !self.failed.is_empty() {
            out.push_str("\n## Failed records\n\n");
            for f in &self.failed {
                out.push_str(&format!("- [{}] {}: {}\n", f.section, f.record_id, f.error));
            }
        }
        if let Some(err) = &self.fatal_error {
            out.push_str(&format!("\n## Error\n\n{err}\n"));
        }
        if let Some(v) = &self.verification {
            out.push('\n');
            out.push_str(&v.to_markdown());
        }
        if let Some(err) = &self.verification_error {
            out.push_str(&format!("\n## Verification\n\nCould not read live state: {err}\n"));
        }
        out
    }

    /// Print the report to stdout in a friendly format.
    pub fn print_summary(&self) {
        let resumed = if self.resumed { " (resumed)" } else { "" };
        println!(
            "\n  Import {}{resumed}: {} -> {}\n",
            self.outcome, self.source_agent_id, self.target_agent_id
        );
        for (kind, p) in &self.sections {
            let mut line =
                format!("    {:<18} {}/{} written", kind.to_string(), p.written, p.total);
            if p.already_present > 0 {
                line.push_str(&format!(", {} already present", p.already_present));
            }
            if p.kept_existing > 0 {
                line.push_str(&format!(", {} kept", p.kept_existing));
            }
            if !p.failed.is_empty() {
                line.push_str(&format!(", {} failed", p.failed.len()));
            }
            if !p.not_attempted.is_empty() {
                line.push_str(&format!(", {} not attempted", p.not_attempted.len()));
            }
            println!("{line}");
        }

        if !self.failed.is_empty() {
            println!("\n  Failed records:");
            for f in &self.failed {
                println!("    [{}] {}: {}", f.section, f.record_id, f.error);
            }
        }
        if let Some(err) = &self.fatal_error {
            println!("\n  Error: {err}");
        }
        if let Some(v) = &self.verification {
            let failures = v.failures();
            if failures.is_empty() {
                println!("\n  Verification passed ({} checks)", v.checks.len());
            } else {
                println!("\n  Verification FAILED:");
                for c in failures {
                    let section = c.section.map(|s| format!(" [{s}]")).unwrap_or_default();
                    println!(
                        "    {}{section}: expected {}, got {}",
                        c.check, c.expected, c.actual
                    );
                }
            }
        }
        if let Some(err) = &self.verification_error {
            println!("\n  Verification could not run: {err}");
        }
        if let Some(path) = &self.checkpoint {
            println!("\n  Checkpoint saved to {}", path.display());
            println!("  Re-run the same import to resume.");
        }
        if self.outcome == ImportOutcome::Completed {
            println!("\n  Next steps:");
            println!("    Point your runtime at agent id {}", self.target_agent_id);
            println!("    (e.g. MEMLIFT_AGENT_ID={})", self.target_agent_id);
        }
    }
}

/// Liveness of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceHealth {
    pub url: String,
    pub ok: bool,
    pub error: Option<String>,
}

/// Liveness of source and target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub source: ServiceHealth,
    pub target: ServiceHealth,
}

impl HealthReport {
    /// Whether both services answered.
    pub fn healthy(&self) -> bool {
        self.source.ok && self.target.ok
    }
}
