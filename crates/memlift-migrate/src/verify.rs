//! Compare a snapshot against live state read back from a service.
//!
//! Verification is read-only. Each check is independent so a report shows
//! every disagreement at once rather than stopping at the first.

use memlift_types::memory::{CoreMemoryBlock, SectionKind};
use memlift_types::snapshot::AgentSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Which service the live state was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Against {
    Source,
    Target,
}

impl fmt::Display for Against {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Target => write!(f, "target"),
        }
    }
}

/// Named verification checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    /// Section record counts match exactly.
    RecordCount,
    /// Section checksums over canonical content match.
    Checksum,
    /// Core block labels are set-equal with identical content.
    CoreBlocks,
    /// Recall message ids appear in the same order.
    RecallOrder,
    /// Service-reported totals equal the records actually fetched.
    Pagination,
    /// Stored checksums match a recomputation and no section is incomplete.
    SnapshotIntegrity,
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RecordCount => "record_count",
            Self::Checksum => "checksum",
            Self::CoreBlocks => "core_blocks",
            Self::RecallOrder => "recall_order",
            Self::Pagination => "pagination",
            Self::SnapshotIntegrity => "snapshot_integrity",
        };
        f.write_str(name)
    }
}

/// Outcome of one check on one section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check: Check,
    /// Section the check ran on, if it is section-scoped.
    pub section: Option<SectionKind>,
    pub passed: bool,
    /// What the snapshot says.
    pub expected: String,
    /// What was observed.
    pub actual: String,
}

/// Every check result of one verification run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Agent the snapshot was taken from.
    pub snapshot_agent_id: String,
    /// Agent whose live state was compared.
    pub live_agent_id: String,
    pub against: Against,
    pub checks: Vec<CheckResult>,
}

impl VerificationReport {
    /// Whether every check passed.
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// Failed checks only.
    pub fn failures(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }

    /// Human-readable Markdown summary.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "# Verification: {} against {} agent {}\n\n",
            self.snapshot_agent_id, self.against, self.live_agent_id
        ));
        let failures = self.failures();
        out.push_str(&format!(
            "- Checks: {}\n- Failed: {}\n\n",
            self.checks.len(),
            failures.len()
        ));
        if !failures.is_empty() {
            out.push_str("| Check | Section | Expected | Actual |\n");
            out.push_str("|-------|---------|----------|--------|\n");
            for c in failures {
                out.push_str(&format!(
                    "| {} | {} | {} | {} |\n",
                    c.check,
                    c.section.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                    c.expected,
                    c.actual
                ));
            }
        }
        out
    }
}

/// Compares a snapshot with live state.
#[derive(Debug, Default)]
pub struct Verifier;

impl Verifier {
    /// Run every check. `live` is live state captured through the same
    /// builder that produces snapshots.
    pub fn verify(
        &self,
        snapshot: &AgentSnapshot,
        live: &AgentSnapshot,
        against: Against,
    ) -> VerificationReport {
        let mut checks = Vec::new();
        for kind in SectionKind::ALL {
            checks.push(record_count(snapshot, live, kind));
        }
        for kind in SectionKind::ALL {
            checks.push(checksum(snapshot, live, kind));
        }
        checks.push(core_blocks(snapshot, live));
        checks.push(recall_order(snapshot, live));
        for kind in SectionKind::ALL {
            checks.push(pagination(snapshot, live, kind));
        }
        checks.push(snapshot_integrity(snapshot));

        VerificationReport {
            snapshot_agent_id: snapshot.source_agent_id.clone(),
            live_agent_id: live.source_agent_id.clone(),
            against,
            checks,
        }
    }
}

fn result(
    check: Check,
    section: Option<SectionKind>,
    expected: String,
    actual: String,
) -> CheckResult {
    CheckResult {
        check,
        section,
        passed: expected == actual,
        expected,
        actual,
    }
}

fn record_count(snapshot: &AgentSnapshot, live: &AgentSnapshot, kind: SectionKind) -> CheckResult {
    result(
        Check::RecordCount,
        Some(kind),
        snapshot.sections.len(kind).to_string(),
        live.sections.len(kind).to_string(),
    )
}

fn checksum(snapshot: &AgentSnapshot, live: &AgentSnapshot, kind: SectionKind) -> CheckResult {
    let compute = |s: &AgentSnapshot| {
        s.sections
            .checksum(kind)
            .unwrap_or_else(|e| format!("error: {e}"))
    };
    result(Check::Checksum, Some(kind), compute(snapshot), compute(live))
}

fn core_blocks(snapshot: &AgentSnapshot, live: &AgentSnapshot) -> CheckResult {
    let by_label = |blocks: &[CoreMemoryBlock]| -> BTreeMap<String, CoreMemoryBlock> {
        blocks.iter().map(|b| (b.label.clone(), b.clone())).collect()
    };
    let expected = by_label(&snapshot.sections.core_blocks);
    let actual = by_label(&live.sections.core_blocks);

    let mut missing = Vec::new();
    let mut differing = Vec::new();
    for (label, block) in &expected {
        match actual.get(label) {
            None => missing.push(label.as_str()),
            Some(live_block) if live_block != block => differing.push(label.as_str()),
            Some(_) => {}
        }
    }
    let unexpected: Vec<&str> = actual
        .keys()
        .filter(|l| !expected.contains_key(*l))
        .map(String::as_str)
        .collect();

    let passed = missing.is_empty() && differing.is_empty() && unexpected.is_empty();
    let mut problems = Vec::new();
    if !missing.is_empty() {
        problems.push(format!("missing [{}]", missing.join(", ")));
    }
    if !differing.is_empty() {
        problems.push(format!("differs [{}]", differing.join(", ")));
    }
    if !unexpected.is_empty() {
        problems.push(format!("unexpected [{}]", unexpected.join(", ")));
    }
    let labels = expected.keys().cloned().collect::<Vec<_>>().join(", ");
    CheckResult {
        check: Check::CoreBlocks,
        section: Some(SectionKind::CoreBlocks),
        passed,
        expected: format!("[{labels}]"),
        actual: if passed {
            format!("[{labels}]")
        } else {
            problems.join("; ")
        },
    }
}

fn recall_order(snapshot: &AgentSnapshot, live: &AgentSnapshot) -> CheckResult {
    let expected = snapshot.sections.record_ids(SectionKind::RecallMessages);
    let actual = live.sections.record_ids(SectionKind::RecallMessages);
    let passed = expected == actual;
    let describe = |ids: &[String]| match ids.len() {
        0..=6 => format!("[{}]", ids.join(", ")),
        n => format!("[{}, ... {} more]", ids[..5].join(", "), n - 5),
    };
    let first_difference = expected
        .iter()
        .zip(&actual)
        .position(|(a, b)| a != b)
        .unwrap_or_else(|| expected.len().min(actual.len()));
    CheckResult {
        check: Check::RecallOrder,
        section: Some(SectionKind::RecallMessages),
        passed,
        expected: describe(&expected),
        actual: if passed {
            describe(&actual)
        } else {
            format!("{} (first difference at position {first_difference})", describe(&actual))
        },
    }
}

fn pagination(snapshot: &AgentSnapshot, live: &AgentSnapshot, kind: SectionKind) -> CheckResult {
    let mut problems = Vec::new();
    for (name, s) in [("snapshot", snapshot), ("live", live)] {
        if let Some((total, fetched)) = s.total_mismatch(kind) {
            problems.push(format!("{name}: service reported {total}, fetched {fetched}"));
        }
    }
    CheckResult {
        check: Check::Pagination,
        section: Some(kind),
        passed: problems.is_empty(),
        expected: "reported totals equal fetched records".into(),
        actual: if problems.is_empty() {
            "consistent".into()
        } else {
            problems.join("; ")
        },
    }
}

fn snapshot_integrity(snapshot: &AgentSnapshot) -> CheckResult {
    let mut problems = Vec::new();
    let incomplete = snapshot.incomplete_sections();
    if !incomplete.is_empty() {
        let names: Vec<String> = incomplete.iter().map(|k| k.to_string()).collect();
        problems.push(format!("incomplete [{}]", names.join(", ")));
    }
    match snapshot.checksum_mismatches() {
        Ok(mismatches) => {
            for m in mismatches {
                problems.push(format!("{} stored {} computed {}", m.section, m.stored, m.computed));
            }
        }
        Err(e) => problems.push(format!("checksum error: {e}")),
    }
    CheckResult {
        check: Check::SnapshotIntegrity,
        section: None,
        passed: problems.is_empty(),
        expected: "all sections complete with matching checksums".into(),
        actual: if problems.is_empty() {
            "ok".into()
        } else {
            problems.join("; ")
        },
    }
}
