//! Import plans and resumable checkpoints.
//!
//! An `ImportPlan` tracks per-section progress for one import run. While the
//! run is in flight it is saved after every section; it is deleted when the
//! run completes and left behind when it fails, so a later run against the
//! same snapshot and target can pick it up.

use chrono::{DateTime, Utc};
use memlift_types::config::ConflictPolicy;
use memlift_types::error::{MemliftError, MemliftResult};
use memlift_types::memory::SectionKind;
use memlift_types::snapshot::{file_safe_id, AgentSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Order in which sections are written on import.
pub const IMPORT_ORDER: [SectionKind; 4] = [
    SectionKind::CoreBlocks,
    SectionKind::ToolDefs,
    SectionKind::ArchivalRecords,
    SectionKind::RecallMessages,
];

/// Where an import run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "section", rename_all = "snake_case")]
pub enum ImportState {
    Pending,
    Writing(SectionKind),
    Failed,
    Completed,
}

/// A record that could not be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRecord {
    pub section: SectionKind,
    /// Record id, block label or tool name.
    pub record_id: String,
    pub error: String,
}

/// Progress of one section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionProgress {
    /// Records the snapshot holds for this section.
    pub total: usize,
    /// Records a write was attempted for.
    pub attempted: usize,
    /// Records written by this run.
    pub written: usize,
    /// Records the target already held.
    pub already_present: usize,
    /// Core blocks left alone under `keep-existing`.
    pub kept_existing: usize,
    pub failed: Vec<FailedRecord>,
    /// Records never attempted because the section stopped early.
    pub not_attempted: Vec<String>,
    /// Set once every record of the section is on the target.
    pub complete: bool,
}

/// Per-section state of one import run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportPlan {
    pub run_id: String,
    pub source_agent_id: String,
    pub target_agent_id: String,
    /// Fingerprint of the snapshot this plan was made for.
    pub snapshot_fingerprint: String,
    pub snapshot_path: PathBuf,
    pub conflict_policy: ConflictPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: ImportState,
    pub sections: BTreeMap<SectionKind, SectionProgress>,
}

impl ImportPlan {
    /// A fresh plan with every section pending.
    pub fn new(
        snapshot: &AgentSnapshot,
        snapshot_path: &Path,
        target_agent_id: &str,
        conflict_policy: ConflictPolicy,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            source_agent_id: snapshot.source_agent_id.clone(),
            target_agent_id: target_agent_id.to_string(),
            snapshot_fingerprint: snapshot.fingerprint(),
            snapshot_path: snapshot_path.to_path_buf(),
            conflict_policy,
            created_at: now,
            updated_at: now,
            state: ImportState::Pending,
            sections: IMPORT_ORDER
                .into_iter()
                .map(|kind| {
                    (
                        kind,
                        SectionProgress {
                            total: snapshot.sections.len(kind),
                            ..Default::default()
                        },
                    )
                })
                .collect(),
        }
    }

    /// Whether this plan was made for `snapshot` imported into `target_agent_id`.
    pub fn matches(&self, snapshot: &AgentSnapshot, target_agent_id: &str) -> bool {
        self.source_agent_id == snapshot.source_agent_id
            && self.snapshot_fingerprint == snapshot.fingerprint()
            && self.target_agent_id == target_agent_id
    }

    /// Enter a section. Earlier progress on it is discarded: sections are
    /// always re-run in full and rely on upsert and dedup semantics.
    pub fn begin_section(&mut self, kind: SectionKind) -> &mut SectionProgress {
        self.state = ImportState::Writing(kind);
        self.updated_at = Utc::now();
        let progress = self.sections.entry(kind).or_default();
        *progress = SectionProgress {
            total: progress.total,
            ..Default::default()
        };
        progress
    }

    /// Leave a section, marking it complete if nothing failed or was skipped.
    pub fn finish_section(&mut self, kind: SectionKind) -> bool {
        self.updated_at = Utc::now();
        let progress = self.sections.entry(kind).or_default();
        progress.complete = progress.failed.is_empty() && progress.not_attempted.is_empty();
        progress.complete
    }

    /// Progress of a section.
    pub fn section(&self, kind: SectionKind) -> Option<&SectionProgress> {
        self.sections.get(&kind)
    }

    /// Whether `kind` finished in an earlier run.
    pub fn is_section_complete(&self, kind: SectionKind) -> bool {
        self.section(kind).is_some_and(|p| p.complete)
    }

    /// Whether every section is complete.
    pub fn is_complete(&self) -> bool {
        IMPORT_ORDER.iter().all(|k| self.is_section_complete(*k))
    }

    /// Every failed record across sections, in import order.
    pub fn failed_records(&self) -> Vec<FailedRecord> {
        IMPORT_ORDER
            .iter()
            .filter_map(|k| self.sections.get(k))
            .flat_map(|p| p.failed.iter().cloned())
            .collect()
    }

    /// Checkpoint file name: `{source_agent_id}_{run_id}.json`.
    pub fn file_name(&self) -> String {
        format!("{}_{}.json", file_safe_id(&self.source_agent_id), self.run_id)
    }
}

/// Directory of saved import plans.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path a plan is saved to.
    pub fn path_for(&self, plan: &ImportPlan) -> PathBuf {
        self.dir.join(plan.file_name())
    }

    /// Save a plan atomically and return its path.
    pub fn save(&self, plan: &ImportPlan) -> MemliftResult<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(plan);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(plan)?)?;
        std::fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), state = ?plan.state, "checkpoint saved");
        Ok(path)
    }

    /// Find the most recent unfinished plan for this snapshot and target.
    pub fn find(
        &self,
        snapshot: &AgentSnapshot,
        target_agent_id: &str,
    ) -> MemliftResult<Option<ImportPlan>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MemliftError::Io(e)),
        };
        let prefix = format!("{}_", file_safe_id(&snapshot.source_agent_id));

        let mut best: Option<ImportPlan> = None;
        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(&prefix) || !name.ends_with(".json") {
                continue;
            }
            let plan: ImportPlan = match std::fs::read(&path)
                .map_err(MemliftError::from)
                .and_then(|bytes| Ok(serde_json::from_slice(&bytes)?))
            {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring unreadable checkpoint");
                    continue;
                }
            };
            if plan.matches(snapshot, target_agent_id)
                && best.as_ref().map_or(true, |b| plan.updated_at > b.updated_at)
            {
                best = Some(plan);
            }
        }
        Ok(best)
    }

    /// Remove a plan's checkpoint. Missing files are fine.
    pub fn delete(&self, plan: &ImportPlan) -> MemliftResult<()> {
        match std::fs::remove_file(self.path_for(plan)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MemliftError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memlift_types::memory::CoreMemoryBlock;
    use memlift_types::snapshot::SnapshotSections;

    fn snapshot(agent: &str) -> AgentSnapshot {
        AgentSnapshot::from_sections(
            agent,
            Utc::now(),
            SnapshotSections {
                core_blocks: vec![CoreMemoryBlock {
                    label: "persona".into(),
                    content: "x".into(),
                    limit: 10,
                    metadata: Default::default(),
                }],
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_section_lifecycle() {
        let snap = snapshot("a1");
        let mut plan =
            ImportPlan::new(&snap, Path::new("a1.memlift"), "t1", ConflictPolicy::Overwrite);
        assert_eq!(plan.state, ImportState::Pending);
        assert_eq!(plan.section(SectionKind::CoreBlocks).unwrap().total, 1);

        let progress = plan.begin_section(SectionKind::CoreBlocks);
        progress.attempted = 1;
        progress.written = 1;
        assert!(plan.finish_section(SectionKind::CoreBlocks));
        assert_eq!(plan.state, ImportState::Writing(SectionKind::CoreBlocks));

        let progress = plan.begin_section(SectionKind::RecallMessages);
        progress.not_attempted.push("m9".into());
        assert!(!plan.finish_section(SectionKind::RecallMessages));
        assert!(!plan.is_complete());
    }

    #[test]
    fn test_begin_section_resets_progress() {
        let snap = snapshot("a1");
        let mut plan = ImportPlan::new(&snap, Path::new("x"), "t1", ConflictPolicy::Overwrite);
        plan.begin_section(SectionKind::ToolDefs).failed.push(FailedRecord {
            section: SectionKind::ToolDefs,
            record_id: "search".into(),
            error: "boom".into(),
        });
        assert_eq!(plan.failed_records().len(), 1);
        plan.begin_section(SectionKind::ToolDefs);
        assert!(plan.failed_records().is_empty());
    }

    #[test]
    fn test_checkpoint_save_find_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoints"));
        let snap = snapshot("team/agent");
        let plan = ImportPlan::new(&snap, Path::new("x"), "t1", ConflictPolicy::Overwrite);

        assert!(store.find(&snap, "t1").unwrap().is_none());
        let path = store.save(&plan).unwrap();
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("team_agent_"));

        assert_eq!(store.find(&snap, "t1").unwrap(), Some(plan.clone()));
        assert!(store.find(&snap, "other-target").unwrap().is_none());
        let mut reexported = snap.clone();
        reexported.exported_at += chrono::Duration::seconds(1);
        assert!(store.find(&reexported, "t1").unwrap().is_none());

        store.delete(&plan).unwrap();
        assert!(store.find(&snap, "t1").unwrap().is_none());
        store.delete(&plan).unwrap();
    }

    #[test]
    fn test_unreadable_checkpoints_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let snap = snapshot("a1");
        std::fs::write(dir.path().join("a1_garbage.json"), b"{not json").unwrap();
        assert!(store.find(&snap, "t1").unwrap().is_none());
    }
}
