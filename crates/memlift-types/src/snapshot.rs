//! The snapshot aggregate: one agent's full memory footprint at export time.

use crate::checksum::{section_checksum, sha256_hex};
use crate::error::MemliftResult;
use crate::memory::{ArchivalRecord, CoreMemoryBlock, RecallMessage, SectionKind, ToolDefinition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Highest snapshot format version this build reads and the version it writes.
pub const FORMAT_VERSION: u32 = 1;

/// File extension used for snapshot files.
pub const SNAPSHOT_EXTENSION: &str = "memlift";

/// Record contents of the four memory sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSections {
    /// Core memory blocks.
    pub core_blocks: Vec<CoreMemoryBlock>,
    /// Archival records, in source insertion order.
    pub archival_records: Vec<ArchivalRecord>,
    /// Recall messages, in chronological order.
    pub recall_messages: Vec<RecallMessage>,
    /// Tool and config definitions.
    pub tool_defs: Vec<ToolDefinition>,
}

impl SnapshotSections {
    /// Number of records in a section.
    pub fn len(&self, kind: SectionKind) -> usize {
        match kind {
            SectionKind::CoreBlocks => self.core_blocks.len(),
            SectionKind::ArchivalRecords => self.archival_records.len(),
            SectionKind::RecallMessages => self.recall_messages.len(),
            SectionKind::ToolDefs => self.tool_defs.len(),
        }
    }

    /// Total record count across all sections.
    pub fn total_records(&self) -> usize {
        SectionKind::ALL.iter().map(|k| self.len(*k)).sum()
    }

    /// Recompute the checksum of a section from its records.
    pub fn checksum(&self, kind: SectionKind) -> MemliftResult<String> {
        match kind {
            SectionKind::CoreBlocks => section_checksum(&self.core_blocks),
            SectionKind::ArchivalRecords => section_checksum(&self.archival_records),
            SectionKind::RecallMessages => section_checksum(&self.recall_messages),
            SectionKind::ToolDefs => section_checksum(&self.tool_defs),
        }
    }

    /// Record identifiers of a section, in stored order. Core blocks are
    /// identified by label and tools by name.
    pub fn record_ids(&self, kind: SectionKind) -> Vec<String> {
        match kind {
            SectionKind::CoreBlocks => self.core_blocks.iter().map(|b| b.label.clone()).collect(),
            SectionKind::ArchivalRecords => {
                self.archival_records.iter().map(|r| r.id.clone()).collect()
            }
            SectionKind::RecallMessages => {
                self.recall_messages.iter().map(|m| m.id.clone()).collect()
            }
            SectionKind::ToolDefs => self.tool_defs.iter().map(|t| t.name.clone()).collect(),
        }
    }

    /// Core block labels that appear more than once.
    pub fn duplicate_labels(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut dupes = BTreeSet::new();
        for block in &self.core_blocks {
            if !seen.insert(block.label.as_str()) {
                dupes.insert(block.label.clone());
            }
        }
        dupes.into_iter().collect()
    }
}

/// Integrity marker for one section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SectionIntegrity {
    /// The section was fully exported and its checksum is known.
    Complete {
        /// Order-independent checksum over the section's records.
        checksum: String,
    },
    /// The section was not fully exported. No checksum is claimed.
    Incomplete,
}

/// A stored checksum that disagrees with the records it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumMismatch {
    /// Affected section.
    pub section: SectionKind,
    /// Checksum stored in the snapshot.
    pub stored: String,
    /// Checksum recomputed from the records.
    pub computed: String,
}

/// One agent's complete memory state at export time.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSnapshot {
    /// Snapshot format version.
    pub format_version: u32,
    /// Agent the snapshot was taken from.
    pub source_agent_id: String,
    /// When the export started.
    pub exported_at: DateTime<Utc>,
    /// Section records.
    pub sections: SnapshotSections,
    /// Per-section integrity markers.
    pub integrity: BTreeMap<SectionKind, SectionIntegrity>,
    /// Record totals reported by the service, where it reported one.
    pub reported_totals: BTreeMap<SectionKind, u64>,
    /// Unknown top-level header fields, preserved for forward compatibility.
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl AgentSnapshot {
    /// Start an empty snapshot with every section marked incomplete.
    pub fn new(source_agent_id: impl Into<String>, exported_at: DateTime<Utc>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            source_agent_id: source_agent_id.into(),
            exported_at,
            sections: SnapshotSections::default(),
            integrity: SectionKind::ALL
                .into_iter()
                .map(|k| (k, SectionIntegrity::Incomplete))
                .collect(),
            reported_totals: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Build a complete snapshot from fully fetched sections.
    pub fn from_sections(
        source_agent_id: impl Into<String>,
        exported_at: DateTime<Utc>,
        sections: SnapshotSections,
    ) -> MemliftResult<Self> {
        let mut snapshot = Self::new(source_agent_id, exported_at);
        snapshot.sections = sections;
        for kind in SectionKind::ALL {
            let checksum = snapshot.sections.checksum(kind)?;
            snapshot.mark_complete(kind, checksum);
        }
        Ok(snapshot)
    }

    /// Mark a section complete with its checksum.
    pub fn mark_complete(&mut self, kind: SectionKind, checksum: String) {
        self.integrity
            .insert(kind, SectionIntegrity::Complete { checksum });
    }

    /// Stored checksum of a section, if it is complete.
    pub fn checksum(&self, kind: SectionKind) -> Option<&str> {
        match self.integrity.get(&kind) {
            Some(SectionIntegrity::Complete { checksum }) => Some(checksum.as_str()),
            _ => None,
        }
    }

    /// Sections that are not marked complete.
    pub fn incomplete_sections(&self) -> Vec<SectionKind> {
        SectionKind::ALL
            .into_iter()
            .filter(|k| self.checksum(*k).is_none())
            .collect()
    }

    /// Whether every section is marked complete.
    pub fn is_complete(&self) -> bool {
        self.incomplete_sections().is_empty()
    }

    /// Recompute every complete section's checksum and return the mismatches.
    pub fn checksum_mismatches(&self) -> MemliftResult<Vec<ChecksumMismatch>> {
        let mut mismatches = Vec::new();
        for kind in SectionKind::ALL {
            if let Some(stored) = self.checksum(kind) {
                let computed = self.sections.checksum(kind)?;
                if computed != stored {
                    mismatches.push(ChecksumMismatch {
                        section: kind,
                        stored: stored.to_string(),
                        computed,
                    });
                }
            }
        }
        Ok(mismatches)
    }

    /// `(reported, held)` when the service reported a total for `kind` that
    /// differs from the number of records the snapshot holds.
    pub fn total_mismatch(&self, kind: SectionKind) -> Option<(u64, u64)> {
        let reported = *self.reported_totals.get(&kind)?;
        let held = self.sections.len(kind) as u64;
        (reported != held).then_some((reported, held))
    }

    /// Stable identity of this snapshot's content, used to match checkpoints
    /// to the file they were created from.
    pub fn fingerprint(&self) -> String {
        let mut material = format!(
            "{}|{}|{}",
            self.format_version,
            self.source_agent_id,
            self.exported_at.to_rfc3339()
        );
        for kind in SectionKind::ALL {
            material.push('|');
            material.push_str(self.checksum(kind).unwrap_or("incomplete"));
        }
        sha256_hex(material.as_bytes())
    }

    /// Default file name: `{agent_id}_{YYYYmmdd_HHMMSS}.memlift`.
    pub fn default_file_name(&self) -> String {
        format!(
            "{}_{}.{}",
            file_safe_id(&self.source_agent_id),
            self.exported_at.format("%Y%m%d_%H%M%S"),
            SNAPSHOT_EXTENSION
        )
    }
}

/// Replace every character outside `[A-Za-z0-9_-]` with `_` so an agent id
/// can be used as part of a file name.
pub fn file_safe_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> AgentSnapshot {
        let sections = SnapshotSections {
            core_blocks: vec![CoreMemoryBlock {
                label: "persona".into(),
                content: "I am Nameless.".into(),
                limit: 5000,
                metadata: Default::default(),
            }],
            recall_messages: vec![RecallMessage {
                id: "m1".into(),
                role: "user".into(),
                content: "hello".into(),
                created_at: Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap(),
            }],
            ..Default::default()
        };
        AgentSnapshot::from_sections(
            "agent-123",
            Utc.with_ymd_and_hms(2024, 1, 15, 12, 30, 5).unwrap(),
            sections,
        )
        .unwrap()
    }

    #[test]
    fn test_new_snapshot_is_incomplete() {
        let snap = AgentSnapshot::new("agent-1", Utc::now());
        assert_eq!(snap.incomplete_sections().len(), 4);
        assert!(!snap.is_complete());
    }

    #[test]
    fn test_from_sections_is_complete_and_consistent() {
        let snap = sample();
        assert!(snap.is_complete());
        assert!(snap.checksum_mismatches().unwrap().is_empty());
    }

    #[test]
    fn test_tampered_records_are_detected() {
        let mut snap = sample();
        snap.sections.core_blocks[0].content.push('!');
        let mismatches = snap.checksum_mismatches().unwrap();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].section, SectionKind::CoreBlocks);
    }

    #[test]
    fn test_total_mismatch() {
        let mut snap = sample();
        assert_eq!(snap.total_mismatch(SectionKind::RecallMessages), None);
        snap.reported_totals.insert(SectionKind::RecallMessages, 1);
        assert_eq!(snap.total_mismatch(SectionKind::RecallMessages), None);
        snap.reported_totals.insert(SectionKind::RecallMessages, 3);
        assert_eq!(snap.total_mismatch(SectionKind::RecallMessages), Some((3, 1)));
    }

    #[test]
    fn test_duplicate_labels() {
        let mut snap = sample();
        let block = snap.sections.core_blocks[0].clone();
        snap.sections.core_blocks.push(block);
        assert_eq!(snap.sections.duplicate_labels(), vec!["persona".to_string()]);
    }

    #[test]
    fn test_default_file_name() {
        let mut snap = sample();
        assert_eq!(snap.default_file_name(), "agent-123_20240115_123005.memlift");
        snap.source_agent_id = "team/agent 1".into();
        assert!(snap.default_file_name().starts_with("team_agent_1_"));
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = sample();
        let mut b = sample();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.sections.recall_messages[0].content = "bye".into();
        let checksum = b.sections.checksum(SectionKind::RecallMessages).unwrap();
        b.mark_complete(SectionKind::RecallMessages, checksum);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
