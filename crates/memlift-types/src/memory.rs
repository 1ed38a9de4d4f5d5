//! Memory record types: core blocks, archival records, recall messages and tools.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Arbitrary metadata attached to a record. Ordered so that serialization is
/// deterministic and checksums are stable.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// A small, always-loaded labeled text slot (e.g. `persona`, `human`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreMemoryBlock {
    /// Unique key within an agent.
    pub label: String,
    /// Block text.
    pub content: String,
    /// Maximum size of the block content in characters.
    pub limit: u64,
    /// Arbitrary metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

/// A long-term, search-retrieved record in archival memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivalRecord {
    /// Source-assigned identifier, treated as opaque.
    pub id: String,
    /// Record text.
    pub text: String,
    /// When the record was created on the source.
    pub created_at: DateTime<Utc>,
    /// Pointer into the source's embedding index. Never re-derived locally.
    #[serde(default)]
    pub embedding_ref: Option<String>,
    /// Tags attached to the record.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Arbitrary metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

/// One entry of the chronological conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallMessage {
    /// Source-assigned identifier.
    pub id: String,
    /// Speaker role as reported by the service (`user`, `assistant`, `tool`, ...).
    pub role: String,
    /// Message text.
    pub content: String,
    /// When the message was created.
    pub created_at: DateTime<Utc>,
}

/// A tool or configuration entry, carried as opaque JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (unique within an agent).
    pub name: String,
    /// Raw JSON text of the tool definition exactly as the service returned it.
    pub payload: String,
}

/// The four memory sections of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    /// Core memory blocks.
    CoreBlocks,
    /// Archival memory records.
    ArchivalRecords,
    /// Recall (message history).
    RecallMessages,
    /// Tool and config definitions.
    ToolDefs,
}

impl SectionKind {
    /// All sections in file order.
    pub const ALL: [SectionKind; 4] = [
        SectionKind::CoreBlocks,
        SectionKind::ArchivalRecords,
        SectionKind::RecallMessages,
        SectionKind::ToolDefs,
    ];

    /// Stable identifier used in files, checkpoints and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CoreBlocks => "core_blocks",
            Self::ArchivalRecords => "archival_records",
            Self::RecallMessages => "recall_messages",
            Self::ToolDefs => "tool_defs",
        }
    }

    /// Parse a section identifier.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for SectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_kind_parse() {
        for kind in SectionKind::ALL {
            assert_eq!(SectionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SectionKind::parse("embeddings"), None);
    }

    #[test]
    fn test_archival_defaults() {
        let json = r#"{"id":"p-1","text":"hello","created_at":"2024-01-15T10:00:00Z"}"#;
        let record: ArchivalRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.embedding_ref, None);
        assert!(record.tags.is_empty());
        assert!(record.metadata.is_empty());
    }
}
