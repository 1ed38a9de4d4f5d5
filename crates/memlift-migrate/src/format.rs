//! Snapshot file format.
//!
//! ```text
//! MAGIC (8 bytes: "MEMLIFT\n")
//! frame: [u32 BE body length][32-byte SHA-256 of body][JSON body]
//!   frame 0    header  { format_version, source_agent_id, exported_at,
//!                        reported_totals, sections, ...extra }
//!   frame 1..N section { section, integrity, count, records }
//! ```
//!
//! Every byte of the file is covered by the magic check, a frame digest, or
//! the requirement that the last frame ends exactly at end of file, so any
//! single-byte change is reported as corruption.

use chrono::{DateTime, Utc};
use memlift_types::error::{MemliftError, MemliftResult};
use memlift_types::memory::SectionKind;
use memlift_types::snapshot::{AgentSnapshot, SectionIntegrity, SnapshotSections, FORMAT_VERSION};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File magic. The trailing newline catches text-mode line ending rewrites.
pub const MAGIC: &[u8; 8] = b"MEMLIFT\n";

const LEN_BYTES: usize = 4;
const DIGEST_BYTES: usize = 32;

fn corrupt(message: impl Into<String>) -> MemliftError {
    MemliftError::CorruptSnapshot(message.into())
}

// ---------------------------------------------------------------------------
// Frame shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct VersionProbe {
    format_version: u32,
}

#[derive(Deserialize)]
struct HeaderIn {
    format_version: u32,
    source_agent_id: String,
    exported_at: DateTime<Utc>,
    #[serde(default)]
    reported_totals: BTreeMap<SectionKind, u64>,
    sections: Vec<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize)]
struct SectionOut<'a, T> {
    section: SectionKind,
    integrity: &'a SectionIntegrity,
    count: usize,
    records: &'a [T],
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SectionIn {
    section: String,
    integrity: SectionIntegrity,
    count: usize,
    records: Box<RawValue>,
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn push_frame(out: &mut Vec<u8>, body: &[u8]) -> MemliftResult<()> {
    let len = u32::try_from(body.len()).map_err(|_| {
        MemliftError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("snapshot frame of {} bytes exceeds the 4 GiB limit", body.len()),
        ))
    })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&Sha256::digest(body));
    out.extend_from_slice(body);
    Ok(())
}

fn section_frame<T: Serialize>(
    snapshot: &AgentSnapshot,
    kind: SectionKind,
    records: &[T],
) -> MemliftResult<Vec<u8>> {
    let incomplete = SectionIntegrity::Incomplete;
    let frame = SectionOut {
        section: kind,
        integrity: snapshot.integrity.get(&kind).unwrap_or(&incomplete),
        count: records.len(),
        records,
    };
    Ok(serde_json::to_vec(&frame)?)
}

pub(crate) fn encode_with_version(
    snapshot: &AgentSnapshot,
    version: u32,
) -> MemliftResult<Vec<u8>> {
    let mut header = serde_json::Map::new();
    for (key, value) in &snapshot.extra {
        header.insert(key.clone(), value.clone());
    }
    header.insert("format_version".into(), version.into());
    header.insert(
        "source_agent_id".into(),
        snapshot.source_agent_id.clone().into(),
    );
    header.insert(
        "exported_at".into(),
        serde_json::to_value(snapshot.exported_at)?,
    );
    header.insert(
        "reported_totals".into(),
        serde_json::to_value(&snapshot.reported_totals)?,
    );
    header.insert(
        "sections".into(),
        serde_json::to_value(SectionKind::ALL)?,
    );

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    push_frame(&mut out, &serde_json::to_vec(&header)?)?;

    let sections = &snapshot.sections;
    for kind in SectionKind::ALL {
        let body = match kind {
            SectionKind::CoreBlocks => section_frame(snapshot, kind, &sections.core_blocks)?,
            SectionKind::ArchivalRecords => {
                section_frame(snapshot, kind, &sections.archival_records)?
            }
            SectionKind::RecallMessages => {
                section_frame(snapshot, kind, &sections.recall_messages)?
            }
            SectionKind::ToolDefs => section_frame(snapshot, kind, &sections.tool_defs)?,
        };
        push_frame(&mut out, &body)?;
    }
    Ok(out)
}

/// Encode a snapshot into file bytes.
pub fn encode(snapshot: &AgentSnapshot) -> MemliftResult<Vec<u8>> {
    encode_with_version(snapshot, FORMAT_VERSION)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

struct FrameReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn next_frame(&mut self, what: &str) -> MemliftResult<&'a [u8]> {
        let bytes: &'a [u8] = self.bytes;
        let rest = &bytes[self.pos..];
        if rest.len() < LEN_BYTES + DIGEST_BYTES {
            return Err(corrupt(format!("truncated {what} frame at byte {}", self.pos)));
        }
        let mut len_bytes = [0u8; LEN_BYTES];
        len_bytes.copy_from_slice(&rest[..LEN_BYTES]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        let digest = &rest[LEN_BYTES..LEN_BYTES + DIGEST_BYTES];
        let body_start = LEN_BYTES + DIGEST_BYTES;
        if rest.len() - body_start < len {
            return Err(corrupt(format!(
                "{what} frame at byte {} claims {len} bytes but only {} remain",
                self.pos,
                rest.len() - body_start
            )));
        }
        let body = &rest[body_start..body_start + len];
        if Sha256::digest(body).as_slice() != digest {
            return Err(corrupt(format!("{what} frame digest mismatch at byte {}", self.pos)));
        }
        self.pos += body_start + len;
        Ok(body)
    }

    fn at_end(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

fn parse_records<T: DeserializeOwned>(kind: SectionKind, raw: &RawValue) -> MemliftResult<Vec<T>> {
    serde_json::from_str(raw.get()).map_err(|e| corrupt(format!("{kind} records: {e}")))
}

/// Decode file bytes into a snapshot, validating every frame and checksum.
pub fn decode(bytes: &[u8]) -> MemliftResult<AgentSnapshot> {
    if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
        return Err(corrupt("missing snapshot magic"));
    }
    let mut reader = FrameReader {
        bytes,
        pos: MAGIC.len(),
    };

    let header_body = reader.next_frame("header")?;
    let probe: VersionProbe = serde_json::from_slice(header_body)
        .map_err(|e| corrupt(format!("header: {e}")))?;
    if probe.format_version > FORMAT_VERSION {
        return Err(MemliftError::UnsupportedVersion {
            found: probe.format_version,
            supported: FORMAT_VERSION,
        });
    }
    if probe.format_version == 0 {
        return Err(corrupt("format_version 0 is not a valid version"));
    }
    let header: HeaderIn =
        serde_json::from_slice(header_body).map_err(|e| corrupt(format!("header: {e}")))?;

    let mut listed = BTreeSet::new();
    for name in &header.sections {
        let kind = SectionKind::parse(name)
            .ok_or_else(|| corrupt(format!("unknown section '{name}' in header")))?;
        if !listed.insert(kind) {
            return Err(corrupt(format!("section '{name}' listed twice")));
        }
    }
    if listed.len() != SectionKind::ALL.len() {
        return Err(corrupt(format!(
            "header lists {} sections, expected {}",
            listed.len(),
            SectionKind::ALL.len()
        )));
    }

    let mut snapshot = AgentSnapshot::new(header.source_agent_id, header.exported_at);
    snapshot.format_version = header.format_version;
    snapshot.reported_totals = header.reported_totals;
    snapshot.extra = header.extra;

    let mut sections = SnapshotSections::default();
    for name in &header.sections {
        let body = reader.next_frame(name)?;
        let frame: SectionIn =
            serde_json::from_slice(body).map_err(|e| corrupt(format!("section {name}: {e}")))?;
        if &frame.section != name {
            return Err(corrupt(format!(
                "expected section '{name}', found '{}'",
                frame.section
            )));
        }
        let kind = SectionKind::parse(name)
            .ok_or_else(|| corrupt(format!("unknown section '{name}'")))?;
        let count = match kind {
            SectionKind::CoreBlocks => {
                sections.core_blocks = parse_records(kind, &frame.records)?;
                sections.core_blocks.len()
            }
            SectionKind::ArchivalRecords => {
                sections.archival_records = parse_records(kind, &frame.records)?;
                sections.archival_records.len()
            }
            SectionKind::RecallMessages => {
                sections.recall_messages = parse_records(kind, &frame.records)?;
                sections.recall_messages.len()
            }
            SectionKind::ToolDefs => {
                sections.tool_defs = parse_records(kind, &frame.records)?;
                sections.tool_defs.len()
            }
        };
        if count != frame.count {
            return Err(corrupt(format!(
                "section {kind} declares {} records but holds {count}",
                frame.count
            )));
        }
        snapshot.integrity.insert(kind, frame.integrity);
    }
    if !reader.at_end() {
        return Err(corrupt(format!(
            "{} trailing bytes after last section",
            bytes.len() - reader.pos
        )));
    }
    snapshot.sections = sections;

    let dupes = snapshot.sections.duplicate_labels();
    if !dupes.is_empty() {
        return Err(corrupt(format!(
            "duplicate core block labels: {}",
            dupes.join(", ")
        )));
    }
    if let Some(mismatch) = snapshot.checksum_mismatches()?.into_iter().next() {
        return Err(corrupt(format!(
            "section {} checksum mismatch: stored {}, computed {}",
            mismatch.section, mismatch.stored, mismatch.computed
        )));
    }
    Ok(snapshot)
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write a snapshot to `path` atomically (temp file + rename).
pub fn write(snapshot: &AgentSnapshot, path: &Path) -> MemliftResult<()> {
    let bytes = encode(snapshot)?;
    write_bytes(&bytes, path)?;
    debug!(path = %path.display(), bytes = bytes.len(), "snapshot written");
    Ok(())
}

pub(crate) fn write_bytes(bytes: &[u8], path: &Path) -> MemliftResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    Ok(result?)
}

/// Read and validate a snapshot file.
pub fn read(path: &Path) -> MemliftResult<AgentSnapshot> {
    let bytes = std::fs::read(path)?;
    decode(&bytes)
}

/// Section-level summary of a snapshot file.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSummary {
    /// File that was inspected.
    pub path: PathBuf,
    /// File size in bytes.
    pub file_size: u64,
    pub format_version: u32,
    pub source_agent_id: String,
    pub exported_at: DateTime<Utc>,
    /// One entry per section, in file order.
    pub sections: Vec<SectionSummary>,
    /// Header fields this build does not interpret.
    pub extra_fields: Vec<String>,
}

/// Summary of one section.
#[derive(Debug, Clone, Serialize)]
pub struct SectionSummary {
    pub section: SectionKind,
    pub records: usize,
    pub complete: bool,
    pub checksum: Option<String>,
    /// Total the service reported at export time, if any.
    pub reported_total: Option<u64>,
}

impl SnapshotSummary {
    /// Summarize an already decoded snapshot.
    pub fn from_snapshot(path: &Path, file_size: u64, snapshot: &AgentSnapshot) -> Self {
        Self {
            path: path.to_path_buf(),
            file_size,
            format_version: snapshot.format_version,
            source_agent_id: snapshot.source_agent_id.clone(),
            exported_at: snapshot.exported_at,
            sections: SectionKind::ALL
                .into_iter()
                .map(|kind| SectionSummary {
                    section: kind,
                    records: snapshot.sections.len(kind),
                    complete: snapshot.checksum(kind).is_some(),
                    checksum: snapshot.checksum(kind).map(str::to_string),
                    reported_total: snapshot.reported_totals.get(&kind).copied(),
                })
                .collect(),
            extra_fields: snapshot.extra.keys().cloned().collect(),
        }
    }
}

/// Read and validate a snapshot file and summarize it.
pub fn inspect(path: &Path) -> MemliftResult<SnapshotSummary> {
    let bytes = std::fs::read(path)?;
    let snapshot = decode(&bytes)?;
    Ok(SnapshotSummary::from_snapshot(
        path,
        bytes.len() as u64,
        &snapshot,
    ))
}
