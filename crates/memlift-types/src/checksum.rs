//! Order-independent section checksums over canonicalized record content.
//!
//! A record is canonicalized as compact JSON with every object's keys sorted,
//! nested ones included, and hashed with SHA-256. The sort does not depend on
//! whether `serde_json`'s `preserve_order` feature is enabled. A section checksum hashes
//! the record count followed by the sorted record digests, so it does not
//! depend on record order but changes when any record byte changes.

use crate::error::MemliftResult;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Compute the SHA-256 of data and return it as a lowercase hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA-256 digest of one record's canonical JSON form.
pub fn record_digest<T: Serialize>(record: &T) -> MemliftResult<[u8; 32]> {
    let canonical = serde_json::to_vec(&canonicalize(serde_json::to_value(record)?))?;
    Ok(Sha256::digest(&canonical).into())
}

/// Rebuild every object with its keys inserted in sorted order.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Incremental section checksum, fed one record at a time as pages arrive.
#[derive(Debug, Clone, Default)]
pub struct SectionHasher {
    digests: Vec<[u8; 32]>,
}

impl SectionHasher {
    /// Create an empty hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one record.
    pub fn push<T: Serialize>(&mut self, record: &T) -> MemliftResult<()> {
        self.digests.push(record_digest(record)?);
        Ok(())
    }

    /// Number of records seen so far.
    pub fn len(&self) -> usize {
        self.digests.len()
    }

    /// Whether no record has been added.
    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// Finish and return the hex checksum.
    pub fn finish(mut self) -> String {
        self.digests.sort_unstable();
        let mut hasher = Sha256::new();
        hasher.update((self.digests.len() as u64).to_be_bytes());
        for digest in &self.digests {
            hasher.update(digest);
        }
        hex::encode(hasher.finalize())
    }
}

/// Checksum of a complete section.
pub fn section_checksum<T: Serialize>(records: &[T]) -> MemliftResult<String> {
    let mut hasher = SectionHasher::new();
    for record in records {
        hasher.push(record)?;
    }
    Ok(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RecallMessage;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn msg(id: &str, content: &str) -> RecallMessage {
        RecallMessage {
            id: id.to_string(),
            role: "user".to_string(),
            content: content.to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_sha256_hex_known_value() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_nested_keys_are_sorted_before_hashing() {
        let mut inner = Map::new();
        inner.insert("y".into(), json!(1));
        inner.insert("x".into(), json!([{ "d": 1, "c": 2 }]));
        let mut outer = Map::new();
        outer.insert("b".into(), Value::Object(inner));
        outer.insert("a".into(), json!("z"));

        let canonical = serde_json::to_string(&canonicalize(Value::Object(outer.clone()))).unwrap();
        assert_eq!(canonical, r#"{"a":"z","b":{"x":[{"c":2,"d":1}],"y":1}}"#);
        assert_eq!(
            hex::encode(record_digest(&Value::Object(outer)).unwrap()),
            "5d9c66c63420d0bf3c4fe1f0887189543104ff4c53db61bddf462aed32f2c1ae"
        );
    }

    #[test]
    fn test_checksum_is_order_independent() {
        let a = vec![msg("m1", "hi"), msg("m2", "there"), msg("m3", "!")];
        let b = vec![msg("m3", "!"), msg("m1", "hi"), msg("m2", "there")];
        assert_eq!(section_checksum(&a).unwrap(), section_checksum(&b).unwrap());
    }

    #[test]
    fn test_checksum_detects_content_change() {
        let a = vec![msg("m1", "hi"), msg("m2", "there")];
        let b = vec![msg("m1", "hi"), msg("m2", "therE")];
        assert_ne!(section_checksum(&a).unwrap(), section_checksum(&b).unwrap());
    }

    #[test]
    fn test_checksum_detects_missing_and_duplicate_records() {
        let full = vec![msg("m1", "hi"), msg("m2", "there")];
        let missing = vec![msg("m1", "hi")];
        let doubled = vec![msg("m1", "hi"), msg("m2", "there"), msg("m2", "there")];
        let base = section_checksum(&full).unwrap();
        assert_ne!(base, section_checksum(&missing).unwrap());
        assert_ne!(base, section_checksum(&doubled).unwrap());
    }

    #[test]
    fn test_incremental_matches_batch() {
        let records = vec![msg("m1", "a"), msg("m2", "b")];
        let mut hasher = SectionHasher::new();
        for r in &records {
            hasher.push(r).unwrap();
        }
        assert_eq!(hasher.len(), 2);
        assert_eq!(hasher.finish(), section_checksum(&records).unwrap());
    }

    #[test]
    fn test_empty_section_has_stable_checksum() {
        let empty: Vec<RecallMessage> = Vec::new();
        assert_eq!(
            section_checksum(&empty).unwrap(),
            SectionHasher::new().finish()
        );
    }
}
