//! Run configuration: service endpoints, retry budgets, paths and policies.
//!
//! A `MigrationConfig` is built once at process entry and passed down by
//! reference. Nothing below the CLI reads the environment.

use crate::error::{MemliftError, MemliftResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default memory service URL (a local Letta-compatible server).
pub const DEFAULT_BASE_URL: &str = "http://localhost:8283";

/// Connection settings for one memory service instance.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceEndpoint {
    /// Base URL of the service, without a trailing slash.
    pub base_url: String,
    /// Bearer token, if the service requires one.
    pub api_key: Option<String>,
}

impl Default for ServiceEndpoint {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
        }
    }
}

impl std::fmt::Debug for ServiceEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEndpoint")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Retry behavior for one class of network operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first try).
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    pub min_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 = no jitter, 1.0 = up to double the delay).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.1,
        }
    }
}

/// What to do when the target already has a core block with the same label
/// but different content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Replace the target block with the snapshot's block.
    #[default]
    Overwrite,
    /// Leave the target block untouched.
    KeepExisting,
    /// Record the block as failed and leave the target untouched.
    Fail,
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Overwrite => write!(f, "overwrite"),
            Self::KeepExisting => write!(f, "keep-existing"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// Complete configuration for one memlift process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Service snapshots are exported from.
    pub source: ServiceEndpoint,
    /// Service snapshots are imported into.
    pub target: ServiceEndpoint,
    /// Default agent identifier when a command does not name one.
    pub agent_id: Option<String>,
    /// Directory for exported snapshot files.
    pub export_dir: PathBuf,
    /// Directory for import checkpoints.
    pub checkpoint_dir: PathBuf,
    /// Records requested per page on paginated reads.
    pub page_size: u32,
    /// Maximum concurrent section reads.
    pub concurrency: usize,
    /// Per-attempt timeout for every network call, in seconds.
    pub request_timeout_secs: u64,
    /// Retry budget for reads.
    pub fetch_retry: RetryPolicy,
    /// Retry budget for writes.
    pub write_retry: RetryPolicy,
    /// Core block conflict resolution on import.
    pub conflict_policy: ConflictPolicy,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            source: ServiceEndpoint::default(),
            target: ServiceEndpoint::default(),
            agent_id: None,
            export_dir: PathBuf::from("exports"),
            checkpoint_dir: memlift_home().join("checkpoints"),
            page_size: 100,
            concurrency: 3,
            request_timeout_secs: 30,
            fetch_retry: RetryPolicy::default(),
            write_retry: RetryPolicy::default(),
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

impl MigrationConfig {
    /// Reject values that would make a run meaningless.
    pub fn validate(&self) -> MemliftResult<()> {
        for (name, endpoint) in [("source", &self.source), ("target", &self.target)] {
            let url = endpoint.base_url.trim();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(MemliftError::Config(format!(
                    "{name} base_url must start with http:// or https://, got '{url}'"
                )));
            }
        }
        if self.page_size == 0 {
            return Err(MemliftError::Config("page_size must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(MemliftError::Config("concurrency must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(MemliftError::Config(
                "request_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// memlift's home directory (`~/.memlift`).
pub fn memlift_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".memlift")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MigrationConfig::default();
        assert_eq!(config.source.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.page_size, 100);
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.conflict_policy, ConflictPolicy::Overwrite);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: MigrationConfig = toml::from_str(
            r#"
            conflict_policy = "keep-existing"

            [target]
            base_url = "https://api.example.com"
            api_key = "sk-test"

            [write_retry]
            max_attempts = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.target.base_url, "https://api.example.com");
        assert_eq!(config.source.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.write_retry.max_attempts, 8);
        assert_eq!(config.write_retry.min_delay_ms, 500);
        assert_eq!(config.conflict_policy, ConflictPolicy::KeepExisting);
    }

    #[test]
    fn test_api_key_is_redacted_in_debug() {
        let endpoint = ServiceEndpoint {
            base_url: "http://x".into(),
            api_key: Some("secret-token".into()),
        };
        let debug = format!("{endpoint:?}");
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = MigrationConfig::default();
        config.target.base_url = "ftp://nope".into();
        assert!(config.validate().is_err());

        let mut config = MigrationConfig::default();
        config.concurrency = 0;
        assert!(config.validate().is_err());
    }
}
