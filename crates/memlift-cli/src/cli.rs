//! Clap CLI definitions for memlift.

use clap::{Parser, Subcommand};
use memlift_migrate::Against;
use memlift_types::config::ConflictPolicy;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  memlift export agent-123                 Export an agent to ./exports
  memlift inspect exports/agent-123_*.memlift
  memlift import exports/agent-123_20240101_120000.memlift --verify
  memlift verify snapshot.memlift --against target
  memlift health                           Check source and target services

\x1b[1;36mEnvironment:\x1b[0m
  MEMLIFT_SOURCE_URL, MEMLIFT_SOURCE_API_KEY, MEMLIFT_TARGET_URL,
  MEMLIFT_TARGET_API_KEY, MEMLIFT_AGENT_ID (LETTA_BASE_URL and LETTA_API_KEY
  are used for both services when the specific variables are unset)";

/// memlift: move agent memory between memory service instances.
#[derive(Parser)]
#[command(
    name = "memlift",
    version,
    about = "Export, import and verify agent memory snapshots",
    after_help = AFTER_HELP,
)]
pub struct Cli {
    /// Path to config file (default: ~/.memlift/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Source service base URL.
    #[arg(long, global = true)]
    pub source_url: Option<String>,

    /// Target service base URL.
    #[arg(long, global = true)]
    pub target_url: Option<String>,

    /// Print machine-readable JSON instead of a summary.
    #[arg(long, global = true)]
    pub json: bool,

    /// Debug logging (RUST_LOG takes precedence).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Export an agent's memory from the source into a snapshot file.
    Export {
        /// Agent to export (default: MEMLIFT_AGENT_ID or `agent_id` in config).
        agent_id: Option<String>,
        /// Output file (default: <export_dir>/<agent>_<timestamp>.memlift).
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Import a snapshot file into the target.
    Import {
        /// Snapshot file.
        path: PathBuf,
        /// Verify the target against the snapshot after importing.
        #[arg(long)]
        verify: bool,
        /// Agent to import into (default: the snapshot's source agent id).
        #[arg(long)]
        target_agent_id: Option<String>,
        /// What to do with core blocks the target already holds.
        #[arg(long, value_enum)]
        conflict: Option<ConflictArg>,
    },
    /// Compare a snapshot with live state on the source or target.
    Verify {
        /// Snapshot file.
        path: PathBuf,
        /// Service to read live state from.
        #[arg(long, value_enum)]
        against: AgainstArg,
        /// Live agent to compare (default: the snapshot's source agent id).
        #[arg(long)]
        agent_id: Option<String>,
    },
    /// Validate a snapshot file and summarize its sections.
    Inspect {
        /// Snapshot file.
        path: PathBuf,
    },
    /// Check that the source and target services answer.
    Health,
}

#[derive(Clone, Copy, clap::ValueEnum)]
pub enum ConflictArg {
    Overwrite,
    KeepExisting,
    Fail,
}

impl From<ConflictArg> for ConflictPolicy {
    fn from(arg: ConflictArg) -> Self {
        match arg {
            ConflictArg::Overwrite => Self::Overwrite,
            ConflictArg::KeepExisting => Self::KeepExisting,
            ConflictArg::Fail => Self::Fail,
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum)]
pub enum AgainstArg {
    Source,
    Target,
}

impl From<AgainstArg> for Against {
    fn from(arg: AgainstArg) -> Self {
        match arg {
            AgainstArg::Source => Self::Source,
            AgainstArg::Target => Self::Target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_import_flags() {
        let cli = Cli::try_parse_from([
            "memlift",
            "import",
            "snap.memlift",
            "--verify",
            "--conflict",
            "keep-existing",
            "--json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Import {
                path,
                verify,
                conflict,
                target_agent_id,
            } => {
                assert_eq!(path, PathBuf::from("snap.memlift"));
                assert!(verify);
                assert!(target_agent_id.is_none());
                assert_eq!(
                    ConflictPolicy::from(conflict.unwrap()),
                    ConflictPolicy::KeepExisting
                );
            }
            _ => panic!("expected import"),
        }
    }

    #[test]
    fn test_verify_requires_against() {
        assert!(Cli::try_parse_from(["memlift", "verify", "snap.memlift"]).is_err());
        let cli = Cli::try_parse_from([
            "memlift",
            "verify",
            "snap.memlift",
            "--against",
            "source",
            "--source-url",
            "http://old:8283",
        ])
        .unwrap();
        assert_eq!(cli.source_url.as_deref(), Some("http://old:8283"));
        assert!(matches!(
            cli.command,
            Commands::Verify {
                against: AgainstArg::Source,
                ..
            }
        ));
    }
}
