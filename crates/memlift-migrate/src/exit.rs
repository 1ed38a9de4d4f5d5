//! Process exit statuses.

use crate::report::{ImportOutcome, ImportReport};
use crate::verify::VerificationReport;
use memlift_types::error::MemliftError;

/// Exit status of a memlift command. The numeric code is the only
/// control-flow signal scripts should rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    /// Configuration, usage or local I/O error.
    Config,
    /// Reading from a service failed.
    Fetch,
    /// Writing to the target failed and nothing more could be imported.
    Write,
    /// Import finished with listed record failures.
    Partial,
    /// The snapshot file is corrupt, incomplete or from a newer format.
    Snapshot,
    VerificationFailed,
    Interrupted,
}

impl ExitStatus {
    /// Numeric process exit code.
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Config => 1,
            Self::Fetch => 2,
            Self::Write => 3,
            Self::Partial => 4,
            Self::Snapshot => 5,
            Self::VerificationFailed => 6,
            Self::Interrupted => 130,
        }
    }

    /// Status for a command that failed with `err`.
    pub fn from_error(err: &MemliftError) -> Self {
        match err {
            MemliftError::TransientFetch(_)
            | MemliftError::NotFound(_)
            | MemliftError::Remote { .. }
            | MemliftError::Protocol(_)
            | MemliftError::TruncatedPagination { .. } => Self::Fetch,
            MemliftError::TransientWrite(_) => Self::Write,
            MemliftError::CorruptSnapshot(_)
            | MemliftError::UnsupportedVersion { .. }
            | MemliftError::IncompleteSnapshot(_) => Self::Snapshot,
            MemliftError::Interrupted => Self::Interrupted,
            MemliftError::Config(_) | MemliftError::Io(_) | MemliftError::Json(_) => Self::Config,
        }
    }

    /// Status for a finished import run. A completed import whose requested
    /// verification could not read the target is a fetch failure.
    pub fn for_import(report: &ImportReport) -> Self {
        match report.outcome {
            ImportOutcome::Completed if report.verification_error.is_some() => Self::Fetch,
            ImportOutcome::Completed => match &report.verification {
                Some(v) if !v.passed() => Self::VerificationFailed,
                _ => Self::Success,
            },
            ImportOutcome::Partial => Self::Partial,
            ImportOutcome::Fatal => Self::Write,
            ImportOutcome::Interrupted => Self::Interrupted,
        }
    }

    /// Status for a finished verification run.
    pub fn for_verification(report: &VerificationReport) -> Self {
        if report.passed() {
            Self::Success
        } else {
            Self::VerificationFailed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases = [
            (MemliftError::Config("x".into()), 1),
            (MemliftError::NotFound("a".into()), 2),
            (MemliftError::TransientFetch("x".into()), 2),
            (
                MemliftError::TruncatedPagination {
                    section: "archival_records".into(),
                    reported: 150,
                    fetched: 100,
                },
                2,
            ),
            (MemliftError::TransientWrite("x".into()), 3),
            (MemliftError::CorruptSnapshot("x".into()), 5),
            (
                MemliftError::UnsupportedVersion {
                    found: 9,
                    supported: 1,
                },
                5,
            ),
            (MemliftError::IncompleteSnapshot("recall_messages".into()), 5),
            (MemliftError::Interrupted, 130),
        ];
        for (err, code) in cases {
            assert_eq!(ExitStatus::from_error(&err).code(), code, "{err}");
        }
    }
}
