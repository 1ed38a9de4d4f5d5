//! Export, import and verify workflows.
//!
//! The orchestrator owns the clients, the retry budgets, the checkpoint
//! directory and the shutdown signal. Each workflow returns a report; the
//! CLI turns reports and errors into exit statuses.

use crate::builder::SnapshotBuilder;
use crate::format;
use crate::plan::{
    CheckpointStore, FailedRecord, ImportPlan, ImportState, SectionProgress, IMPORT_ORDER,
};
use crate::report::{
    ExportFailure, ExportReport, HealthReport, ImportOutcome, ImportReport, SectionCount,
    ServiceHealth,
};
use crate::verify::{Against, VerificationReport, Verifier};
use memlift_client::retry::{retry_async, Clock, TokioClock};
use memlift_client::{HttpMemoryClient, MemoryService, SourceClient, WriteOutcome};
use memlift_types::config::{ConflictPolicy, MigrationConfig};
use memlift_types::error::{MemliftError, MemliftResult};
use memlift_types::memory::{CoreMemoryBlock, SectionKind};
use memlift_types::snapshot::AgentSnapshot;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Log import progress every this many attempted records per section.
const PROGRESS_EVERY: usize = 50;

/// Options for one import run.
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Verify the target against the snapshot after a completed import.
    pub verify: bool,
    /// Agent to import into. Defaults to the snapshot's source agent id.
    pub target_agent_id: Option<String>,
    /// Core block conflict policy. Defaults to the configured policy.
    pub conflict: Option<ConflictPolicy>,
}

/// Why an import stopped before reaching the last section.
enum Halt {
    Fatal(MemliftError),
    Interrupted,
}

/// Drives export, import, verify and health workflows.
pub struct Orchestrator {
    config: MigrationConfig,
    source: Arc<dyn SourceClient>,
    target: Arc<dyn MemoryService>,
    clock: Arc<dyn Clock>,
    shutdown: watch::Receiver<bool>,
}

impl Orchestrator {
    /// Create an orchestrator over explicit clients.
    pub fn new(
        config: MigrationConfig,
        source: Arc<dyn SourceClient>,
        target: Arc<dyn MemoryService>,
    ) -> Self {
        // The sender is dropped at once, so the flag stays false.
        let (_, shutdown) = watch::channel(false);
        Self {
            config,
            source,
            target,
            clock: Arc::new(TokioClock),
            shutdown,
        }
    }

    /// Create an orchestrator talking HTTP to the configured services.
    pub fn from_config(config: MigrationConfig) -> MemliftResult<Self> {
        config.validate()?;
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let source = HttpMemoryClient::new(&config.source, timeout, config.page_size)?;
        let target = HttpMemoryClient::new(&config.target, timeout, config.page_size)?;
        Ok(Self::new(config, Arc::new(source), Arc::new(target)))
    }

    /// Replace the clock used for retry backoff.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Stop at the next page or record boundary once `shutdown` turns `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// The configuration this orchestrator runs with.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    fn interrupted(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn builder<'a, S: SourceClient + ?Sized>(&'a self, source: &'a S) -> SnapshotBuilder<'a, S> {
        SnapshotBuilder::new(
            source,
            &self.config.fetch_retry,
            &*self.clock,
            self.config.concurrency,
        )
        .with_shutdown(self.shutdown.clone())
    }

    // -----------------------------------------------------------------------
    // Export
    // -----------------------------------------------------------------------

    /// Export `agent_id` from the source to `out`, or to a timestamped file
    /// in the export directory.
    ///
    /// On failure the partial draft is flushed next to the intended path
    /// with a `.partial` suffix for diagnosis. The failure carries the
    /// draft's per-section counts.
    pub async fn export(
        &self,
        agent_id: &str,
        out: Option<&Path>,
    ) -> Result<ExportReport, ExportFailure> {
        let snapshot = match self.builder(&*self.source).build(agent_id).await {
            Ok(snapshot) => snapshot,
            Err(failure) => {
                let path = partial_path(&self.output_path(&failure.draft, out));
                let partial = match format::write(&failure.draft, &path) {
                    Ok(()) => {
                        warn!(
                            agent_id,
                            path = %path.display(),
                            incomplete = ?failure.draft.incomplete_sections(),
                            "export failed; partial snapshot written for diagnosis"
                        );
                        Some(path)
                    }
                    Err(e) => {
                        warn!(agent_id, error = %e, "could not write partial snapshot");
                        None
                    }
                };
                return Err(ExportFailure {
                    agent_id: agent_id.to_string(),
                    error: failure.error,
                    partial,
                    sections: SectionCount::all(&failure.draft),
                });
            }
        };

        let sections = SectionCount::all(&snapshot);
        let path = self.output_path(&snapshot, out);
        let bytes = format::write(&snapshot, &path)
            .and_then(|()| Ok(std::fs::metadata(&path)?.len()))
            .map_err(|error| ExportFailure {
                agent_id: agent_id.to_string(),
                error,
                partial: None,
                sections: sections.clone(),
            })?;

        info!(
            agent_id,
            path = %path.display(),
            records = snapshot.sections.total_records(),
            bytes,
            "export complete"
        );
        Ok(ExportReport {
            agent_id: agent_id.to_string(),
            path,
            exported_at: snapshot.exported_at,
            bytes,
            sections,
        })
    }

    fn output_path(&self, snapshot: &AgentSnapshot, out: Option<&Path>) -> PathBuf {
        out.map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.export_dir.join(snapshot.default_file_name()))
    }

    // -----------------------------------------------------------------------
    // Import
    // -----------------------------------------------------------------------

    /// Import a snapshot file into the target.
    ///
    /// The snapshot is fully read and validated before the first write.
    /// Sections marked incomplete, or holding a different number of records
    /// than the service reported at export time, are refused. A matching
    /// checkpoint from an earlier failed run is resumed: sections it recorded
    /// as complete are skipped and the rest are re-run in full.
    pub async fn import(
        &self,
        path: &Path,
        options: &ImportOptions,
    ) -> MemliftResult<ImportReport> {
        let snapshot = format::read(path)?;
        let incomplete = snapshot.incomplete_sections();
        if !incomplete.is_empty() {
            let names: Vec<String> = incomplete.iter().map(|k| k.to_string()).collect();
            return Err(MemliftError::IncompleteSnapshot(names.join(", ")));
        }
        let short: Vec<String> = SectionKind::ALL
            .into_iter()
            .filter_map(|kind| {
                let (reported, held) = snapshot.total_mismatch(kind)?;
                Some(format!("{kind} (service reported {reported}, snapshot holds {held})"))
            })
            .collect();
        if !short.is_empty() {
            return Err(MemliftError::IncompleteSnapshot(short.join(", ")));
        }

        let target_agent_id = options
            .target_agent_id
            .clone()
            .unwrap_or_else(|| snapshot.source_agent_id.clone());
        let conflict = options.conflict.unwrap_or(self.config.conflict_policy);
        let store = CheckpointStore::new(&self.config.checkpoint_dir);

        let (mut plan, resumed) = match store.find(&snapshot, &target_agent_id)? {
            Some(mut plan) => {
                let completed: Vec<_> = IMPORT_ORDER
                    .into_iter()
                    .filter(|k| plan.is_section_complete(*k))
                    .collect();
                info!(run_id = %plan.run_id, ?completed, "resuming import from checkpoint");
                plan.conflict_policy = conflict;
                (plan, true)
            }
            None => (ImportPlan::new(&snapshot, path, &target_agent_id, conflict), false),
        };
        info!(
            source_agent_id = %snapshot.source_agent_id,
            target_agent_id = %target_agent_id,
            run_id = %plan.run_id,
            conflict = %conflict,
            "import started"
        );

        let mut halt = None;
        for kind in IMPORT_ORDER {
            if plan.is_section_complete(kind) {
                info!(section = %kind, "section already imported, skipping");
                continue;
            }
            plan.begin_section(kind);
            self.persist(&store, &plan);

            let result = self
                .import_section(&mut plan, &snapshot, kind, &target_agent_id)
                .await;
            let complete = plan.finish_section(kind);
            info!(section = %kind, complete, "section finished");
            if let Err(h) = result {
                halt = Some(h);
                break;
            }
        }

        let (outcome, fatal_error) = match halt {
            Some(Halt::Interrupted) => (ImportOutcome::Interrupted, None),
            Some(Halt::Fatal(e)) => (ImportOutcome::Fatal, Some(e.to_string())),
            None if plan.is_complete() => (ImportOutcome::Completed, None),
            None => (ImportOutcome::Partial, None),
        };

        let checkpoint = if outcome == ImportOutcome::Completed {
            plan.state = ImportState::Completed;
            if let Err(e) = store.delete(&plan) {
                warn!(error = %e, "could not delete checkpoint");
            }
            None
        } else {
            plan.state = ImportState::Failed;
            self.persist(&store, &plan)
        };

        let mut verification_error = None;
        let verification = match (options.verify, outcome) {
            (true, ImportOutcome::Completed) => {
                match self
                    .verify_snapshot(&snapshot, Against::Target, &target_agent_id)
                    .await
                {
                    Ok(report) => Some(report),
                    Err(e) => {
                        warn!(error = %e, "verification could not read the target");
                        verification_error = Some(e.to_string());
                        None
                    }
                }
            }
            (true, _) => {
                warn!(%outcome, "skipping verification: import did not complete");
                None
            }
            (false, _) => None,
        };

        info!(%outcome, run_id = %plan.run_id, "import finished");
        Ok(ImportReport {
            snapshot_path: path.to_path_buf(),
            source_agent_id: snapshot.source_agent_id.clone(),
            target_agent_id,
            run_id: plan.run_id.clone(),
            resumed,
            outcome,
            fatal_error,
            failed: plan.failed_records(),
            sections: plan.sections,
            checkpoint,
            verification,
            verification_error,
        })
    }

    /// Save the plan, logging rather than failing the run on error.
    fn persist(&self, store: &CheckpointStore, plan: &ImportPlan) -> Option<PathBuf> {
        match store.save(plan) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "could not save checkpoint");
                None
            }
        }
    }

    async fn import_section(
        &self,
        plan: &mut ImportPlan,
        snapshot: &AgentSnapshot,
        kind: SectionKind,
        target: &str,
    ) -> Result<(), Halt> {
        let source = snapshot.source_agent_id.as_str();
        let conflict = plan.conflict_policy;
        let progress = plan.sections.entry(kind).or_default();
        let sections = &snapshot.sections;

        match kind {
            SectionKind::CoreBlocks => {
                let blocks = self
                    .resolve_block_conflicts(progress, &sections.core_blocks, target, conflict)
                    .await?;
                self.write_all(
                    progress,
                    kind,
                    &blocks,
                    |b| &b.label,
                    false,
                    |block| async move {
                        self.target
                            .upsert_core_block(target, block)
                            .await
                            .map(|_| WriteOutcome::Written)
                    },
                )
                .await
            }
            SectionKind::ToolDefs => {
                self.write_all(
                    progress,
                    kind,
                    &sections.tool_defs,
                    |t| &t.name,
                    false,
                    |tool| async move {
                        self.target
                            .upsert_tool(target, tool)
                            .await
                            .map(|_| WriteOutcome::Written)
                    },
                )
                .await
            }
            SectionKind::ArchivalRecords => {
                self.write_all(
                    progress,
                    kind,
                    &sections.archival_records,
                    |r| &r.id,
                    false,
                    |record| async move {
                        self.target.insert_archival(target, source, record).await
                    },
                )
                .await
            }
            // A failed message stops the section so the target never holds
            // a history with a hole in it.
            SectionKind::RecallMessages => {
                self.write_all(
                    progress,
                    kind,
                    &sections.recall_messages,
                    |m| &m.id,
                    true,
                    |message| async move {
                        self.target.append_recall(target, source, message).await
                    },
                )
                .await
            }
        }
    }

    /// Apply the conflict policy and return the blocks that should be written.
    async fn resolve_block_conflicts<'b>(
        &self,
        progress: &mut SectionProgress,
        blocks: &'b [CoreMemoryBlock],
        target: &str,
        conflict: ConflictPolicy,
    ) -> Result<Vec<&'b CoreMemoryBlock>, Halt> {
        if conflict == ConflictPolicy::Overwrite {
            return Ok(blocks.iter().collect());
        }

        let existing = retry_async(
            &self.config.fetch_retry,
            &*self.clock,
            || self.target.list_core_blocks(target),
            MemliftError::is_retryable,
        )
        .await
        .into_result();
        let existing: BTreeMap<String, CoreMemoryBlock> = match existing {
            Ok(list) => list.into_iter().map(|b| (b.label.clone(), b)).collect(),
            Err(e) => {
                progress
                    .not_attempted
                    .extend(blocks.iter().map(|b| b.label.clone()));
                return Err(Halt::Fatal(e));
            }
        };

        let mut to_write = Vec::new();
        for block in blocks {
            match existing.get(&block.label) {
                Some(current) if current == block => progress.already_present += 1,
                Some(_) if conflict == ConflictPolicy::KeepExisting => {
                    info!(label = %block.label, "keeping existing core block");
                    progress.kept_existing += 1;
                }
                Some(_) => {
                    warn!(label = %block.label, "core block conflicts with target");
                    progress.failed.push(FailedRecord {
                        section: SectionKind::CoreBlocks,
                        record_id: block.label.clone(),
                        error: "target already holds a different block with this label".into(),
                    });
                }
                None => to_write.push(block),
            }
        }
        Ok(to_write)
    }

    /// Write records in order. With `stop_on_failure`, the first failed record
    /// ends the section and the rest are listed as not attempted.
    async fn write_all<'r, T, I, F, Fut>(
        &self,
        progress: &mut SectionProgress,
        kind: SectionKind,
        records: &'r [T],
        id_of: I,
        stop_on_failure: bool,
        write: F,
    ) -> Result<(), Halt>
    where
        I: Fn(&T) -> &String,
        F: Fn(&'r T) -> Fut,
        Fut: Future<Output = MemliftResult<WriteOutcome>>,
    {
        let id_of = &id_of;
        let remaining = move |from: usize| records[from..].iter().map(move |r| id_of(r).clone());

        for (i, record) in records.iter().enumerate() {
            match self.write_record(progress, kind, id_of(record), || write(record)).await {
                Ok(true) => {}
                Ok(false) if stop_on_failure => {
                    warn!(
                        section = %kind,
                        record_id = %id_of(record),
                        skipped = records.len() - i - 1,
                        "stopping section after failed record"
                    );
                    progress.not_attempted.extend(remaining(i + 1));
                    return Ok(());
                }
                Ok(false) => {}
                Err(Halt::Interrupted) => {
                    progress.not_attempted.extend(remaining(i));
                    return Err(Halt::Interrupted);
                }
                Err(halt) => {
                    progress.not_attempted.extend(remaining(i + 1));
                    return Err(halt);
                }
            }
        }
        Ok(())
    }

    /// Write one record with retry. `Ok(false)` means the record failed and
    /// the run may continue.
    async fn write_record<F, Fut>(
        &self,
        progress: &mut SectionProgress,
        kind: SectionKind,
        record_id: &str,
        write: F,
    ) -> Result<bool, Halt>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MemliftResult<WriteOutcome>>,
    {
        if self.interrupted() {
            warn!(section = %kind, "interrupted; stopping before next write");
            return Err(Halt::Interrupted);
        }
        progress.attempted += 1;

        let outcome = retry_async(
            &self.config.write_retry,
            &*self.clock,
            write,
            MemliftError::is_retryable,
        )
        .await;
        let attempts = outcome.attempts();
        match outcome.into_result() {
            Ok(WriteOutcome::Written) => progress.written += 1,
            Ok(WriteOutcome::AlreadyPresent) => progress.already_present += 1,
            Err(e) => {
                warn!(section = %kind, record_id, attempts, error = %e, "record write failed");
                progress.failed.push(FailedRecord {
                    section: kind,
                    record_id: record_id.to_string(),
                    error: e.to_string(),
                });
                // A missing target agent fails every later write too.
                if let MemliftError::NotFound(_) = e {
                    return Err(Halt::Fatal(e));
                }
                return Ok(false);
            }
        }

        if progress.attempted % PROGRESS_EVERY == 0 {
            info!(
                section = %kind,
                attempted = progress.attempted,
                total = progress.total,
                "import progress"
            );
        }
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Verify
    // -----------------------------------------------------------------------

    /// Verify a snapshot file against live state on the source or target.
    /// `agent_id` defaults to the snapshot's source agent id.
    pub async fn verify(
        &self,
        path: &Path,
        against: Against,
        agent_id: Option<&str>,
    ) -> MemliftResult<VerificationReport> {
        let snapshot = format::read(path)?;
        let agent_id = agent_id.unwrap_or(&snapshot.source_agent_id).to_string();
        self.verify_snapshot(&snapshot, against, &agent_id).await
    }

    async fn verify_snapshot(
        &self,
        snapshot: &AgentSnapshot,
        against: Against,
        agent_id: &str,
    ) -> MemliftResult<VerificationReport> {
        info!(agent_id, %against, "reading live state for verification");
        // Short pagination on the live side is reported by the pagination
        // check rather than aborting the capture.
        let live = match against {
            Against::Source => {
                self.builder(&*self.source)
                    .allow_total_mismatch()
                    .build(agent_id)
                    .await
            }
            Against::Target => {
                self.builder(&*self.target)
                    .allow_total_mismatch()
                    .build(agent_id)
                    .await
            }
        }
        .map_err(|failure| failure.error)?;

        let report = Verifier.verify(snapshot, &live, against);
        if report.passed() {
            info!(agent_id, checks = report.checks.len(), "verification passed");
        } else {
            warn!(agent_id, failed = report.failures().len(), "verification failed");
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------------

    /// Check source and target liveness concurrently.
    pub async fn health(&self) -> HealthReport {
        let (source, target) =
            futures::future::join(self.source.health(), self.target.health()).await;
        let describe = |url: &str, result: MemliftResult<()>| ServiceHealth {
            url: url.to_string(),
            ok: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
        };
        HealthReport {
            source: describe(&self.config.source.base_url, source),
            target: describe(&self.config.target.base_url, target),
        }
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("exports/a1_20240101_000000.memlift")),
            PathBuf::from("exports/a1_20240101_000000.memlift.partial")
        );
    }

    #[test]
    fn test_default_import_options() {
        let options = ImportOptions::default();
        assert!(!options.verify);
        assert!(options.target_agent_id.is_none());
        assert!(options.conflict.is_none());
    }
}
