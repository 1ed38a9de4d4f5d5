//! Assemble one consistent `AgentSnapshot` from a memory service.
//!
//! The four sections are fetched concurrently, bounded by a semaphore. Pages
//! of one section are fetched strictly in token order. A section is marked
//! complete only after its stream is exhausted; if any section fails, the
//! others stop at their next page boundary and the caller receives the
//! partial draft alongside the error.
//!
//! A paginated section whose record count falls short of (or overshoots) the
//! total the service reported is a failure too, unless the builder is
//! capturing live state for verification, where the mismatch is reported by
//! the `pagination` check instead.

use chrono::Utc;
use memlift_client::retry::{retry_async, Clock};
use memlift_client::{Page, SourceClient};
use memlift_types::checksum::SectionHasher;
use memlift_types::config::RetryPolicy;
use memlift_types::error::{MemliftError, MemliftResult};
use memlift_types::memory::SectionKind;
use memlift_types::snapshot::{AgentSnapshot, SnapshotSections};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

/// An export that did not finish, with everything fetched before it stopped.
#[derive(Debug)]
pub struct BuildFailure {
    /// Why the export stopped.
    pub error: MemliftError,
    /// Draft snapshot. Sections that did not finish are marked incomplete.
    pub draft: AgentSnapshot,
}

/// What one section fetch produced.
struct Fetched<T> {
    records: Vec<T>,
    reported_total: Option<u64>,
    /// Set only when the stream was exhausted.
    checksum: Option<String>,
    error: Option<MemliftError>,
}

impl<T> Fetched<T> {
    fn empty() -> Self {
        Self {
            records: Vec::new(),
            reported_total: None,
            checksum: None,
            error: None,
        }
    }
}

/// Snapshot builder over any [`SourceClient`].
pub struct SnapshotBuilder<'a, S: SourceClient + ?Sized> {
    source: &'a S,
    policy: &'a RetryPolicy,
    clock: &'a dyn Clock,
    concurrency: usize,
    shutdown: Option<watch::Receiver<bool>>,
    allow_total_mismatch: bool,
}

impl<'a, S: SourceClient + ?Sized> SnapshotBuilder<'a, S> {
    /// Create a builder. `concurrency` bounds concurrent section fetches.
    pub fn new(
        source: &'a S,
        policy: &'a RetryPolicy,
        clock: &'a dyn Clock,
        concurrency: usize,
    ) -> Self {
        Self {
            source,
            policy,
            clock,
            concurrency: concurrency.max(1),
            shutdown: None,
            allow_total_mismatch: false,
        }
    }

    /// Accept sections whose record count disagrees with the service's
    /// reported total. The totals are still recorded on the snapshot.
    pub fn allow_total_mismatch(mut self) -> Self {
        self.allow_total_mismatch = true;
        self
    }

    /// Stop between pages once `shutdown` turns `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn interrupted(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Fetch every section of `agent_id`.
    pub async fn build(&self, agent_id: &str) -> Result<AgentSnapshot, BuildFailure> {
        let exported_at = Utc::now();
        let semaphore = Semaphore::new(self.concurrency);
        let abort = AtomicBool::new(false);

        info!(agent_id, concurrency = self.concurrency, "fetching agent memory");

        let (core, tools, archival, recall) = futures::join!(
            self.fetch_whole(SectionKind::CoreBlocks, &semaphore, &abort, || {
                self.source.list_core_blocks(agent_id)
            }),
            self.fetch_whole(SectionKind::ToolDefs, &semaphore, &abort, || {
                self.source.list_tools(agent_id)
            }),
            self.fetch_paged(
                SectionKind::ArchivalRecords,
                &semaphore,
                &abort,
                |token| async move { self.source.list_archival(agent_id, token.as_deref()).await },
            ),
            self.fetch_paged(
                SectionKind::RecallMessages,
                &semaphore,
                &abort,
                |token| async move { self.source.list_recall(agent_id, token.as_deref()).await },
            ),
        );

        let mut snapshot = AgentSnapshot::new(agent_id, exported_at);
        let mut errors = Vec::new();

        let core_blocks = collect(&mut snapshot, &mut errors, SectionKind::CoreBlocks, core);
        let tool_defs = collect(&mut snapshot, &mut errors, SectionKind::ToolDefs, tools);
        let archival_records =
            collect(&mut snapshot, &mut errors, SectionKind::ArchivalRecords, archival);
        let recall_messages =
            collect(&mut snapshot, &mut errors, SectionKind::RecallMessages, recall);
        snapshot.sections = SnapshotSections {
            core_blocks,
            archival_records,
            recall_messages,
            tool_defs,
        };

        // NotFound explains every other failure, so report it first.
        errors.sort_by_key(|e| !matches!(e, MemliftError::NotFound(_)));
        match errors.into_iter().next() {
            Some(error) => Err(BuildFailure {
                error,
                draft: snapshot,
            }),
            None if !snapshot.is_complete() => Err(BuildFailure {
                error: MemliftError::Interrupted,
                draft: snapshot,
            }),
            None => {
                info!(
                    agent_id,
                    records = snapshot.sections.total_records(),
                    "agent memory fetched"
                );
                Ok(snapshot)
            }
        }
    }

    /// Fetch a section that the service returns in a single call.
    async fn fetch_whole<T, F, Fut>(
        &self,
        kind: SectionKind,
        semaphore: &Semaphore,
        abort: &AtomicBool,
        fetch: F,
    ) -> Fetched<T>
    where
        T: Serialize,
        F: Fn() -> Fut,
        Fut: Future<Output = MemliftResult<Vec<T>>>,
    {
        let mut out = Fetched::empty();
        let Ok(_permit) = semaphore.acquire().await else {
            out.error = Some(MemliftError::Interrupted);
            return out;
        };
        if abort.load(Ordering::SeqCst) {
            return out;
        }
        if self.interrupted() {
            abort.store(true, Ordering::SeqCst);
            out.error = Some(MemliftError::Interrupted);
            return out;
        }

        let result = retry_async(self.policy, self.clock, &fetch, MemliftError::is_retryable)
            .await
            .into_result()
            .and_then(|records| {
                let mut hasher = SectionHasher::new();
                for record in &records {
                    hasher.push(record)?;
                }
                Ok((records, hasher.finish()))
            });
        match result {
            Ok((records, checksum)) => {
                info!(section = %kind, records = records.len(), "section fetched");
                out.records = records;
                out.checksum = Some(checksum);
            }
            Err(e) => {
                warn!(section = %kind, error = %e, "section fetch failed");
                abort.store(true, Ordering::SeqCst);
                out.error = Some(e);
            }
        }
        out
    }

    /// Follow a paginated section until the service stops returning a token.
    async fn fetch_paged<T, F, Fut>(
        &self,
        kind: SectionKind,
        semaphore: &Semaphore,
        abort: &AtomicBool,
        fetch_page: F,
    ) -> Fetched<T>
    where
        T: Serialize,
        F: Fn(Option<String>) -> Fut,
        Fut: Future<Output = MemliftResult<Page<T>>>,
    {
        let mut out = Fetched::empty();
        let Ok(_permit) = semaphore.acquire().await else {
            out.error = Some(MemliftError::Interrupted);
            return out;
        };

        let mut hasher = SectionHasher::new();
        let mut token: Option<String> = None;
        let mut page = 0usize;
        loop {
            if abort.load(Ordering::SeqCst) {
                return out;
            }
            if self.interrupted() {
                abort.store(true, Ordering::SeqCst);
                out.error = Some(MemliftError::Interrupted);
                return out;
            }

            page += 1;
            let outcome = retry_async(
                self.policy,
                self.clock,
                || fetch_page(token.clone()),
                MemliftError::is_retryable,
            )
            .await;
            let attempts = outcome.attempts();
            let fetched = match outcome.into_result() {
                Ok(p) => p,
                Err(e) => {
                    warn!(section = %kind, page, attempts, error = %e, "page fetch failed");
                    abort.store(true, Ordering::SeqCst);
                    out.error = Some(e);
                    return out;
                }
            };

            for record in &fetched.items {
                if let Err(e) = hasher.push(record) {
                    abort.store(true, Ordering::SeqCst);
                    out.error = Some(e);
                    return out;
                }
            }
            debug!(section = %kind, page, records = fetched.items.len(), "page fetched");
            out.records.extend(fetched.items);
            if fetched.total.is_some() {
                out.reported_total = fetched.total;
            }

            match fetched.next_page_token {
                Some(next) if token.as_deref() == Some(next.as_str()) => {
                    abort.store(true, Ordering::SeqCst);
                    out.error = Some(MemliftError::Protocol(format!(
                        "{kind} pagination repeated page token '{next}'"
                    )));
                    return out;
                }
                Some(next) => token = Some(next),
                None => break,
            }
        }

        let fetched = out.records.len() as u64;
        if let Some(reported) = out.reported_total.filter(|t| *t != fetched) {
            warn!(
                section = %kind,
                reported,
                fetched,
                "service total disagrees with records fetched"
            );
            if !self.allow_total_mismatch {
                abort.store(true, Ordering::SeqCst);
                out.error = Some(MemliftError::TruncatedPagination {
                    section: kind.to_string(),
                    reported,
                    fetched,
                });
                return out;
            }
        }
        info!(section = %kind, records = out.records.len(), pages = page, "section fetched");
        out.checksum = Some(hasher.finish());
        out
    }
}

/// Move a section's fetch result into the snapshot and return its records.
fn collect<T>(
    snapshot: &mut AgentSnapshot,
    errors: &mut Vec<MemliftError>,
    kind: SectionKind,
    fetched: Fetched<T>,
) -> Vec<T> {
    if let Some(total) = fetched.reported_total {
        snapshot.reported_totals.insert(kind, total);
    }
    if let Some(checksum) = fetched.checksum {
        snapshot.mark_complete(kind, checksum);
    }
    if let Some(error) = fetched.error {
        errors.push(error);
    }
    fetched.records
}
