//! In-process memory service.
//!
//! Implements both [`SourceClient`] and [`TargetClient`] over shared state so
//! that whole export/import/verify runs can be exercised without a network.
//! Supports configurable page sizes, truncated pagination (the service
//! reports a full `total` but stops handing out page tokens early), and fault
//! injection per operation and optionally per record.

use crate::{Page, SourceClient, TargetClient, WriteOutcome};
use async_trait::async_trait;
use memlift_types::error::{MemliftError, MemliftResult};
use memlift_types::memory::{ArchivalRecord, CoreMemoryBlock, RecallMessage, ToolDefinition};
use memlift_types::snapshot::SnapshotSections;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Service operations that can be counted or made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListCoreBlocks,
    ListArchival,
    ListRecall,
    ListTools,
    Health,
    UpsertCoreBlock,
    InsertArchival,
    AppendRecall,
    UpsertTool,
}

impl Operation {
    fn is_write(self) -> bool {
        matches!(
            self,
            Self::UpsertCoreBlock | Self::InsertArchival | Self::AppendRecall | Self::UpsertTool
        )
    }
}

/// Kind of injected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Retryable: `TransientFetch` on reads, `TransientWrite` on writes.
    Transient,
    /// `NotFound` for the agent.
    NotFound,
    /// Non-retryable service rejection (`Remote` 422).
    Fatal,
}

#[derive(Debug, Clone)]
struct Fault {
    op: Operation,
    kind: FaultKind,
    record_id: Option<String>,
    /// `None` fails forever.
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct AgentStore {
    memory: SnapshotSections,
    archival_keys: HashSet<(String, String)>,
    recall_keys: HashSet<(String, String)>,
}

#[derive(Debug)]
struct Inner {
    agents: BTreeMap<String, AgentStore>,
    faults: Vec<Fault>,
    calls: HashMap<Operation, usize>,
    page_size: usize,
    truncate_after_pages: Option<usize>,
    report_totals: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            agents: BTreeMap::new(),
            faults: Vec::new(),
            calls: HashMap::new(),
            page_size: 100,
            truncate_after_pages: None,
            report_totals: true,
        }
    }
}

impl Inner {
    /// Count the call and apply the first matching fault, if any.
    fn enter(
        &mut self,
        op: Operation,
        agent_id: &str,
        record_id: Option<&str>,
    ) -> MemliftResult<()> {
        *self.calls.entry(op).or_default() += 1;

        let hit = self.faults.iter_mut().find(|f| {
            f.op == op
                && f.remaining != Some(0)
                && match (&f.record_id, record_id) {
                    (None, _) => true,
                    (Some(want), Some(got)) => want == got,
                    (Some(_), None) => false,
                }
        });
        let Some(fault) = hit else {
            return Ok(());
        };
        if let Some(n) = fault.remaining.as_mut() {
            *n -= 1;
        }
        let message = format!("injected failure on {op:?}");
        Err(match fault.kind {
            FaultKind::Transient if op.is_write() => MemliftError::TransientWrite(message),
            FaultKind::Transient => MemliftError::TransientFetch(message),
            FaultKind::NotFound => MemliftError::NotFound(agent_id.to_string()),
            FaultKind::Fatal => MemliftError::Remote {
                status: 422,
                message,
            },
        })
    }

    fn agent(&self, agent_id: &str) -> MemliftResult<&AgentStore> {
        self.agents
            .get(agent_id)
            .ok_or_else(|| MemliftError::NotFound(agent_id.to_string()))
    }

    fn agent_mut(&mut self, agent_id: &str) -> MemliftResult<&mut AgentStore> {
        self.agents
            .get_mut(agent_id)
            .ok_or_else(|| MemliftError::NotFound(agent_id.to_string()))
    }

    fn page<T: Clone>(&self, items: &[T], page_token: Option<&str>) -> MemliftResult<Page<T>> {
        let offset = match page_token {
            None => 0,
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| MemliftError::Remote {
                    status: 400,
                    message: format!("invalid page token '{token}'"),
                })?,
        };
        let start = offset.min(items.len());
        let end = (start + self.page_size).min(items.len());
        let page_index = start / self.page_size;
        let truncated = self
            .truncate_after_pages
            .is_some_and(|limit| page_index + 1 >= limit);
        let next_page_token = (end < items.len() && !truncated).then(|| end.to_string());
        Ok(Page {
            items: items[start..end].to_vec(),
            next_page_token,
            total: self.report_totals.then_some(items.len() as u64),
        })
    }
}

/// Shared in-process memory service. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryService {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryService {
    /// An empty service with a page size of 100.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records returned per page on paginated reads.
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.lock().page_size = page_size.max(1);
        self
    }

    /// Stop handing out page tokens after `pages` pages while still
    /// reporting the full total.
    pub fn truncate_after_pages(&self, pages: usize) {
        self.lock().truncate_after_pages = Some(pages.max(1));
    }

    /// Whether paginated reads report a `total`.
    pub fn set_report_totals(&self, report: bool) {
        self.lock().report_totals = report;
    }

    /// Create an empty agent. Existing state is kept.
    pub fn create_agent(&self, agent_id: &str) {
        self.lock().agents.entry(agent_id.to_string()).or_default();
    }

    /// Replace an agent's memory wholesale.
    pub fn seed_agent(&self, agent_id: &str, memory: SnapshotSections) {
        self.lock().agents.insert(
            agent_id.to_string(),
            AgentStore {
                memory,
                ..Default::default()
            },
        );
    }

    /// Current memory of an agent.
    pub fn agent(&self, agent_id: &str) -> Option<SnapshotSections> {
        self.lock().agents.get(agent_id).map(|a| a.memory.clone())
    }

    /// Mutate an agent's memory in place. Returns `false` for unknown agents.
    pub fn edit_agent(&self, agent_id: &str, edit: impl FnOnce(&mut SnapshotSections)) -> bool {
        match self.lock().agents.get_mut(agent_id) {
            Some(store) => {
                edit(&mut store.memory);
                true
            }
            None => false,
        }
    }

    /// Fail `op` for the next `times` calls (`None` = every call).
    pub fn fail(&self, op: Operation, kind: FaultKind, times: Option<u32>) {
        self.lock().faults.push(Fault {
            op,
            kind,
            record_id: None,
            remaining: times,
        });
    }

    /// Fail `op` only when it touches `record_id` (label, record id, message
    /// id or tool name).
    pub fn fail_record(&self, op: Operation, record_id: &str, kind: FaultKind, times: Option<u32>) {
        self.lock().faults.push(Fault {
            op,
            kind,
            record_id: Some(record_id.to_string()),
            remaining: times,
        });
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Number of times `op` was called, including failed calls.
    pub fn calls(&self, op: Operation) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Total calls across all write operations.
    pub fn write_calls(&self) -> usize {
        let inner = self.lock();
        inner
            .calls
            .iter()
            .filter(|(op, _)| op.is_write())
            .map(|(_, n)| *n)
            .sum()
    }
}

#[async_trait]
impl SourceClient for InMemoryService {
    async fn list_core_blocks(&self, agent_id: &str) -> MemliftResult<Vec<CoreMemoryBlock>> {
        let mut inner = self.lock();
        inner.enter(Operation::ListCoreBlocks, agent_id, None)?;
        Ok(inner.agent(agent_id)?.memory.core_blocks.clone())
    }

    async fn list_archival(
        &self,
        agent_id: &str,
        page_token: Option<&str>,
    ) -> MemliftResult<Page<ArchivalRecord>> {
        let mut inner = self.lock();
        inner.enter(Operation::ListArchival, agent_id, None)?;
        let inner = &*inner;
        inner.page(&inner.agent(agent_id)?.memory.archival_records, page_token)
    }

    async fn list_recall(
        &self,
        agent_id: &str,
        page_token: Option<&str>,
    ) -> MemliftResult<Page<RecallMessage>> {
        let mut inner = self.lock();
        inner.enter(Operation::ListRecall, agent_id, None)?;
        let inner = &*inner;
        inner.page(&inner.agent(agent_id)?.memory.recall_messages, page_token)
    }

    async fn list_tools(&self, agent_id: &str) -> MemliftResult<Vec<ToolDefinition>> {
        let mut inner = self.lock();
        inner.enter(Operation::ListTools, agent_id, None)?;
        Ok(inner.agent(agent_id)?.memory.tool_defs.clone())
    }

    async fn health(&self) -> MemliftResult<()> {
        self.lock().enter(Operation::Health, "", None)
    }
}

#[async_trait]
impl TargetClient for InMemoryService {
    async fn upsert_core_block(
        &self,
        agent_id: &str,
        block: &CoreMemoryBlock,
    ) -> MemliftResult<()> {
        let mut inner = self.lock();
        inner.enter(Operation::UpsertCoreBlock, agent_id, Some(&block.label))?;
        let blocks = &mut inner.agent_mut(agent_id)?.memory.core_blocks;
        match blocks.iter_mut().find(|b| b.label == block.label) {
            Some(existing) => *existing = block.clone(),
            None => blocks.push(block.clone()),
        }
        Ok(())
    }

    async fn insert_archival(
        &self,
        agent_id: &str,
        source_agent_id: &str,
        record: &ArchivalRecord,
    ) -> MemliftResult<WriteOutcome> {
        let mut inner = self.lock();
        inner.enter(Operation::InsertArchival, agent_id, Some(&record.id))?;
        let store = inner.agent_mut(agent_id)?;
        if !store
            .archival_keys
            .insert((source_agent_id.to_string(), record.id.clone()))
        {
            return Ok(WriteOutcome::AlreadyPresent);
        }
        store.memory.archival_records.push(record.clone());
        Ok(WriteOutcome::Written)
    }

    async fn append_recall(
        &self,
        agent_id: &str,
        source_agent_id: &str,
        message: &RecallMessage,
    ) -> MemliftResult<WriteOutcome> {
        let mut inner = self.lock();
        inner.enter(Operation::AppendRecall, agent_id, Some(&message.id))?;
        let store = inner.agent_mut(agent_id)?;
        if !store
            .recall_keys
            .insert((source_agent_id.to_string(), message.id.clone()))
        {
            return Ok(WriteOutcome::AlreadyPresent);
        }
        store.memory.recall_messages.push(message.clone());
        Ok(WriteOutcome::Written)
    }

    async fn upsert_tool(&self, agent_id: &str, tool: &ToolDefinition) -> MemliftResult<()> {
        let mut inner = self.lock();
        inner.enter(Operation::UpsertTool, agent_id, Some(&tool.name))?;
        let tools = &mut inner.agent_mut(agent_id)?.memory.tool_defs;
        match tools.iter_mut().find(|t| t.name == tool.name) {
            Some(existing) => *existing = tool.clone(),
            None => tools.push(tool.clone()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn message(i: u32) -> RecallMessage {
        RecallMessage {
            id: format!("m{i}"),
            role: "user".into(),
            content: format!("message {i}"),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, i).unwrap(),
        }
    }

    fn seeded(count: u32, page_size: usize) -> InMemoryService {
        let service = InMemoryService::new().with_page_size(page_size);
        service.seed_agent(
            "a1",
            SnapshotSections {
                recall_messages: (0..count).map(message).collect(),
                ..Default::default()
            },
        );
        service
    }

    #[tokio::test]
    async fn test_pagination_walks_all_pages() {
        let service = seeded(7, 3);
        let mut token: Option<String> = None;
        let mut ids = Vec::new();
        loop {
            let page = service.list_recall("a1", token.as_deref()).await.unwrap();
            assert_eq!(page.total, Some(7));
            ids.extend(page.items.into_iter().map(|m| m.id));
            token = page.next_page_token;
            if token.is_none() {
                break;
            }
        }
        assert_eq!(ids, (0..7).map(|i| format!("m{i}")).collect::<Vec<_>>());
        assert_eq!(service.calls(Operation::ListRecall), 3);
    }

    #[tokio::test]
    async fn test_truncated_pagination_still_reports_total() {
        let service = seeded(9, 3);
        service.truncate_after_pages(2);
        let first = service.list_recall("a1", None).await.unwrap();
        let second = service
            .list_recall("a1", first.next_page_token.as_deref())
            .await
            .unwrap();
        assert_eq!(second.items.len(), 3);
        assert_eq!(second.next_page_token, None);
        assert_eq!(second.total, Some(9));
    }

    #[tokio::test]
    async fn test_unknown_agent_is_not_found() {
        let service = InMemoryService::new();
        let err = service.list_core_blocks("ghost").await.unwrap_err();
        assert!(matches!(err, MemliftError::NotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_faults_fire_then_clear() {
        let service = seeded(1, 10);
        service.fail(Operation::ListRecall, FaultKind::Transient, Some(2));
        assert!(service.list_recall("a1", None).await.unwrap_err().is_retryable());
        assert!(service.list_recall("a1", None).await.unwrap_err().is_retryable());
        assert!(service.list_recall("a1", None).await.is_ok());
        assert_eq!(service.calls(Operation::ListRecall), 3);
    }

    #[tokio::test]
    async fn test_record_fault_only_hits_that_record() {
        let service = seeded(0, 10);
        service.fail_record(Operation::AppendRecall, "m1", FaultKind::Fatal, None);
        assert_eq!(
            service.append_recall("a1", "src", &message(0)).await.unwrap(),
            WriteOutcome::Written
        );
        let err = service.append_recall("a1", "src", &message(1)).await.unwrap_err();
        assert!(matches!(err, MemliftError::Remote { status: 422, .. }));
        assert_eq!(service.write_calls(), 2);
    }

    #[tokio::test]
    async fn test_appends_are_deduplicated_per_source() {
        let service = seeded(0, 10);
        let m = message(1);
        assert_eq!(
            service.append_recall("a1", "src", &m).await.unwrap(),
            WriteOutcome::Written
        );
        assert_eq!(
            service.append_recall("a1", "src", &m).await.unwrap(),
            WriteOutcome::AlreadyPresent
        );
        assert_eq!(
            service.append_recall("a1", "other", &m).await.unwrap(),
            WriteOutcome::Written
        );
        assert_eq!(service.agent("a1").unwrap().recall_messages.len(), 2);
    }

    #[tokio::test]
    async fn test_upserts_replace_by_key() {
        let service = InMemoryService::new();
        service.create_agent("a1");
        let mut block = CoreMemoryBlock {
            label: "human".into(),
            content: "v1".into(),
            limit: 100,
            metadata: Default::default(),
        };
        service.upsert_core_block("a1", &block).await.unwrap();
        block.content = "v2".into();
        service.upsert_core_block("a1", &block).await.unwrap();
        let blocks = service.agent("a1").unwrap().core_blocks;
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].content, "v2");
    }
}
