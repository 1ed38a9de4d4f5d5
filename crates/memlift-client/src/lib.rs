//! Access to memory service instances.
//!
//! - `SourceClient`: paginated reads of core blocks, archival records,
//!   recall messages and tool definitions
//! - `TargetClient`: idempotent per-record writes
//! - `HttpMemoryClient`: both traits over the service's REST surface
//! - `InMemoryService`: both traits over in-process state, used for tests
//!   and rehearsals
//! - `retry`: bounded exponential backoff with an injectable clock

pub mod http;
pub mod in_memory;
pub mod retry;

pub use http::HttpMemoryClient;
pub use in_memory::InMemoryService;

use async_trait::async_trait;
use memlift_types::error::MemliftResult;
use memlift_types::memory::{ArchivalRecord, CoreMemoryBlock, RecallMessage, ToolDefinition};

/// One page of a paginated section.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Records on this page.
    pub items: Vec<T>,
    /// Cursor for the next page; `None` means end of stream.
    pub next_page_token: Option<String>,
    /// Total record count for the whole section, if the service reports one.
    pub total: Option<u64>,
}

impl<T> Page<T> {
    /// A final page with no successor.
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_page_token: None,
            total: None,
        }
    }
}

/// Result of an idempotent insert or append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The record was written by this call.
    Written,
    /// The target already held a record with the same idempotency key.
    AlreadyPresent,
}

/// Read access to a memory service.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// All core memory blocks of an agent.
    async fn list_core_blocks(&self, agent_id: &str) -> MemliftResult<Vec<CoreMemoryBlock>>;

    /// One page of archival records. `page_token` is `None` for the first page.
    async fn list_archival(
        &self,
        agent_id: &str,
        page_token: Option<&str>,
    ) -> MemliftResult<Page<ArchivalRecord>>;

    /// One page of recall messages in chronological order.
    async fn list_recall(
        &self,
        agent_id: &str,
        page_token: Option<&str>,
    ) -> MemliftResult<Page<RecallMessage>>;

    /// All tool definitions of an agent.
    async fn list_tools(&self, agent_id: &str) -> MemliftResult<Vec<ToolDefinition>>;

    /// Liveness check.
    async fn health(&self) -> MemliftResult<()>;
}

/// Write access to a memory service. Every call is a single atomic write.
#[async_trait]
pub trait TargetClient: Send + Sync {
    /// Create or replace the block with the same label.
    async fn upsert_core_block(&self, agent_id: &str, block: &CoreMemoryBlock)
        -> MemliftResult<()>;

    /// Insert an archival record keyed by `(source_agent_id, record.id)`.
    async fn insert_archival(
        &self,
        agent_id: &str,
        source_agent_id: &str,
        record: &ArchivalRecord,
    ) -> MemliftResult<WriteOutcome>;

    /// Append a recall message keyed by `(source_agent_id, message.id)`.
    async fn append_recall(
        &self,
        agent_id: &str,
        source_agent_id: &str,
        message: &RecallMessage,
    ) -> MemliftResult<WriteOutcome>;

    /// Create or replace the tool with the same name.
    async fn upsert_tool(&self, agent_id: &str, tool: &ToolDefinition) -> MemliftResult<()>;
}

/// A service that can be both read and written. Import targets need both:
/// writes for the import itself, reads for conflict checks and verification.
pub trait MemoryService: SourceClient + TargetClient {}

impl<T: SourceClient + TargetClient> MemoryService for T {}
