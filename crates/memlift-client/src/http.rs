//! HTTP client for the memory service REST surface.
//!
//! Reads:
//! - `GET /agents/{id}/core-memory/blocks`
//! - `GET /agents/{id}/archival-memory?limit=&page_token=`
//! - `GET /agents/{id}/messages?limit=&page_token=`
//! - `GET /agents/{id}/tools`
//! - `GET /health`
//!
//! Writes:
//! - `PUT /agents/{id}/core-memory/blocks/{label}`
//! - `POST /agents/{id}/archival-memory` (409 = already present)
//! - `POST /agents/{id}/messages` (409 = already present)
//! - `PUT /agents/{id}/tools/{name}`
//!
//! Archival and recall writes carry an `external_ref` naming the source agent
//! and source record id, plus a matching `Idempotency-Key` header. Reads
//! resolve a record's id from its `external_ref` when the service echoes one,
//! so records read back from a target compare equal to the snapshot.

use crate::{Page, SourceClient, TargetClient, WriteOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use memlift_types::config::ServiceEndpoint;
use memlift_types::error::{MemliftError, MemliftResult};
use memlift_types::memory::{
    ArchivalRecord, CoreMemoryBlock, Metadata, RecallMessage, ToolDefinition,
};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("memlift/", env!("CARGO_PKG_VERSION"));

/// Whether a failed call was reading or writing. Decides which transient
/// error variant a retryable failure becomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

impl Direction {
    fn transient(self, message: String) -> MemliftError {
        match self {
            Self::Read => MemliftError::TransientFetch(message),
            Self::Write => MemliftError::TransientWrite(message),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PageDto<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    total: Option<u64>,
}

impl<T> PageDto<T> {
    fn into_page<U: From<T>>(self) -> Page<U> {
        Page {
            items: self.items.into_iter().map(U::from).collect(),
            // Some services send an empty string instead of null at the end.
            next_page_token: self.next_page_token.filter(|t| !t.is_empty()),
            total: self.total,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ExternalRef {
    source_agent_id: String,
    source_id: String,
}

#[derive(Debug, Deserialize)]
struct ArchivalDto {
    id: String,
    text: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    embedding_ref: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    external_ref: Option<ExternalRef>,
}

impl From<ArchivalDto> for ArchivalRecord {
    fn from(dto: ArchivalDto) -> Self {
        Self {
            id: dto.external_ref.map(|r| r.source_id).unwrap_or(dto.id),
            text: dto.text,
            created_at: dto.created_at,
            embedding_ref: dto.embedding_ref,
            tags: dto.tags,
            metadata: dto.metadata,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RecallDto {
    id: String,
    role: String,
    content: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    external_ref: Option<ExternalRef>,
}

impl From<RecallDto> for RecallMessage {
    fn from(dto: RecallDto) -> Self {
        Self {
            id: dto.external_ref.map(|r| r.source_id).unwrap_or(dto.id),
            role: dto.role,
            content: dto.content,
            created_at: dto.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolName {
    name: String,
}

#[derive(Debug, Serialize)]
struct ArchivalWrite<'a> {
    text: &'a str,
    created_at: DateTime<Utc>,
    embedding_ref: Option<&'a str>,
    tags: &'a [String],
    metadata: &'a Metadata,
    external_ref: ExternalRef,
}

#[derive(Debug, Serialize)]
struct RecallWrite<'a> {
    role: &'a str,
    content: &'a str,
    created_at: DateTime<Utc>,
    external_ref: ExternalRef,
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Map a non-success status to the error taxonomy.
fn status_error(
    status: StatusCode,
    body: String,
    direction: Direction,
    agent_id: &str,
) -> MemliftError {
    match status.as_u16() {
        404 => MemliftError::NotFound(agent_id.to_string()),
        408 | 429 | 500..=599 => direction.transient(format!("service returned {status}: {body}")),
        code => MemliftError::Remote {
            status: code,
            message: body,
        },
    }
}

/// Map a transport failure. Anything short of a malformed body is retryable.
fn transport_error(err: reqwest::Error, direction: Direction) -> MemliftError {
    if err.is_decode() {
        MemliftError::Protocol(err.to_string())
    } else {
        direction.transient(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// REST client for one memory service instance.
#[derive(Debug, Clone)]
pub struct HttpMemoryClient {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
    page_size: u32,
}

impl HttpMemoryClient {
    /// Create a client. `timeout` bounds every individual request.
    pub fn new(
        endpoint: &ServiceEndpoint,
        timeout: Duration,
        page_size: u32,
    ) -> MemliftResult<Self> {
        let base_url = Url::parse(endpoint.base_url.trim()).map_err(|e| {
            MemliftError::Config(format!("invalid base URL '{}': {e}", endpoint.base_url))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(MemliftError::Config(format!(
                "base URL '{}' cannot carry a path",
                endpoint.base_url
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| MemliftError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            api_key: endpoint.api_key.clone(),
            page_size: page_size.max(1),
        })
    }

    /// Base URL this client talks to.
    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            path.extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        direction: Direction,
        agent_id: &str,
    ) -> MemliftResult<reqwest::Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(e, direction))?;
        let status = response.status();
        if status.is_success() || status == StatusCode::CONFLICT {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, body, direction, agent_id))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        agent_id: &str,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> MemliftResult<T> {
        let url = self.url(segments);
        debug!(url = %url, ?query, "GET");
        let mut builder = self.request(Method::GET, url);
        if !query.is_empty() {
            builder = builder.query(query);
        }
        let response = self.send(builder, Direction::Read, agent_id).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| transport_error(e, Direction::Read))
    }

    async fn get_page<T: DeserializeOwned>(
        &self,
        agent_id: &str,
        segments: &[&str],
        page_token: Option<&str>,
    ) -> MemliftResult<PageDto<T>> {
        let limit = self.page_size.to_string();
        let mut query = vec![("limit", limit.as_str())];
        if let Some(token) = page_token {
            query.push(("page_token", token));
        }
        self.get_json(agent_id, segments, &query).await
    }

    async fn post_idempotent<B: Serialize>(
        &self,
        agent_id: &str,
        segments: &[&str],
        idempotency_key: String,
        body: &B,
    ) -> MemliftResult<WriteOutcome> {
        let builder = self
            .request(Method::POST, self.url(segments))
            .header("Idempotency-Key", idempotency_key)
            .json(body);
        let response = self.send(builder, Direction::Write, agent_id).await?;
        if response.status() == StatusCode::CONFLICT {
            Ok(WriteOutcome::AlreadyPresent)
        } else {
            Ok(WriteOutcome::Written)
        }
    }
}

#[async_trait]
impl SourceClient for HttpMemoryClient {
    async fn list_core_blocks(&self, agent_id: &str) -> MemliftResult<Vec<CoreMemoryBlock>> {
        self.get_json(agent_id, &["agents", agent_id, "core-memory", "blocks"], &[])
            .await
    }

    async fn list_archival(
        &self,
        agent_id: &str,
        page_token: Option<&str>,
    ) -> MemliftResult<Page<ArchivalRecord>> {
        let page: PageDto<ArchivalDto> = self
            .get_page(agent_id, &["agents", agent_id, "archival-memory"], page_token)
            .await?;
        Ok(page.into_page())
    }

    async fn list_recall(
        &self,
        agent_id: &str,
        page_token: Option<&str>,
    ) -> MemliftResult<Page<RecallMessage>> {
        let page: PageDto<RecallDto> = self
            .get_page(agent_id, &["agents", agent_id, "messages"], page_token)
            .await?;
        Ok(page.into_page())
    }

    async fn list_tools(&self, agent_id: &str) -> MemliftResult<Vec<ToolDefinition>> {
        let raw: Vec<Box<RawValue>> = self
            .get_json(agent_id, &["agents", agent_id, "tools"], &[])
            .await?;
        raw.into_iter()
            .map(|value| {
                let ToolName { name } = serde_json::from_str(value.get())
                    .map_err(|e| MemliftError::Protocol(format!("tool without a name: {e}")))?;
                Ok(ToolDefinition {
                    name,
                    payload: value.get().to_string(),
                })
            })
            .collect()
    }

    async fn health(&self) -> MemliftResult<()> {
        let builder = self.request(Method::GET, self.url(&["health"]));
        self.send(builder, Direction::Read, "").await.map(|_| ())
    }
}

#[async_trait]
impl TargetClient for HttpMemoryClient {
    async fn upsert_core_block(
        &self,
        agent_id: &str,
        block: &CoreMemoryBlock,
    ) -> MemliftResult<()> {
        let url = self.url(&["agents", agent_id, "core-memory", "blocks", &block.label]);
        let builder = self.request(Method::PUT, url).json(block);
        self.send(builder, Direction::Write, agent_id).await.map(|_| ())
    }

    async fn insert_archival(
        &self,
        agent_id: &str,
        source_agent_id: &str,
        record: &ArchivalRecord,
    ) -> MemliftResult<WriteOutcome> {
        let body = ArchivalWrite {
            text: &record.text,
            created_at: record.created_at,
            embedding_ref: record.embedding_ref.as_deref(),
            tags: &record.tags,
            metadata: &record.metadata,
            external_ref: ExternalRef {
                source_agent_id: source_agent_id.to_string(),
                source_id: record.id.clone(),
            },
        };
        self.post_idempotent(
            agent_id,
            &["agents", agent_id, "archival-memory"],
            format!("{source_agent_id}:{}", record.id),
            &body,
        )
        .await
    }

    async fn append_recall(
        &self,
        agent_id: &str,
        source_agent_id: &str,
        message: &RecallMessage,
    ) -> MemliftResult<WriteOutcome> {
        let body = RecallWrite {
            role: &message.role,
            content: &message.content,
            created_at: message.created_at,
            external_ref: ExternalRef {
                source_agent_id: source_agent_id.to_string(),
                source_id: message.id.clone(),
            },
        };
        self.post_idempotent(
            agent_id,
            &["agents", agent_id, "messages"],
            format!("{source_agent_id}:{}", message.id),
            &body,
        )
        .await
    }

    async fn upsert_tool(&self, agent_id: &str, tool: &ToolDefinition) -> MemliftResult<()> {
        let url = self.url(&["agents", agent_id, "tools", &tool.name]);
        let builder = self
            .request(Method::PUT, url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(tool.payload.clone());
        self.send(builder, Direction::Write, agent_id).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> HttpMemoryClient {
        HttpMemoryClient::new(
            &ServiceEndpoint {
                base_url: base.to_string(),
                api_key: None,
            },
            Duration::from_secs(5),
            100,
        )
        .unwrap()
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, String::new(), Direction::Read, "a1"),
            MemliftError::NotFound(id) if id == "a1"
        ));
        assert!(matches!(
            status_error(StatusCode::SERVICE_UNAVAILABLE, String::new(), Direction::Read, "a1"),
            MemliftError::TransientFetch(_)
        ));
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, String::new(), Direction::Write, "a1"),
            MemliftError::TransientWrite(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, "nope".into(), Direction::Write, "a1"),
            MemliftError::Remote { status: 400, .. }
        ));
    }

    #[test]
    fn test_url_building_encodes_segments() {
        let c = client("http://localhost:8283/v1/");
        let url = c.url(&["agents", "agent 1", "core-memory", "blocks", "a/b"]);
        assert_eq!(
            url.as_str(),
            "http://localhost:8283/v1/agents/agent%201/core-memory/blocks/a%2Fb"
        );
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        let result = HttpMemoryClient::new(
            &ServiceEndpoint {
                base_url: "not a url".into(),
                api_key: None,
            },
            Duration::from_secs(1),
            10,
        );
        assert!(matches!(result, Err(MemliftError::Config(_))));
    }

    #[test]
    fn test_external_ref_resolves_source_id() {
        let dto: ArchivalDto = serde_json::from_str(
            r#"{"id":"target-9","text":"t","created_at":"2024-01-15T10:00:00Z",
                "external_ref":{"source_agent_id":"src","source_id":"p-1"}}"#,
        )
        .unwrap();
        let record = ArchivalRecord::from(dto);
        assert_eq!(record.id, "p-1");
    }

    #[test]
    fn test_empty_page_token_ends_stream() {
        let dto: PageDto<RecallDto> =
            serde_json::from_str(r#"{"items":[],"next_page_token":""}"#).unwrap();
        let page: Page<RecallMessage> = dto.into_page();
        assert_eq!(page.next_page_token, None);
        assert_eq!(page.total, None);
    }
}
