//! External services the orchestrator depends on, and their HTTP implementation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};

use crate::config::GeneratorConfig;
use crate::error::{ErrorCode, ErrorContext, GenerationError, Result};
use crate::papers::{PaperCollectionApi, PaperCollectionStatus};

// ============================================================================
// Targets
// ============================================================================

/// A chapter inside a project; the unit a generation is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChapterRef {
    pub project_id: String,
    pub chapter_id: String,
}

impl ChapterRef {
    pub fn new(project_id: impl Into<String>, chapter_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            chapter_id: chapter_id.into(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.project_id, self.chapter_id)
    }

    fn chapter_path(&self, tail: &str) -> String {
        format!(
            "/api/projects/{}/chapters/{}/{}",
            self.project_id, self.chapter_id, tail
        )
    }

    pub fn stream_path(&self) -> String {
        self.chapter_path("stream")
    }

    pub fn papers_collect_path(&self) -> String {
        self.chapter_path("papers/collect")
    }

    pub fn papers_status_path(&self) -> String {
        self.chapter_path("papers/status")
    }

    pub fn save_path(&self) -> String {
        self.chapter_path("save")
    }
}

impl fmt::Display for ChapterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chapter {} of project {}", self.chapter_id, self.project_id)
    }
}

pub fn project_events_path(project_id: &str) -> String {
    format!("/api/projects/{}/generation/events", project_id)
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceCheck {
    #[serde(alias = "canProceed")]
    pub can_proceed: bool,
    pub balance: u64,
    pub required: u64,
    #[serde(default)]
    pub shortage: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub words_used: usize,
    pub description: String,
    pub reference_type: String,
    pub reference_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveChapterRequest {
    pub content: String,
    pub word_count: usize,
}

// ============================================================================
// Collaborator capabilities
// ============================================================================

#[async_trait]
pub trait BalanceService: Send + Sync {
    async fn check_balance(&self, required_words: u64) -> Result<BalanceCheck>;
}

#[async_trait]
pub trait UsageRecorder: Send + Sync {
    async fn record_word_usage(&self, record: &UsageRecord) -> Result<()>;
}

#[async_trait]
pub trait ChapterStore: Send + Sync {
    async fn save_chapter(&self, target: &ChapterRef, content: &str, word_count: usize) -> Result<()>;
}

/// Everything the orchestrator talks to besides the stream itself.
#[derive(Clone)]
pub struct Collaborators {
    pub balance: Arc<dyn BalanceService>,
    pub usage: Arc<dyn UsageRecorder>,
    pub chapters: Arc<dyn ChapterStore>,
    pub papers: Arc<dyn PaperCollectionApi>,
}

impl Collaborators {
    pub fn http(backend: HttpBackend) -> Self {
        let backend = Arc::new(backend);
        Self {
            balance: backend.clone(),
            usage: backend.clone(),
            chapters: backend.clone(),
            papers: backend,
        }
    }
}

// ============================================================================
// HTTP backend
// ============================================================================

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    config: GeneratorConfig,
}

impl HttpBackend {
    pub fn new(config: GeneratorConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(client: Client, config: GeneratorConfig) -> Self {
        Self { client, config }
    }

    fn url(&self, path: &str) -> String {
        self.config.endpoint(path)
    }

    async fn expect_success(resp: Response, what: &str) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let preview: String = body.chars().take(200).collect();
        Err(GenerationError::new(
            ErrorCode::ExternalServiceError,
            format!("{} failed with HTTP {}: {}", what, status, preview),
        ))
    }
}

#[async_trait]
impl BalanceService for HttpBackend {
    async fn check_balance(&self, required_words: u64) -> Result<BalanceCheck> {
        let resp = self
            .client
            .post(self.url("/api/words/check-balance"))
            .json(&serde_json::json!({ "required_words": required_words }))
            .send()
            .await
            .context("balance check")?;
        let check = Self::expect_success(resp, "balance check")
            .await?
            .json::<BalanceCheck>()
            .await
            .context("balance check")?;
        log::debug!(
            "balance check: required={} balance={} can_proceed={}",
            check.required,
            check.balance,
            check.can_proceed
        );
        Ok(check)
    }
}

#[async_trait]
impl UsageRecorder for HttpBackend {
    async fn record_word_usage(&self, record: &UsageRecord) -> Result<()> {
        let resp = self
            .client
            .post(self.url("/api/words/usage"))
            .json(record)
            .send()
            .await
            .context("usage recording")?;
        Self::expect_success(resp, "usage recording").await?;
        Ok(())
    }
}

#[async_trait]
impl ChapterStore for HttpBackend {
    async fn save_chapter(&self, target: &ChapterRef, content: &str, word_count: usize) -> Result<()> {
        let body = SaveChapterRequest {
            content: content.to_string(),
            word_count,
        };
        let resp = self
            .client
            .post(self.url(&target.save_path()))
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::new(ErrorCode::SaveFailed, e.to_string()))?;
        Self::expect_success(resp, "chapter save")
            .await
            .map_err(|e| GenerationError::new(ErrorCode::SaveFailed, e.message))?;
        Ok(())
    }
}

#[async_trait]
impl PaperCollectionApi for HttpBackend {
    async fn start_collection(&self, target: &ChapterRef) -> Result<()> {
        let resp = self
            .client
            .post(self.url(&target.papers_collect_path()))
            .send()
            .await
            .context("paper collection start")?;
        Self::expect_success(resp, "paper collection start").await?;
        Ok(())
    }

    async fn fetch_status(&self, target: &ChapterRef) -> Result<PaperCollectionStatus> {
        let resp = self
            .client
            .get(self.url(&target.papers_status_path()))
            .send()
            .await
            .context("paper status")?;
        let status = Self::expect_success(resp, "paper status")
            .await?
            .json::<PaperCollectionStatus>()
            .await
            .context("paper status")?;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chapter_paths() {
        let target = ChapterRef::new("p1", "c2");
        assert_eq!(target.key(), "p1/c2");
        assert_eq!(target.stream_path(), "/api/projects/p1/chapters/c2/stream");
        assert_eq!(target.papers_status_path(), "/api/projects/p1/chapters/c2/papers/status");
        assert_eq!(project_events_path("p1"), "/api/projects/p1/generation/events");
    }

    #[test]
    fn test_balance_check_accepts_camel_case() {
        let check: BalanceCheck =
            serde_json::from_str(r#"{"canProceed":false,"balance":100,"required":600,"shortage":500}"#).unwrap();
        assert!(!check.can_proceed);
        assert_eq!(check.shortage, 500);
    }

    fn backend(base_url: &str) -> HttpBackend {
        HttpBackend::new(GeneratorConfig {
            base_url: base_url.to_string(),
            ..GeneratorConfig::default()
        })
    }

    #[tokio::test]
    async fn test_unreachable_backend_error_names_the_call() {
        // nothing listens on the discard port
        let err = backend("http://127.0.0.1:9").check_balance(100).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionError);
        assert!(err.message.starts_with("balance check: HTTP error"), "{}", err.message);
    }

    #[tokio::test]
    async fn test_malformed_status_body_is_bad_response() {
        use axum::routing::get;

        let app = axum::Router::new().route(
            "/api/projects/{project}/chapters/{chapter}/papers/status",
            get(|| async { "not json" }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let err = backend(&format!("http://{}", addr))
            .fetch_status(&ChapterRef::new("p1", "c2"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadResponse);
        assert!(err.message.starts_with("paper status: Decode error"), "{}", err.message);
    }
}
