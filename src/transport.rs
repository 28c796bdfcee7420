//! Server-push transport capability and its SSE implementation.
//!
//! The session only needs four things from a transport: open (a successful
//! `connect`), messages, errors, and close (dropping the stream). Anything
//! that can provide those, native SSE or a WebSocket bridge, can drive it.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use reqwest::header::ACCEPT;
use thiserror::Error;

use crate::events::{ServerEvent, StreamRequest};

pub type EventStream = BoxStream<'static, Result<ServerEvent, TransportError>>;

/// A named event from a broadcast channel (SSE `event:` + `data:`).
#[derive(Debug, Clone, PartialEq)]
pub struct NamedEvent {
    pub name: String,
    pub data: String,
}

pub type NamedEventStream = BoxStream<'static, Result<NamedEvent, TransportError>>;

// ============================================================================
// Transport errors
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// Errors the server will answer the same way no matter how often we ask.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Http { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            _ => false,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(Duration::ZERO)
        } else {
            Self::Connect(err.to_string())
        }
    }
}

// ============================================================================
// Transport capability
// ============================================================================

#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Opens a stream for `request`. Returning `Ok` is the "open" signal;
    /// dropping the returned stream closes the connection.
    async fn connect(&self, request: &StreamRequest) -> Result<EventStream, TransportError>;
}

// ============================================================================
// SSE over reqwest
// ============================================================================

#[derive(Debug, Clone)]
pub struct SseTransport {
    client: Client,
}

impl Default for SseTransport {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

impl SseTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn open(
        &self,
        url: &str,
        query: &[(&'static str, String)],
    ) -> Result<reqwest::Response, TransportError> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let preview: String = body.chars().take(200).collect();
            log::warn!("SSE endpoint {} answered {}: {}", url, status, preview);
            return Err(TransportError::Http {
                status: status.as_u16(),
                body: preview,
            });
        }
        Ok(resp)
    }

    /// Subscribes to a broadcast endpoint that uses named SSE events.
    pub async fn subscribe(&self, url: &str) -> Result<NamedEventStream, TransportError> {
        let resp = self.open(url, &[]).await?;
        let stream = resp.bytes_stream().eventsource().filter_map(|item| async move {
            match item {
                Ok(event) if event.data.is_empty() => None,
                Ok(event) => Some(Ok(NamedEvent {
                    name: event.event,
                    data: event.data,
                })),
                Err(e) => Some(Err(TransportError::Stream(e.to_string()))),
            }
        });
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl EventTransport for SseTransport {
    async fn connect(&self, request: &StreamRequest) -> Result<EventStream, TransportError> {
        log::debug!(
            "📡 opening {} stream at {} (resume_from={:?})",
            request.generation_type,
            request.url,
            request.resume_from
        );
        let resp = self.open(&request.url, &request.query_pairs()).await?;

        let stream = resp.bytes_stream().eventsource().filter_map(|item| async move {
            match item {
                Ok(event) => parse_event_data(&event.data).map(Ok),
                Err(e) => Some(Err(TransportError::Stream(e.to_string()))),
            }
        });
        Ok(Box::pin(stream))
    }
}

/// Decodes one SSE `data:` payload. Blank and unparsable payloads are skipped.
pub fn parse_event_data(data: &str) -> Option<ServerEvent> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<ServerEvent>(data) {
        Ok(event) => Some(event),
        Err(e) => {
            log::debug!("Skipping unparsable stream event: {} - {}", e, data);
            None
        }
    }
}

// ============================================================================
// Scripted transport for tests
// ============================================================================
