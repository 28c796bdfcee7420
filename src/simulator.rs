//! Local stand-in for the writing service.
//!
//! Serves every endpoint the engine talks to with deterministic text, so
//! resumed streams can be checked word for word. Fault injection:
//! `fail_after=N` drops the connection once N words were sent and
//! `error_after=N` emits a recoverable server error instead. Both only
//! apply to connections that start before word N.

use std::collections::HashMap;
use std::convert::Infallible;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive};
use axum::response::Sse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::collaborators::{BalanceCheck, ChapterRef, SaveChapterRequest, UsageRecord};
use crate::error::{ErrorCode, GenerationError, Result};
use crate::events::{GenerationType, ServerErrorEvent, ServerEvent};
use crate::papers::{CollectionStatus, PaperCollectionStatus, PaperPreview};
use crate::word_count::count_words;

const VOCABULARY: &[&str] = &[
    "research", "analysis", "framework", "evidence", "method", "literature", "results",
    "theory", "context", "findings", "approach", "study", "data", "model", "significant",
    "suggests", "sample", "variables", "outcomes", "critical",
];

const SOURCES: &[&str] = &["semantic_scholar", "crossref", "arxiv", "pubmed"];

/// Word `i` of every simulated generation.
pub fn simulated_word(i: usize) -> &'static str {
    VOCABULARY[(i * 7 + i / VOCABULARY.len()) % VOCABULARY.len()]
}

pub fn simulated_text(range: Range<usize>) -> String {
    range.map(|i| format!("{} ", simulated_word(i))).collect()
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub chunk_delay: Duration,
    pub words_per_chunk: usize,
    pub heartbeat_every_chunks: usize,
    pub autosave_every_words: usize,
    pub default_target_words: usize,
    pub initial_balance: u64,
    /// Status polls before a paper collection completes.
    pub collection_polls: u32,
    pub fail_after: Option<usize>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            chunk_delay: Duration::from_millis(150),
            words_per_chunk: 8,
            heartbeat_every_chunks: 10,
            autosave_every_words: 100,
            default_target_words: 500,
            initial_balance: 50_000,
            collection_polls: 4,
            fail_after: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationRecord {
    pub target: String,
    pub generation_type: GenerationType,
    pub words_sent: usize,
    pub connections: u32,
    pub completed: bool,
}

pub struct SimulatorState {
    config: SimulatorConfig,
    balance: RwLock<u64>,
    generations: RwLock<HashMap<String, GenerationRecord>>,
    collections: RwLock<HashMap<String, u32>>,
    chapters: RwLock<HashMap<String, SaveChapterRequest>>,
    usage: RwLock<Vec<UsageRecord>>,
}

impl SimulatorState {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            balance: RwLock::new(config.initial_balance),
            config,
            generations: RwLock::new(HashMap::new()),
            collections: RwLock::new(HashMap::new()),
            chapters: RwLock::new(HashMap::new()),
            usage: RwLock::new(Vec::new()),
        }
    }

    pub async fn balance(&self) -> u64 {
        *self.balance.read().await
    }

    pub async fn saved_chapter(&self, target: &ChapterRef) -> Option<SaveChapterRequest> {
        self.chapters.read().await.get(&target.key()).cloned()
    }

    pub async fn usage_records(&self) -> Vec<UsageRecord> {
        self.usage.read().await.clone()
    }

    pub async fn generation(&self, generation_id: &str) -> Option<GenerationRecord> {
        self.generations.read().await.get(generation_id).cloned()
    }

    async fn track_connection(&self, generation_id: &str, target: String, generation_type: GenerationType) {
        let mut generations = self.generations.write().await;
        let record = generations
            .entry(generation_id.to_string())
            .or_insert_with(|| GenerationRecord {
                target,
                generation_type,
                words_sent: 0,
                connections: 0,
                completed: false,
            });
        record.connections += 1;
    }

    async fn track_progress(&self, generation_id: &str, words_sent: usize, completed: bool) {
        if let Some(record) = self.generations.write().await.get_mut(generation_id) {
            record.words_sent = words_sent;
            record.completed = completed;
        }
    }
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: Arc<SimulatorState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route(
            "/api/projects/{project}/chapters/{chapter}/stream",
            get(stream_chapter),
        )
        .route(
            "/api/projects/{project}/chapters/{chapter}/papers/collect",
            post(start_collection),
        )
        .route(
            "/api/projects/{project}/chapters/{chapter}/papers/status",
            get(collection_status),
        )
        .route(
            "/api/projects/{project}/chapters/{chapter}/save",
            post(save_chapter),
        )
        .route("/api/words/check-balance", post(check_balance))
        .route("/api/words/usage", post(record_usage))
        .route(
            "/api/projects/{project}/generation/events",
            get(project_events),
        )
        .with_state(state)
}

fn sse_data(event: &ServerEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(json) => Event::default().data(json),
        Err(e) => Event::default().data(format!(
            r#"{{"type":"error","code":"INTERNAL_ERROR","message":"{}"}}"#,
            e
        )),
    }
}

fn keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(15))
        .text("keep-alive")
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// ============================================================================
// Chapter stream
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub generation_type: GenerationType,
    pub section_type: Option<String>,
    pub selected_text: Option<String>,
    pub style: Option<String>,
    pub target_words: Option<usize>,
    pub resume_from: Option<usize>,
    pub generation_id: Option<String>,
    pub fail_after: Option<usize>,
    pub error_after: Option<usize>,
}

pub async fn stream_chapter(
    State(state): State<Arc<SimulatorState>>,
    Path((project, chapter)): Path<(String, String)>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let target_words = query.target_words.unwrap_or_else(|| match &query.selected_text {
        Some(text) if query.generation_type.is_selection_scoped() => count_words(text).max(1),
        _ => state.config.default_target_words,
    });
    let start = query.resume_from.unwrap_or(0).min(target_words);
    let generation_id = query
        .generation_id
        .clone()
        .unwrap_or_else(|| Uuid::now_v7().to_string());
    let applies = |limit: &usize| start < *limit && *limit < target_words;
    let fail_after = query.fail_after.or(state.config.fail_after).filter(applies);
    let error_after = query.error_after.filter(applies);

    let key = ChapterRef::new(project, chapter).key();
    log::info!(
        "📡 {} stream for {} (words {}..{}, generation {})",
        query.generation_type,
        key,
        start,
        target_words,
        generation_id
    );
    if let Some(section) = &query.section_type {
        log::debug!("section: {}", section);
    }
    if let Some(style) = &query.style {
        log::debug!("style: {}", style);
    }
    state
        .track_connection(&generation_id, key, query.generation_type)
        .await;

    let config = state.config.clone();
    let stream = async_stream::stream! {
        yield Ok(sse_data(&ServerEvent::Start {
            generation_id: Some(generation_id.clone()),
            message: Some(if start > 0 {
                format!("Resuming from word {}", start)
            } else {
                "Generation started".to_string()
            }),
        }));

        let mut position = start;
        let mut chunks = 0usize;
        let mut autosaved = start / config.autosave_every_words.max(1);

        while position < target_words {
            if !config.chunk_delay.is_zero() {
                tokio::time::sleep(config.chunk_delay).await;
            }
            let mut next = (position + config.words_per_chunk.max(1)).min(target_words);
            if let Some(limit) = fail_after.or(error_after) {
                if position < limit {
                    next = next.min(limit);
                }
            }

            yield Ok(sse_data(&ServerEvent::Content {
                content: simulated_text(position..next),
                word_count: Some(next),
            }));
            position = next;
            chunks += 1;
            state.track_progress(&generation_id, position, false).await;

            if fail_after == Some(position) {
                log::warn!("💥 dropping stream {} at {} words", generation_id, position);
                return;
            }
            if error_after == Some(position) {
                log::warn!("💥 failing stream {} at {} words", generation_id, position);
                yield Ok(sse_data(&ServerEvent::Error(ServerErrorEvent {
                    code: "MODEL_OVERLOADED".to_string(),
                    message: "The model is temporarily overloaded".to_string(),
                    can_resume: true,
                    partial_saved: true,
                    saved_word_count: Some(position),
                })));
                return;
            }

            let every = config.autosave_every_words.max(1);
            if position / every > autosaved {
                autosaved = position / every;
                yield Ok(sse_data(&ServerEvent::Autosave {
                    word_count: position,
                    message: Some("Progress saved".to_string()),
                }));
            }
            if chunks % config.heartbeat_every_chunks.max(1) == 0 {
                yield Ok(sse_data(&ServerEvent::Heartbeat {
                    timestamp: Some(chrono::Utc::now().timestamp()),
                }));
            }
        }

        state.track_progress(&generation_id, position, true).await;
        yield Ok(sse_data(&ServerEvent::Complete {
            final_word_count: target_words,
            generation_id: Some(generation_id.clone()),
        }));
    };

    Sse::new(stream).keep_alive(keep_alive())
}

// ============================================================================
// Paper collection
// ============================================================================

pub async fn start_collection(
    State(state): State<Arc<SimulatorState>>,
    Path((project, chapter)): Path<(String, String)>,
) -> (StatusCode, Json<PaperCollectionStatus>) {
    let key = ChapterRef::new(project, chapter).key();
    log::info!("📚 paper collection started for {}", key);
    state.collections.write().await.insert(key, 0);
    (
        StatusCode::ACCEPTED,
        Json(PaperCollectionStatus {
            status: CollectionStatus::Initializing,
            message: "Collection started".to_string(),
            ..Default::default()
        }),
    )
}

pub async fn collection_status(
    State(state): State<Arc<SimulatorState>>,
    Path((project, chapter)): Path<(String, String)>,
) -> Result<Json<PaperCollectionStatus>> {
    let key = ChapterRef::new(project, chapter).key();
    let polls = {
        let mut collections = state.collections.write().await;
        let polls = collections.get_mut(&key).ok_or_else(|| {
            GenerationError::new(ErrorCode::NotFound, format!("no paper collection for {}", key))
        })?;
        *polls += 1;
        *polls
    };

    let total = state.config.collection_polls.max(1);
    let done = polls.min(total) as usize;
    let sources_completed: Vec<String> = SOURCES
        .iter()
        .take(done * SOURCES.len() / total as usize)
        .map(|s| s.to_string())
        .collect();

    if polls >= total {
        return Ok(Json(PaperCollectionStatus {
            status: CollectionStatus::Completed,
            papers_count: 12,
            message: "Collected 12 papers".to_string(),
            percentage: 100.0,
            current_source: None,
            sources_completed,
            papers_preview: (0..3)
                .map(|i| PaperPreview {
                    title: format!("On the {} of {}", simulated_word(i), simulated_word(i + 5)),
                    authors: vec!["A. Author".to_string()],
                    year: Some(2020 + i as i32),
                    source: Some(SOURCES[i % SOURCES.len()].to_string()),
                })
                .collect(),
        }));
    }

    let fraction = polls as f64 / total as f64;
    let status = if fraction < 0.5 {
        CollectionStatus::CollectingPapers
    } else if fraction < 0.75 {
        CollectionStatus::Processing
    } else {
        CollectionStatus::Storing
    };
    Ok(Json(PaperCollectionStatus {
        status,
        papers_count: polls as usize * 3,
        message: format!("{}...", status),
        percentage: fraction * 100.0,
        current_source: Some(SOURCES[polls as usize % SOURCES.len()].to_string()),
        sources_completed,
        papers_preview: Vec::new(),
    }))
}

// ============================================================================
// Chapters & words
// ============================================================================

pub async fn save_chapter(
    State(state): State<Arc<SimulatorState>>,
    Path((project, chapter)): Path<(String, String)>,
    Json(body): Json<SaveChapterRequest>,
) -> Json<serde_json::Value> {
    let key = ChapterRef::new(project, chapter).key();
    log::info!("💾 saved {} ({} words)", key, body.word_count);
    let word_count = body.word_count;
    state.chapters.write().await.insert(key, body);
    Json(serde_json::json!({ "saved": true, "word_count": word_count }))
}

#[derive(Debug, Deserialize)]
pub struct CheckBalanceRequest {
    pub required_words: u64,
}

pub async fn check_balance(
    State(state): State<Arc<SimulatorState>>,
    Json(body): Json<CheckBalanceRequest>,
) -> Json<BalanceCheck> {
    let balance = state.balance().await;
    Json(BalanceCheck {
        can_proceed: balance >= body.required_words,
        balance,
        required: body.required_words,
        shortage: body.required_words.saturating_sub(balance),
    })
}

pub async fn record_usage(
    State(state): State<Arc<SimulatorState>>,
    Json(record): Json<UsageRecord>,
) -> Json<serde_json::Value> {
    let balance = {
        let mut balance = state.balance.write().await;
        *balance = balance.saturating_sub(record.words_used as u64);
        *balance
    };
    log::info!(
        "💰 {} words used ({}), balance {}",
        record.words_used,
        record.description,
        balance
    );
    state.usage.write().await.push(record);
    Json(serde_json::json!({ "balance": balance }))
}

// ============================================================================
// Project progress channel
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ProjectEventsQuery {
    pub chapters: Option<u32>,
    pub fail_at_chapter: Option<u32>,
}

pub async fn project_events(
    State(state): State<Arc<SimulatorState>>,
    Path(project): Path<String>,
    Query(query): Query<ProjectEventsQuery>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let chapters = query.chapters.unwrap_or(3).max(1);
    let fail_at = query.fail_at_chapter;
    let delay = state.config.chunk_delay;
    let generation_id = Uuid::now_v7().to_string();
    log::info!("📡 project channel for {} ({} chapters)", project, chapters);

    let stream = async_stream::stream! {
        let named = |name: &str, data: serde_json::Value| -> std::result::Result<Event, Infallible> {
            Ok(Event::default().event(name).data(data.to_string()))
        };

        yield named("generation.started", serde_json::json!({
            "project_id": project,
            "generation_id": generation_id,
            "progress": 0,
            "total_chapters": chapters,
            "current_stage": "Literature mining",
        }));
        pause(delay).await;
        yield named("generation.literature_mining", serde_json::json!({
            "project_id": project,
            "progress": 5,
            "stage_progress": 50,
            "papers_found": 24,
        }));
        pause(delay).await;

        let share = 85.0 / chapters as f64;
        for number in 1..=chapters {
            let start = 10.0 + share * (number - 1) as f64;
            yield named("generation.chapter.started", serde_json::json!({
                "project_id": project,
                "chapter_number": number,
                "chapter_title": format!("Chapter {}", number),
                "progress": start,
            }));
            pause(delay).await;

            if fail_at == Some(number) {
                yield named("generation.failed", serde_json::json!({
                    "project_id": project,
                    "chapter_number": number,
                    "error": "Generation failed",
                    "resumable": number > 1,
                    "last_completed_chapter": number - 1,
                }));
                return;
            }

            yield named("generation.chapter.progress", serde_json::json!({
                "project_id": project,
                "chapter_number": number,
                "progress": start + share / 2.0,
                "stage_progress": 50,
                "word_count": 1200,
            }));
            pause(delay).await;
            yield named("generation.chapter.completed", serde_json::json!({
                "project_id": project,
                "chapter_number": number,
                "progress": start + share,
                "word_count": 2500,
            }));
            pause(delay).await;
        }

        yield named("generation.completed", serde_json::json!({
            "project_id": project,
            "generation_id": generation_id,
            "progress": 100,
        }));
    };

    Sse::new(stream).keep_alive(keep_alive())
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
