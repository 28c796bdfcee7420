//! Whole-project generation progress pushed over named SSE events.

use std::collections::VecDeque;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::error::{ErrorCode, GenerationError, Result};
use crate::requests::CancellationToken;
use crate::transport::{NamedEvent, NamedEventStream};

const ACTIVITY_LOG_LIMIT: usize = 50;
const MINING_WEIGHT: f64 = 10.0;
const FORMATTING_WEIGHT: f64 = 5.0;

// ============================================================================
// Channel events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
pub enum ProjectEventKind {
    #[strum(serialize = "generation.started")]
    Started,
    #[strum(serialize = "generation.literature_mining")]
    LiteratureMining,
    #[strum(serialize = "generation.chapter.started")]
    ChapterStarted,
    #[strum(serialize = "generation.chapter.progress")]
    ChapterProgress,
    #[strum(serialize = "generation.chapter.completed")]
    ChapterCompleted,
    #[strum(serialize = "generation.completed")]
    Completed,
    #[strum(serialize = "generation.failed")]
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChapterOutline {
    pub number: u32,
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectEventPayload {
    pub project_id: Option<String>,
    pub generation_id: Option<String>,
    /// Overall job progress, 0 to 100.
    pub progress: Option<f64>,
    pub current_stage: Option<String>,
    /// Progress within the current stage, 0 to 100.
    pub stage_progress: Option<f64>,
    pub chapter_number: Option<u32>,
    pub chapter_title: Option<String>,
    pub total_chapters: Option<u32>,
    pub chapters: Vec<ChapterOutline>,
    pub word_count: Option<usize>,
    pub papers_found: Option<usize>,
    pub elapsed_seconds: Option<f64>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub resumable: Option<bool>,
    pub last_completed_chapter: Option<u32>,
}

// ============================================================================
// Stages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    LiteratureMining,
    Chapter(u32),
    Formatting,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Active,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub kind: StageKind,
    pub title: String,
    pub status: StageStatus,
    /// Progress within this stage, 0 to 100.
    pub progress: f64,
    /// Slice of the overall bar this stage covers.
    pub range_start: f64,
    pub range_end: f64,
    pub word_count: Option<usize>,
}

impl Stage {
    fn new(kind: StageKind, title: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            status: StageStatus::Pending,
            progress: 0.0,
            range_start: 0.0,
            range_end: 0.0,
            word_count: None,
        }
    }

    fn weight(&self, chapters: usize) -> f64 {
        match self.kind {
            StageKind::LiteratureMining => MINING_WEIGHT,
            StageKind::Formatting => FORMATTING_WEIGHT,
            StageKind::Chapter(_) => {
                (100.0 - MINING_WEIGHT - FORMATTING_WEIGHT) / chapters.max(1) as f64
            }
        }
    }

    fn complete(&mut self) {
        self.status = StageStatus::Completed;
        self.progress = 100.0;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Waiting,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub stage: Option<StageKind>,
    pub message: String,
    pub resumable: bool,
    /// Chapter a resumed job would start from.
    pub resume_from_chapter: Option<u32>,
}

// ============================================================================
// Project progress
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectProgress {
    pub project_id: String,
    pub generation_id: Option<String>,
    pub status: JobStatus,
    pub overall: f64,
    pub current_stage: Option<String>,
    pub stages: Vec<Stage>,
    pub activity: VecDeque<ActivityEntry>,
    pub last_completed_chapter: Option<u32>,
    pub failure: Option<JobFailure>,
}

impl ProjectProgress {
    pub fn new(project_id: impl Into<String>) -> Self {
        let mut progress = Self {
            project_id: project_id.into(),
            generation_id: None,
            status: JobStatus::Waiting,
            overall: 0.0,
            current_stage: None,
            stages: vec![
                Stage::new(StageKind::LiteratureMining, "Literature mining"),
                Stage::new(StageKind::Formatting, "Final formatting"),
            ],
            activity: VecDeque::with_capacity(ACTIVITY_LOG_LIMIT),
            last_completed_chapter: None,
            failure: None,
        };
        progress.recompute_ranges();
        progress
    }

    pub fn stage(&self, kind: StageKind) -> Option<&Stage> {
        self.stages.iter().find(|s| s.kind == kind)
    }

    pub fn chapter_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| matches!(s.kind, StageKind::Chapter(_)))
            .count()
    }

    pub fn is_resumable(&self) -> bool {
        self.failure.as_ref().is_some_and(|f| f.resumable)
    }

    /// Records a failure of the channel itself: the active stage goes to
    /// error and the job is resumable once a chapter has completed.
    pub fn mark_interrupted(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.status = JobStatus::Failed;
        let owner = self
            .stages
            .iter()
            .find(|s| s.status == StageStatus::Active)
            .map(|s| s.kind);
        if let Some(kind) = owner {
            if let Some(stage) = self.stage_mut(kind) {
                stage.status = StageStatus::Error;
            }
        }
        let resumable = self.last_completed_chapter.is_some();
        self.failure = Some(JobFailure {
            stage: owner,
            message: message.clone(),
            resumable,
            resume_from_chapter: resumable.then(|| self.last_completed_chapter.map_or(1, |n| n + 1)),
        });
        self.log_activity(ProjectEventKind::Failed, format!("Failed: {}", message));
    }

    fn stage_mut(&mut self, kind: StageKind) -> Option<&mut Stage> {
        self.stages.iter_mut().find(|s| s.kind == kind)
    }

    /// Returns the index of the chapter stage, inserting it when unknown.
    fn ensure_chapter(&mut self, number: u32, title: Option<&str>) -> usize {
        if let Some(idx) = self.stages.iter().position(|s| s.kind == StageKind::Chapter(number)) {
            if let Some(title) = title {
                self.stages[idx].title = title.to_string();
            }
            return idx;
        }
        let title = title
            .map(str::to_string)
            .unwrap_or_else(|| format!("Chapter {}", number));
        let stage = Stage::new(StageKind::Chapter(number), title);
        let idx = self
            .stages
            .iter()
            .position(|s| s.kind > stage.kind)
            .unwrap_or(self.stages.len());
        log::debug!("adding stage for chapter {}", number);
        self.stages.insert(idx, stage);
        self.recompute_ranges();
        idx
    }

    fn recompute_ranges(&mut self) {
        let chapters = self.chapter_count();
        let total: f64 = self.stages.iter().map(|s| s.weight(chapters)).sum();
        let mut cursor = 0.0;
        for stage in &mut self.stages {
            let width = stage.weight(chapters) / total * 100.0;
            stage.range_start = cursor;
            stage.range_end = cursor + width;
            cursor += width;
        }
    }

    fn computed_overall(&self) -> f64 {
        self.stages
            .iter()
            .map(|s| (s.range_end - s.range_start) * s.progress / 100.0)
            .sum()
    }

    /// Marks every stage before `idx` as done.
    fn complete_before(&mut self, idx: usize) {
        for stage in self.stages.iter_mut().take(idx) {
            if stage.status != StageStatus::Completed {
                stage.complete();
            }
        }
    }

    fn activate(&mut self, idx: usize) {
        self.complete_before(idx);
        let stage = &mut self.stages[idx];
        if stage.status == StageStatus::Pending {
            stage.status = StageStatus::Active;
        }
        self.current_stage = Some(stage.title.clone());
    }

    fn log_activity(&mut self, kind: ProjectEventKind, message: String) {
        if self.activity.len() == ACTIVITY_LOG_LIMIT {
            self.activity.pop_front();
        }
        self.activity.push_back(ActivityEntry {
            timestamp: Utc::now(),
            event: kind.to_string(),
            message,
        });
    }

    /// Applies one channel event.
    pub fn apply(&mut self, kind: ProjectEventKind, payload: &ProjectEventPayload) {
        if let Some(id) = &payload.generation_id {
            self.generation_id = Some(id.clone());
        }

        let message = match kind {
            ProjectEventKind::Started => {
                self.status = JobStatus::Running;
                self.failure = None;
                for outline in &payload.chapters {
                    self.ensure_chapter(outline.number, Some(&outline.title));
                }
                if let Some(total) = payload.total_chapters {
                    for number in 1..=total {
                        self.ensure_chapter(number, None);
                    }
                }
                format!("Generation started ({} chapters)", self.chapter_count())
            }
            ProjectEventKind::LiteratureMining => {
                self.status = JobStatus::Running;
                let idx = self
                    .stages
                    .iter()
                    .position(|s| s.kind == StageKind::LiteratureMining)
                    .unwrap_or(0);
                self.activate(idx);
                if let Some(p) = payload.stage_progress {
                    self.stages[idx].progress = p.clamp(0.0, 100.0);
                }
                match payload.papers_found {
                    Some(n) => format!("Mining literature, {} papers found", n),
                    None => "Mining literature".to_string(),
                }
            }
            ProjectEventKind::ChapterStarted | ProjectEventKind::ChapterProgress => {
                self.status = JobStatus::Running;
                let number = payload.chapter_number.unwrap_or(1);
                let idx = self.ensure_chapter(number, payload.chapter_title.as_deref());
                self.activate(idx);
                let stage = &mut self.stages[idx];
                if let Some(p) = payload.stage_progress {
                    stage.progress = p.clamp(0.0, 100.0);
                } else if let Some(overall) = payload.progress {
                    let width = stage.range_end - stage.range_start;
                    if width > 0.0 {
                        stage.progress =
                            ((overall - stage.range_start) / width * 100.0).clamp(0.0, 100.0);
                    }
                }
                if payload.word_count.is_some() {
                    stage.word_count = payload.word_count;
                }
                if kind == ProjectEventKind::ChapterStarted {
                    format!("Started {}", stage.title)
                } else {
                    format!("{}: {:.0}%", stage.title, stage.progress)
                }
            }
            ProjectEventKind::ChapterCompleted => {
                let number = payload.chapter_number.unwrap_or(1);
                let idx = self.ensure_chapter(number, payload.chapter_title.as_deref());
                self.complete_before(idx);
                let stage = &mut self.stages[idx];
                stage.complete();
                if payload.word_count.is_some() {
                    stage.word_count = payload.word_count;
                }
                let title = stage.title.clone();
                self.last_completed_chapter = Some(self.last_completed_chapter.map_or(number, |n| n.max(number)));
                match payload.word_count {
                    Some(words) => format!("Completed {} ({} words)", title, words),
                    None => format!("Completed {}", title),
                }
            }
            ProjectEventKind::Completed => {
                self.status = JobStatus::Completed;
                for stage in &mut self.stages {
                    stage.complete();
                }
                self.current_stage = None;
                "Generation completed".to_string()
            }
            ProjectEventKind::Failed => {
                self.status = JobStatus::Failed;
                if let Some(n) = payload.last_completed_chapter {
                    self.last_completed_chapter = Some(self.last_completed_chapter.map_or(n, |m| m.max(n)));
                }
                let owner = payload
                    .chapter_number
                    .map(StageKind::Chapter)
                    .filter(|kind| self.stage(*kind).is_some())
                    .or_else(|| {
                        self.stages
                            .iter()
                            .find(|s| s.status == StageStatus::Active)
                            .map(|s| s.kind)
                    });
                if let Some(kind) = owner {
                    if let Some(stage) = self.stage_mut(kind) {
                        stage.status = StageStatus::Error;
                    }
                }
                let message = payload
                    .error
                    .clone()
                    .or_else(|| payload.message.clone())
                    .unwrap_or_else(|| "Generation failed".to_string());
                let resumable = payload
                    .resumable
                    .unwrap_or(self.last_completed_chapter.is_some());
                self.failure = Some(JobFailure {
                    stage: owner,
                    message: message.clone(),
                    resumable,
                    resume_from_chapter: resumable
                        .then(|| self.last_completed_chapter.map_or(1, |n| n + 1)),
                });
                format!("Failed: {}", message)
            }
        };

        if let Some(stage) = &payload.current_stage {
            self.current_stage = Some(stage.clone());
        }
        self.overall = match (kind, payload.progress) {
            (ProjectEventKind::Completed, _) => 100.0,
            (_, Some(p)) => p.clamp(0.0, 100.0),
            _ => self.computed_overall(),
        };

        let message = payload.message.clone().filter(|_| kind != ProjectEventKind::Failed).unwrap_or(message);
        self.log_activity(kind, message);
    }
}

// ============================================================================
// Listener
// ============================================================================

pub struct ProgressChannelListener {
    progress: ProjectProgress,
}

impl ProgressChannelListener {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            progress: ProjectProgress::new(project_id),
        }
    }

    pub fn progress(&self) -> &ProjectProgress {
        &self.progress
    }

    /// Applies one named event. Unknown names and foreign projects are ignored.
    pub fn handle(&mut self, event: &NamedEvent) -> Option<ProjectEventKind> {
        let kind = match ProjectEventKind::from_str(&event.name) {
            Ok(kind) => kind,
            Err(_) => {
                log::debug!("ignoring channel event {:?}", event.name);
                return None;
            }
        };
        let payload: ProjectEventPayload = match serde_json::from_str(&event.data) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("bad {} payload: {}", kind, e);
                return None;
            }
        };
        if let Some(project) = &payload.project_id {
            if project != &self.progress.project_id {
                log::debug!("ignoring {} for project {}", kind, project);
                return None;
            }
        }
        self.progress.apply(kind, &payload);
        Some(kind)
    }

    /// Consumes the channel until the job completes or fails.
    pub async fn listen(
        &mut self,
        mut events: NamedEventStream,
        token: &CancellationToken,
        mut on_update: impl FnMut(&ProjectProgress) + Send,
    ) -> Result<JobStatus> {
        log::info!("📡 listening for project {} progress", self.progress.project_id);
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(GenerationError::cancelled()),
                next = events.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    let Some(kind) = self.handle(&event) else {
                        continue;
                    };
                    on_update(&self.progress);
                    match kind {
                        ProjectEventKind::Completed => {
                            log::info!("🎉 project {} generation completed", self.progress.project_id);
                            return Ok(JobStatus::Completed);
                        }
                        ProjectEventKind::Failed => {
                            log::warn!(
                                "project {} generation failed (resumable={})",
                                self.progress.project_id,
                                self.progress.is_resumable()
                            );
                            return Ok(JobStatus::Failed);
                        }
                        _ => {}
                    }
                }
                Some(Err(e)) => {
                    let err = GenerationError::new(ErrorCode::ConnectionError, e.to_string());
                    return Err(self.interrupted(err, &mut on_update));
                }
                None => {
                    let err = GenerationError::new(
                        ErrorCode::StreamClosed,
                        "progress channel closed before the job finished",
                    );
                    return Err(self.interrupted(err, &mut on_update));
                }
            }
        }
    }

    fn interrupted(
        &mut self,
        err: GenerationError,
        on_update: &mut impl FnMut(&ProjectProgress),
    ) -> GenerationError {
        log::warn!("project {} channel lost: {}", self.progress.project_id, err);
        self.progress.mark_interrupted(err.message.clone());
        on_update(&self.progress);
        err
    }
}
