//! Chapter, section and selection generation on top of [`StreamSession`].
//!
//! Every operation runs the same pipeline: registry check, balance pre-check,
//! optional paper collection, the stream itself, then fire-and-forget usage
//! recording. Chapter-level operations also save the result.

use std::ops::Range;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use crate::balance::BalanceStore;
use crate::collaborators::{ChapterRef, Collaborators, UsageRecord};
use crate::config::GeneratorConfig;
use crate::error::{ErrorCode, ErrorRecord, GenerationError, Result, log_error};
use crate::events::{GenerationType, StreamRequest};
use crate::papers::{PaperCollectionStatus, PaperCollector};
use crate::probe::ConnectionProbe;
use crate::requests::{CancellationToken, RequestManager};
use crate::session::{
    FailureReport, Progress, SessionObserver, SessionOutcome, SessionStatus, StreamSession,
};
use crate::transport::EventTransport;
use crate::word_count::count_words;

// ============================================================================
// Editor buffer
// ============================================================================

/// The document the user is editing.
pub trait EditorBuffer: Send {
    fn content(&self) -> String;

    fn set_content(&mut self, content: &str);

    /// Replaces a byte range of the content.
    fn replace_range(&mut self, range: Range<usize>, text: &str);
}

impl EditorBuffer for String {
    fn content(&self) -> String {
        self.clone()
    }

    fn set_content(&mut self, content: &str) {
        self.clear();
        self.push_str(content);
    }

    fn replace_range(&mut self, range: Range<usize>, text: &str) {
        String::replace_range(self, range, text);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub range: Range<usize>,
    pub text: String,
}

impl Selection {
    pub fn capture(editor: &dyn EditorBuffer, range: Range<usize>) -> Result<Self> {
        let content = editor.content();
        let text = content
            .get(range.clone())
            .ok_or_else(|| GenerationError::invalid_state("selection is outside the document"))?;
        if text.trim().is_empty() {
            return Err(GenerationError::invalid_state("selection is empty"));
        }
        Ok(Self {
            range,
            text: text.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpliceResult {
    Applied { range: Range<usize> },
    /// The document changed under the selection; the caller inserts by hand.
    ManualInsertion { text: String },
}

fn splice_selection(editor: &mut dyn EditorBuffer, selection: &Selection, text: &str) -> SpliceResult {
    let content = editor.content();
    if content.get(selection.range.clone()) != Some(selection.text.as_str()) {
        log::warn!("selection moved during generation, leaving result for manual insertion");
        return SpliceResult::ManualInsertion {
            text: text.to_string(),
        };
    }
    editor.replace_range(selection.range.clone(), text);
    let start = selection.range.start;
    SpliceResult::Applied {
        range: start..start + text.len(),
    }
}

// ============================================================================
// State & reports
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationState {
    pub is_generating: bool,
    pub generation_phase: String,
    pub generation_percentage: u8,
    pub generation_message: String,
    pub session_status: Option<SessionStatus>,
    pub word_count: usize,
    pub is_collecting_papers: bool,
    pub paper_status: Option<PaperCollectionStatus>,
    pub reconnect_attempt: u32,
    pub max_reconnect_attempts: u32,
    pub partial_content_saved: bool,
    pub saved_word_count_on_error: Option<usize>,
    pub highest_autosave_word_count: usize,
    pub recovery_available: bool,
    pub last_error: Option<ErrorRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationReport {
    /// Text produced by the stream.
    pub content: String,
    pub word_count: usize,
    pub final_word_count: usize,
    pub generation_id: Option<String>,
    pub saved: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionReport {
    pub text: String,
    pub word_count: usize,
    pub splice: SpliceResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationOptions {
    pub target_words: usize,
    /// Gather sources before streaming.
    pub collect_papers: bool,
}

impl GenerationOptions {
    pub fn new(target_words: usize) -> Self {
        Self {
            target_words,
            collect_papers: true,
        }
    }

    pub fn without_papers(mut self) -> Self {
        self.collect_papers = false;
        self
    }
}

// ============================================================================
// Session observer writing into the editor
// ============================================================================

#[derive(Debug, Clone)]
enum RenderMode {
    Replace,
    Append { prefix: String },
    /// Selection operations stream into their own buffer.
    Detached,
}

struct EditorObserver<'a> {
    editor: &'a mut dyn EditorBuffer,
    mode: RenderMode,
    state: &'a watch::Sender<GenerationState>,
}

impl EditorObserver<'_> {
    fn render(&mut self, buffer: &str) {
        match &self.mode {
            RenderMode::Replace => self.editor.set_content(buffer),
            RenderMode::Append { prefix } => {
                let mut content = String::with_capacity(prefix.len() + buffer.len());
                content.push_str(prefix);
                content.push_str(buffer);
                self.editor.set_content(&content);
            }
            RenderMode::Detached => {}
        }
    }
}

impl SessionObserver for EditorObserver<'_> {
    fn on_status(&mut self, _from: SessionStatus, to: SessionStatus) {
        self.state.send_modify(|s| s.session_status = Some(to));
    }

    fn on_content(&mut self, buffer: &str, progress: &Progress) {
        self.render(buffer);
        self.state.send_modify(|s| {
            s.word_count = progress.word_count;
            s.generation_percentage = progress.percentage;
        });
    }

    fn on_progress(&mut self, progress: &Progress) {
        self.state.send_modify(|s| {
            s.generation_phase = progress.phase.clone();
            s.generation_message = progress.message.clone();
        });
    }

    fn on_autosave(&mut self, word_count: usize) {
        self.state.send_modify(|s| {
            s.highest_autosave_word_count = s.highest_autosave_word_count.max(word_count);
        });
    }

    fn on_reconnecting(&mut self, attempt: u32, max_attempts: u32, _delay: std::time::Duration) {
        self.state.send_modify(|s| {
            s.reconnect_attempt = attempt;
            s.max_reconnect_attempts = max_attempts;
        });
    }

    fn on_error(&mut self, error: &ErrorRecord) {
        self.state.send_modify(|s| s.last_error = Some(error.clone()));
    }

    fn on_complete(&mut self, buffer: &str, _final_word_count: usize) {
        self.render(buffer);
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

struct Job<'a> {
    target: &'a ChapterRef,
    request: StreamRequest,
    target_words: usize,
    /// Words the balance check is based on, before the safety multiplier.
    estimate: usize,
    collect_papers: bool,
    mode: RenderMode,
    reference_type: &'static str,
}

struct StreamResult {
    content: String,
    word_count: usize,
    final_word_count: usize,
    generation_id: Option<String>,
}

/// Cancels running generations from anywhere.
#[derive(Clone)]
pub struct GenerationCanceller {
    requests: RequestManager,
}

impl GenerationCanceller {
    pub fn cancel(&self, target: &ChapterRef) -> bool {
        self.requests.cancel(&target.key())
    }

    pub fn cancel_all(&self) -> usize {
        self.requests.cancel_all()
    }

    pub fn is_active(&self, target: &ChapterRef) -> bool {
        self.requests.is_active(&target.key())
    }
}

pub struct GenerationOrchestrator {
    config: GeneratorConfig,
    transport: Arc<dyn EventTransport>,
    probe: ConnectionProbe,
    collaborators: Collaborators,
    balance: BalanceStore,
    requests: RequestManager,
    state: Arc<watch::Sender<GenerationState>>,
}

impl GenerationOrchestrator {
    pub fn new(
        config: GeneratorConfig,
        transport: Arc<dyn EventTransport>,
        probe: ConnectionProbe,
        collaborators: Collaborators,
    ) -> Self {
        let (state, _rx) = watch::channel(GenerationState::default());
        Self {
            config,
            transport,
            probe,
            collaborators,
            balance: BalanceStore::new(),
            requests: RequestManager::new(),
            state: Arc::new(state),
        }
    }

    pub fn with_balance_store(mut self, balance: BalanceStore) -> Self {
        self.balance = balance;
        self
    }

    pub fn state(&self) -> GenerationState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GenerationState> {
        self.state.subscribe()
    }

    pub fn balance(&self) -> &BalanceStore {
        &self.balance
    }

    pub fn canceller(&self) -> GenerationCanceller {
        GenerationCanceller {
            requests: self.requests.clone(),
        }
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Generates a whole chapter into `editor`, replacing its content.
    pub async fn generate_chapter(
        &self,
        target: &ChapterRef,
        generation_type: GenerationType,
        options: GenerationOptions,
        editor: &mut dyn EditorBuffer,
    ) -> Result<GenerationReport> {
        if generation_type.is_selection_scoped() {
            return Err(GenerationError::invalid_state(format!(
                "{} needs a selection",
                generation_type
            )));
        }
        let request = StreamRequest::new(self.stream_url(target), generation_type)
            .with_target_words(options.target_words);
        let job = Job {
            target,
            request,
            target_words: options.target_words,
            estimate: options.target_words,
            collect_papers: options.collect_papers,
            mode: RenderMode::Replace,
            reference_type: "chapter",
        };

        let result = self.run(job, &mut *editor).await?;
        let saved = self.save(target, &editor.content()).await;
        Ok(GenerationReport {
            content: result.content,
            word_count: result.word_count,
            final_word_count: result.final_word_count,
            generation_id: result.generation_id,
            saved,
        })
    }

    /// Generates one section and appends it to the chapter.
    pub async fn generate_section(
        &self,
        target: &ChapterRef,
        section_type: &str,
        options: GenerationOptions,
        editor: &mut dyn EditorBuffer,
    ) -> Result<GenerationReport> {
        let mut prefix = editor.content();
        if !prefix.trim().is_empty() && !prefix.ends_with("\n\n") {
            prefix.push_str(if prefix.ends_with('\n') { "\n" } else { "\n\n" });
        }
        let request = StreamRequest::new(self.stream_url(target), GenerationType::Section)
            .with_section(section_type)
            .with_target_words(options.target_words);
        let job = Job {
            target,
            request,
            target_words: options.target_words,
            estimate: options.target_words,
            collect_papers: options.collect_papers,
            mode: RenderMode::Append { prefix },
            reference_type: "section",
        };

        let result = self.run(job, &mut *editor).await?;
        let saved = self.save(target, &editor.content()).await;
        Ok(GenerationReport {
            content: result.content,
            word_count: result.word_count,
            final_word_count: result.final_word_count,
            generation_id: result.generation_id,
            saved,
        })
    }

    pub async fn rephrase(
        &self,
        target: &ChapterRef,
        selection: &Selection,
        style: Option<&str>,
        editor: &mut dyn EditorBuffer,
    ) -> Result<SelectionReport> {
        let words = count_words(&selection.text);
        let mut request = StreamRequest::new(self.stream_url(target), GenerationType::Rephrase)
            .with_selection(selection.text.as_str())
            .with_target_words(words);
        if let Some(style) = style {
            request = request.with_style(style);
        }
        self.run_selection(target, request, words, selection, editor).await
    }

    pub async fn expand(
        &self,
        target: &ChapterRef,
        selection: &Selection,
        target_words: Option<usize>,
        editor: &mut dyn EditorBuffer,
    ) -> Result<SelectionReport> {
        let words = count_words(&selection.text);
        let target_words = target_words.unwrap_or(words * 2).max(words);
        let request = StreamRequest::new(self.stream_url(target), GenerationType::Expand)
            .with_selection(selection.text.as_str())
            .with_target_words(target_words);
        self.run_selection(target, request, target_words, selection, editor).await
    }

    async fn run_selection(
        &self,
        target: &ChapterRef,
        request: StreamRequest,
        target_words: usize,
        selection: &Selection,
        editor: &mut dyn EditorBuffer,
    ) -> Result<SelectionReport> {
        let job = Job {
            target,
            request,
            target_words,
            estimate: target_words,
            collect_papers: false,
            mode: RenderMode::Detached,
            reference_type: "selection",
        };
        let result = self.run(job, &mut *editor).await?;

        let text = result.content.trim().to_string();
        let splice = splice_selection(editor, selection, &text);
        if let SpliceResult::ManualInsertion { .. } = splice {
            self.state.send_modify(|s| {
                s.generation_message = "Selection changed; insert the result manually".to_string();
            });
        }
        Ok(SelectionReport {
            word_count: count_words(&text),
            text,
            splice,
        })
    }

    // ------------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------------

    fn stream_url(&self, target: &ChapterRef) -> String {
        self.config.endpoint(&target.stream_path())
    }

    async fn run(&self, job: Job<'_>, editor: &mut dyn EditorBuffer) -> Result<StreamResult> {
        let registration = self.requests.register(&job.target.key())?;
        let result = self.run_registered(&job, registration.token(), editor).await;
        drop(registration);

        if let Err(e) = &result {
            log_error(e);
            self.state.send_modify(|s| {
                s.is_generating = false;
                s.is_collecting_papers = false;
                s.generation_phase = "error".to_string();
                s.generation_message = e.message.clone();
            });
        }
        result
    }

    async fn run_registered(
        &self,
        job: &Job<'_>,
        token: &CancellationToken,
        editor: &mut dyn EditorBuffer,
    ) -> Result<StreamResult> {
        self.state.send_replace(GenerationState {
            is_generating: true,
            generation_phase: "checking_balance".to_string(),
            generation_message: "Checking word balance...".to_string(),
            ..Default::default()
        });

        let required = (job.estimate as f64 * self.config.balance_multiplier).ceil() as u64;
        let check = self.collaborators.balance.check_balance(required).await?;
        self.balance.apply_update(check.balance);
        if !check.can_proceed {
            log::warn!(
                "💸 {} needs {} words, balance is {}",
                job.target,
                required,
                check.balance
            );
            return Err(GenerationError::insufficient_balance(
                check.required.max(required),
                check.balance,
            ));
        }
        token.check()?;

        if job.collect_papers {
            self.collect_papers(job.target, token).await?;
        }

        log::info!(
            "✍️  {} generation for {} ({} words)",
            job.request.generation_type,
            job.target,
            job.target_words
        );
        let mut session = StreamSession::new(
            self.config.stream.clone(),
            self.transport.clone(),
            self.probe.clone(),
        );
        let outcome = {
            let mut observer = EditorObserver {
                editor,
                mode: job.mode.clone(),
                state: &self.state,
            };
            tokio::select! {
                res = session.start(job.request.clone(), job.target_words, &mut observer) => res?,
                _ = token.cancelled() => SessionOutcome::Stopped,
            }
        };
        if session.status().is_active() {
            session.stop();
        }

        match outcome {
            SessionOutcome::Completed {
                content,
                word_count,
                final_word_count,
            } => {
                self.record_usage(job, final_word_count, session.generation_id());
                self.state.send_modify(|s| {
                    s.is_generating = false;
                    s.generation_phase = "complete".to_string();
                    s.generation_percentage = 100;
                    s.generation_message = "Generation complete".to_string();
                    s.word_count = word_count;
                });
                Ok(StreamResult {
                    content,
                    word_count,
                    final_word_count,
                    generation_id: session.generation_id().map(str::to_string),
                })
            }
            SessionOutcome::Failed(report) => {
                self.state.send_modify(|s| {
                    s.partial_content_saved =
                        report.partial_saved || s.highest_autosave_word_count > 0;
                    s.saved_word_count_on_error = Some(report.safe_word_count);
                    s.recovery_available = report.recovery_available;
                    s.last_error = Some(report.error.clone());
                });
                Err(failure_error(&report))
            }
            SessionOutcome::Stopped => {
                log::info!("generation for {} cancelled", job.target);
                Err(GenerationError::cancelled())
            }
        }
    }

    async fn collect_papers(&self, target: &ChapterRef, token: &CancellationToken) -> Result<()> {
        self.state.send_modify(|s| {
            s.is_collecting_papers = true;
            s.generation_phase = "collecting_papers".to_string();
            s.generation_message = "Collecting research papers...".to_string();
        });

        let collector = PaperCollector::new(
            self.collaborators.papers.clone(),
            self.config.paper_poll_interval,
            self.config.paper_poll_max_attempts,
        );
        let state = &self.state;
        let result = collector
            .collect(target, token, |status| {
                state.send_modify(|s| {
                    s.generation_percentage = status.percentage.clamp(0.0, 100.0) as u8;
                    if !status.message.is_empty() {
                        s.generation_message = status.message.clone();
                    }
                    s.paper_status = Some(status.clone());
                });
            })
            .await;

        self.state.send_modify(|s| s.is_collecting_papers = false);
        result.map(|_| ())
    }

    fn record_usage(&self, job: &Job<'_>, words: usize, generation_id: Option<&str>) {
        if words == 0 {
            return;
        }
        self.balance.debit(words as u64);

        let usage = self.collaborators.usage.clone();
        let record = UsageRecord {
            words_used: words,
            description: format!("{} generation for {}", job.request.generation_type, job.target),
            reference_type: job.reference_type.to_string(),
            reference_id: generation_id
                .map(str::to_string)
                .unwrap_or_else(|| job.target.chapter_id.clone()),
        };
        tokio::spawn(async move {
            match usage.record_word_usage(&record).await {
                Ok(()) => log::debug!("💰 recorded usage of {} words", record.words_used),
                Err(e) => log::warn!(
                    "⚠️  failed to record usage of {} words: {}",
                    record.words_used,
                    e
                ),
            }
        });
    }

    async fn save(&self, target: &ChapterRef, content: &str) -> bool {
        let word_count = count_words(content);
        match self
            .collaborators
            .chapters
            .save_chapter(target, content, word_count)
            .await
        {
            Ok(()) => {
                log::info!("💾 saved {} ({} words)", target, word_count);
                true
            }
            Err(e) => {
                log_error(&e);
                self.state.send_modify(|s| {
                    s.generation_message = format!("Generated, but saving failed: {}", e.message);
                });
                false
            }
        }
    }
}

fn failure_error(report: &FailureReport) -> GenerationError {
    let code = ErrorCode::from_code(&report.error.code).unwrap_or(ErrorCode::ServerError);
    GenerationError::new(code, report.error.message.clone()).with_details(serde_json::json!({
        "code": report.error.code,
        "safe_word_count": report.safe_word_count,
        "buffered_word_count": report.buffered_word_count,
        "partial_saved": report.partial_saved,
        "recovery_available": report.recovery_available,
        "can_retry": report.can_retry,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    use crate::collaborators::{BalanceCheck, BalanceService, ChapterStore, UsageRecorder};
    use crate::events::ServerEvent;
    use crate::papers::CollectionStatus;
    use crate::papers::tests::ScriptedPapers;
    use crate::probe::NetworkStatus;
    use crate::session::tests::{test_config, words};
    use crate::transport::TransportError;
    use crate::transport::scripted::{Connection, ScriptedTransport, Step};

    #[derive(Default)]
    struct FakeBackend {
        balance: u64,
        usage: Mutex<Vec<UsageRecord>>,
        saved: Mutex<Vec<(String, String, usize)>>,
    }

    #[async_trait]
    impl BalanceService for FakeBackend {
        async fn check_balance(&self, required_words: u64) -> Result<BalanceCheck> {
            Ok(BalanceCheck {
                can_proceed: self.balance >= required_words,
                balance: self.balance,
                required: required_words,
                shortage: required_words.saturating_sub(self.balance),
            })
        }
    }

    #[async_trait]
    impl UsageRecorder for FakeBackend {
        async fn record_word_usage(&self, record: &UsageRecord) -> Result<()> {
            self.usage.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    #[async_trait]
    impl ChapterStore for FakeBackend {
        async fn save_chapter(&self, target: &ChapterRef, content: &str, word_count: usize) -> Result<()> {
            self.saved
                .lock()
                .unwrap()
                .push((target.key(), content.to_string(), word_count));
            Ok(())
        }
    }

    struct Fixture {
        orchestrator: GenerationOrchestrator,
        transport: ScriptedTransport,
        backend: Arc<FakeBackend>,
        papers: Arc<ScriptedPapers>,
    }

    fn fixture(balance: u64, connections: Vec<Connection>, max_attempts: u32) -> Fixture {
        let transport = ScriptedTransport::new(connections);
        let backend = Arc::new(FakeBackend {
            balance,
            ..Default::default()
        });
        let papers = Arc::new(ScriptedPapers::new(vec![
            CollectionStatus::CollectingPapers,
            CollectionStatus::Completed,
        ]));
        let config = GeneratorConfig {
            base_url: "http://writer.test".to_string(),
            stream: test_config(max_attempts),
            ..Default::default()
        };
        let probe = ConnectionProbe::from_config(Arc::new(NetworkStatus::online()), &config.stream);
        let orchestrator = GenerationOrchestrator::new(
            config,
            Arc::new(transport.clone()),
            probe,
            Collaborators {
                balance: backend.clone(),
                usage: backend.clone(),
                chapters: backend.clone(),
                papers: papers.clone(),
            },
        );
        Fixture {
            orchestrator,
            transport,
            backend,
            papers,
        }
    }

    fn streamed(range: std::ops::Range<usize>, final_count: usize) -> Connection {
        let mut steps = vec![Step::Event(ServerEvent::Start {
            generation_id: Some("gen-7".to_string()),
            message: None,
        })];
        let mut i = range.start;
        while i < range.end {
            let next = (i + 50).min(range.end);
            steps.push(Step::Event(ServerEvent::content(words(i..next))));
            i = next;
        }
        steps.push(Step::Event(ServerEvent::complete(final_count)));
        Connection::Steps(steps)
    }

    #[tokio::test(start_paused = true)]
    async fn test_chapter_generation_end_to_end() {
        let fx = fixture(10_000, vec![streamed(0..300, 300)], 3);
        let target = ChapterRef::new("thesis", "ch1");
        fx.orchestrator.balance().apply_update(10_000);
        let mut editor = String::new();

        let report = assert_ok!(
            fx.orchestrator
                .generate_chapter(
                    &target,
                    GenerationType::Progressive,
                    GenerationOptions::new(300),
                    &mut editor
                )
                .await
        );

        assert_eq!(editor, words(0..300));
        assert_eq!(report.final_word_count, 300);
        assert_eq!(report.generation_id.as_deref(), Some("gen-7"));
        assert!(report.saved);
        assert_eq!(fx.papers.starts.load(Ordering::SeqCst), 1);

        let requests = fx.transport.requests();
        assert_eq!(requests[0].url, "http://writer.test/api/projects/thesis/chapters/ch1/stream");
        assert_eq!(requests[0].target_words, Some(300));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let usage = fx.backend.usage.lock().unwrap().clone();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].words_used, 300);
        assert_eq!(usage[0].reference_id, "gen-7");
        assert_eq!(fx.orchestrator.balance().current(), Some(9_700));

        let saved = fx.backend.saved.lock().unwrap().clone();
        assert_eq!(saved[0].0, "thesis/ch1");
        assert_eq!(saved[0].2, 300);

        let state = fx.orchestrator.state();
        assert!(!state.is_generating);
        assert_eq!(state.generation_percentage, 100);
        assert!(state.paper_status.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_insufficient_balance_aborts_before_streaming() {
        let fx = fixture(100, vec![streamed(0..500, 500)], 3);
        let mut editor = String::new();

        let err = assert_err!(
            fx.orchestrator
                .generate_chapter(
                    &ChapterRef::new("p", "c"),
                    GenerationType::Progressive,
                    GenerationOptions::new(500),
                    &mut editor
                )
                .await
        );

        assert_eq!(err.code, ErrorCode::InsufficientBalance);
        assert_eq!(err.details.unwrap()["shortage"], 500);
        assert!(fx.transport.requests().is_empty());
        assert_eq!(fx.papers.starts.load(Ordering::SeqCst), 0);
        assert!(!fx.orchestrator.state().is_generating);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_on_same_target_is_rejected() {
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let fx = fixture(10_000, vec![Connection::Live(rx)], 3);
        let orchestrator = Arc::new(fx.orchestrator);
        let target = ChapterRef::new("p", "c");

        let running = {
            let orchestrator = orchestrator.clone();
            let target = target.clone();
            tokio::spawn(async move {
                let mut editor = String::new();
                orchestrator
                    .generate_chapter(
                        &target,
                        GenerationType::Outline,
                        GenerationOptions::new(200).without_papers(),
                        &mut editor,
                    )
                    .await
            })
        };
        while fx.transport.requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut other = String::new();
        let err = assert_err!(
            orchestrator
                .generate_section(&target, "introduction", GenerationOptions::new(100), &mut other)
                .await
        );
        assert_eq!(err.code, ErrorCode::AlreadyActive);

        let canceller = orchestrator.canceller();
        assert!(canceller.is_active(&target));
        assert!(canceller.cancel(&target));
        let err = assert_err!(running.await.unwrap());
        assert_eq!(err.code, ErrorCode::Cancelled);
        assert!(!canceller.is_active(&target));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_generation_releases_target() {
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let fx = fixture(10_000, vec![Connection::Live(rx), streamed(0..120, 120)], 3);
        let orchestrator = Arc::new(fx.orchestrator);
        let target = ChapterRef::new("p", "c");

        let running = {
            let orchestrator = orchestrator.clone();
            let target = target.clone();
            tokio::spawn(async move {
                let mut editor = String::new();
                orchestrator
                    .generate_chapter(
                        &target,
                        GenerationType::Progressive,
                        GenerationOptions::new(120).without_papers(),
                        &mut editor,
                    )
                    .await
            })
        };
        while fx.transport.requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let canceller = orchestrator.canceller();
        assert!(canceller.is_active(&target));

        running.abort();
        assert!(running.await.unwrap_err().is_cancelled());
        assert!(!canceller.is_active(&target));

        let mut editor = String::new();
        let report = assert_ok!(
            orchestrator
                .generate_chapter(
                    &target,
                    GenerationType::Progressive,
                    GenerationOptions::new(120).without_papers(),
                    &mut editor,
                )
                .await
        );
        assert_eq!(report.word_count, 120);
        assert_eq!(editor, words(0..120));
        assert_eq!(fx.transport.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_section_is_appended() {
        let fx = fixture(10_000, vec![streamed(0..80, 80)], 3);
        let mut editor = String::from("Existing introduction.");

        assert_ok!(
            fx.orchestrator
                .generate_section(
                    &ChapterRef::new("p", "c"),
                    "methodology",
                    GenerationOptions::new(80).without_papers(),
                    &mut editor
                )
                .await
        );

        assert_eq!(editor, format!("Existing introduction.\n\n{}", words(0..80)));
        let request = &fx.transport.requests()[0];
        assert_eq!(request.section_type.as_deref(), Some("methodology"));
        assert_eq!(request.generation_type, GenerationType::Section);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rephrase_splices_selection() {
        let fx = fixture(
            10_000,
            vec![Connection::Steps(vec![
                Step::Event(ServerEvent::content("a clearer ")),
                Step::Event(ServerEvent::content("phrasing")),
                Step::Event(ServerEvent::complete(3)),
            ])],
            3,
        );
        let mut editor = String::from("Intro. old clumsy words. Outro.");
        let selection = Selection::capture(&editor, 7..23).unwrap();
        assert_eq!(selection.text, "old clumsy words");

        let report = assert_ok!(
            fx.orchestrator
                .rephrase(&ChapterRef::new("p", "c"), &selection, Some("formal"), &mut editor)
                .await
        );

        assert_eq!(editor, "Intro. a clearer phrasing. Outro.");
        assert_eq!(report.splice, SpliceResult::Applied { range: 7..25 });
        let request = &fx.transport.requests()[0];
        assert_eq!(request.style.as_deref(), Some("formal"));
        assert_eq!(request.selected_text.as_deref(), Some("old clumsy words"));
        assert!(fx.backend.saved.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expand_falls_back_to_manual_insertion() {
        let fx = fixture(
            10_000,
            vec![Connection::Steps(vec![
                Step::Event(ServerEvent::content("a much longer passage")),
                Step::Event(ServerEvent::complete(4)),
            ])],
            3,
        );
        let original = String::from("Intro. short bit. Outro.");
        let selection = Selection::capture(&original, 7..16).unwrap();
        let mut edited = String::from("Intro. SHORT BIT. Outro.");

        let report = assert_ok!(
            fx.orchestrator
                .expand(&ChapterRef::new("p", "c"), &selection, None, &mut edited)
                .await
        );

        assert_eq!(edited, "Intro. SHORT BIT. Outro.");
        assert_eq!(
            report.splice,
            SpliceResult::ManualInsertion {
                text: "a much longer passage".to_string()
            }
        );
        assert_eq!(fx.transport.requests()[0].target_words, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecoverable_failure_reports_saved_content() {
        let fx = fixture(
            10_000,
            vec![Connection::Steps(vec![
                Step::Event(ServerEvent::content(words(0..150))),
                Step::Event(ServerEvent::Autosave {
                    word_count: 120,
                    message: None,
                }),
                Step::Fail(TransportError::Stream("reset".into())),
            ])],
            1,
        );
        let mut editor = String::new();

        let err = assert_err!(
            fx.orchestrator
                .generate_chapter(
                    &ChapterRef::new("p", "c"),
                    GenerationType::Progressive,
                    GenerationOptions::new(500).without_papers(),
                    &mut editor
                )
                .await
        );

        assert_eq!(err.code, ErrorCode::MaxRetriesExceeded);
        let state = fx.orchestrator.state();
        assert!(state.partial_content_saved);
        assert_eq!(state.highest_autosave_word_count, 120);
        assert_eq!(state.saved_word_count_on_error, Some(120));
        assert!(state.recovery_available);
        assert_eq!(editor, words(0..150));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(fx.backend.usage.lock().unwrap().is_empty());
        assert!(fx.backend.saved.lock().unwrap().is_empty());
    }

    #[test]
    fn test_selection_capture_validates_range() {
        let editor = String::from("hello world");
        assert!(Selection::capture(&editor, 0..50).is_err());
        assert!(Selection::capture(&editor, 5..6).is_err());
        assert_eq!(Selection::capture(&editor, 6..11).unwrap().text, "world");
    }
}
