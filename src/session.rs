//! Lifecycle of one resumable generation stream.
//!
//! A [`StreamSession`] is driven by the future returned from [`StreamSession::start`]
//! (or [`StreamSession::retry`]). That single future multiplexes transport
//! messages, timers and control commands, so the session state is only ever
//! touched from one place. Control from elsewhere goes through a
//! [`SessionControl`] handle.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::batcher::RenderBatcher;
use crate::config::StreamConfig;
use crate::error::{ErrorCode, ErrorRecord, GenerationError, Result};
use crate::events::{ServerErrorEvent, ServerEvent, StreamRequest};
use crate::probe::ConnectionProbe;
use crate::reconnect::{ReconnectPolicy, is_server_error_recoverable};
use crate::transport::{EventStream, EventTransport, TransportError};
use crate::word_count::{reconcile, WordTally};

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    CheckingConnection,
    Connecting,
    Streaming,
    Paused,
    Reconnecting,
    Error,
    Complete,
}

impl SessionStatus {
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        // stop() and reset() return any session to idle
        if next == Idle {
            return self != Idle;
        }
        matches!(
            (self, next),
            (Idle, CheckingConnection)
                | (CheckingConnection, Connecting)
                | (CheckingConnection, Error)
                | (Connecting, Streaming)
                | (Connecting, Reconnecting)
                | (Connecting, Error)
                | (Streaming, Reconnecting)
                | (Streaming, Error)
                | (Streaming, Complete)
                | (Streaming, Paused)
                | (Paused, Connecting)
                | (Reconnecting, Connecting)
                | (Error, Connecting)
        )
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::CheckingConnection
                | Self::Connecting
                | Self::Streaming
                | Self::Paused
                | Self::Reconnecting
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

// ============================================================================
// Progress & outcome
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub word_count: usize,
    pub target_word_count: usize,
    pub percentage: u8,
    pub phase: String,
    pub message: String,
}

impl Progress {
    fn update_percentage(&mut self) {
        self.percentage = if self.target_word_count == 0 {
            0
        } else {
            (self.word_count * 100 / self.target_word_count).min(100) as u8
        };
    }
}

/// What the caller learns when a session fails for good.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub error: ErrorRecord,
    /// Best known count of words that will survive a reload.
    pub safe_word_count: usize,
    pub buffered_word_count: usize,
    pub partial_saved: bool,
    pub can_retry: bool,
    /// Enough content was streamed to offer an explicit resume/reload path.
    pub recovery_available: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Completed {
        content: String,
        word_count: usize,
        final_word_count: usize,
    },
    Failed(FailureReport),
    Stopped,
}

// ============================================================================
// Observer & control
// ============================================================================

/// Callbacks a session invokes. Every method is optional.
pub trait SessionObserver: Send {
    fn on_status(&mut self, _from: SessionStatus, _to: SessionStatus) {}

    fn on_start(&mut self, _generation_id: Option<&str>) {}

    /// Throttled render of the whole buffer.
    fn on_content(&mut self, _buffer: &str, _progress: &Progress) {}

    fn on_progress(&mut self, _progress: &Progress) {}

    fn on_autosave(&mut self, _word_count: usize) {}

    fn on_reconnecting(&mut self, _attempt: u32, _max_attempts: u32, _delay: Duration) {}

    fn on_error(&mut self, _error: &ErrorRecord) {}

    fn on_complete(&mut self, _buffer: &str, _final_word_count: usize) {}
}

impl SessionObserver for () {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Pause,
    Resume,
    Stop,
}

/// Cloneable handle for steering a running session.
#[derive(Debug, Clone)]
pub struct SessionControl {
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionControl {
    pub fn pause(&self) {
        let _ = self.tx.send(SessionCommand::Pause);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(SessionCommand::Resume);
    }

    pub fn stop(&self) {
        let _ = self.tx.send(SessionCommand::Stop);
    }
}

// ============================================================================
// Driver steps
// ============================================================================

enum Next {
    Connect,
    Stream(EventStream),
    Backoff(Duration),
    Paused,
    Done(SessionOutcome),
}

enum PumpStep {
    Command(Option<SessionCommand>),
    Item(Option<std::result::Result<ServerEvent, TransportError>>),
    RenderDue,
    HeartbeatTimeout,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// Stream session
// ============================================================================

pub struct StreamSession {
    config: StreamConfig,
    transport: Arc<dyn EventTransport>,
    probe: ConnectionProbe,

    status: SessionStatus,
    buffer: String,
    word_count: usize,
    tally: WordTally,
    server_ack_word_count: usize,
    partial_saved: bool,
    generation_id: Option<String>,
    policy: ReconnectPolicy,
    progress: Progress,
    errors: Vec<ErrorRecord>,
    batcher: RenderBatcher,
    request: Option<StreamRequest>,

    commands_tx: mpsc::UnboundedSender<SessionCommand>,
    commands_rx: mpsc::UnboundedReceiver<SessionCommand>,
}

impl StreamSession {
    pub fn new(config: StreamConfig, transport: Arc<dyn EventTransport>, probe: ConnectionProbe) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            policy: ReconnectPolicy::new(&config),
            batcher: RenderBatcher::new(config.render_batch_size, config.render_interval),
            config,
            transport,
            probe,
            status: SessionStatus::Idle,
            buffer: String::new(),
            word_count: 0,
            tally: WordTally::new(),
            server_ack_word_count: 0,
            partial_saved: false,
            generation_id: None,
            progress: Progress::default(),
            errors: Vec::new(),
            request: None,
            commands_tx,
            commands_rx,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn word_count(&self) -> usize {
        self.word_count
    }

    pub fn server_ack_word_count(&self) -> usize {
        self.server_ack_word_count
    }

    pub fn generation_id(&self) -> Option<&str> {
        self.generation_id.as_deref()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.policy.attempts()
    }

    pub fn max_reconnect_attempts(&self) -> u32 {
        self.policy.max_attempts()
    }

    pub fn can_retry(&self) -> bool {
        self.policy.can_retry()
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    pub fn partial_saved(&self) -> bool {
        self.partial_saved
    }

    pub fn control(&self) -> SessionControl {
        SessionControl {
            tx: self.commands_tx.clone(),
        }
    }

    // ------------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------------

    /// Runs a generation until it completes, fails for good, or is stopped.
    pub async fn start(
        &mut self,
        request: StreamRequest,
        target_word_count: usize,
        observer: &mut dyn SessionObserver,
    ) -> Result<SessionOutcome> {
        if self.status != SessionStatus::Idle {
            return Err(GenerationError::invalid_state(format!(
                "cannot start a session that is {}",
                self.status
            )));
        }

        while self.commands_rx.try_recv().is_ok() {}
        self.policy.reset();
        self.request = Some(request);
        self.progress.target_word_count = target_word_count;
        self.progress.word_count = self.word_count;
        self.progress.update_percentage();

        self.set_status(SessionStatus::CheckingConnection, observer);
        self.set_phase("checking_connection", "Checking connection...", observer);

        let probe = self.probe.check_connection_quality().await;
        if !probe.can_proceed() {
            let record = ErrorRecord::from_error(&GenerationError::offline());
            self.errors.push(record.clone());
            observer.on_error(&record);
            self.set_status(SessionStatus::Error, observer);
            self.set_phase("error", &record.message, observer);
            return Ok(SessionOutcome::Failed(self.failure_report(record)));
        }

        self.set_status(SessionStatus::Connecting, observer);
        Ok(self.drive(observer).await)
    }

    /// Reconnects a failed session while reconnect attempts remain.
    pub async fn retry(&mut self, observer: &mut dyn SessionObserver) -> Result<SessionOutcome> {
        if self.status != SessionStatus::Error {
            return Err(GenerationError::invalid_state(format!(
                "retry is only possible after an error, session is {}",
                self.status
            )));
        }
        if !self.policy.can_retry() {
            return Err(GenerationError::new(
                ErrorCode::MaxRetriesExceeded,
                "no reconnect attempts remain",
            ));
        }
        if self.request.is_none() {
            return Err(GenerationError::invalid_state("session was never started"));
        }

        while self.commands_rx.try_recv().is_ok() {}
        log::info!("🔁 manual retry ({} attempt(s) used)", self.policy.attempts());
        self.set_status(SessionStatus::Connecting, observer);
        Ok(self.drive(observer).await)
    }

    /// Returns a session that is not running to idle, keeping its buffer.
    ///
    /// A running session is stopped through [`SessionControl::stop`]; dropping
    /// the `start` future and then calling this has the same effect.
    pub fn stop(&mut self) {
        if self.status != SessionStatus::Idle {
            self.set_status(SessionStatus::Idle, &mut ());
        }
        self.batcher.reset();
    }

    /// Discards everything streamed so far.
    pub fn reset(&mut self) {
        self.stop();
        self.buffer.clear();
        self.word_count = 0;
        self.tally.reset();
        self.server_ack_word_count = 0;
        self.partial_saved = false;
        self.generation_id = None;
        self.policy.reset();
        self.progress = Progress::default();
        self.errors.clear();
        self.request = None;
    }

    // ------------------------------------------------------------------------
    // Driver
    // ------------------------------------------------------------------------

    async fn drive(&mut self, observer: &mut dyn SessionObserver) -> SessionOutcome {
        let mut next = Next::Connect;
        loop {
            next = match next {
                Next::Connect => self.connect(observer).await,
                Next::Stream(stream) => self.pump(stream, observer).await,
                Next::Backoff(delay) => self.backoff(delay, observer).await,
                Next::Paused => self.wait_paused(observer).await,
                Next::Done(outcome) => return outcome,
            };
        }
    }

    async fn connect(&mut self, observer: &mut dyn SessionObserver) -> Next {
        let Some(request) = self.next_request() else {
            let record = ErrorRecord::new(ErrorCode::InvalidState.as_str(), "no request to connect", false);
            return self.fail(record, observer);
        };
        self.set_phase("connecting", "Connecting to generation service...", observer);

        let opened = {
            let connect = tokio::time::timeout(self.config.connect_timeout, self.transport.connect(&request));
            tokio::pin!(connect);
            loop {
                tokio::select! {
                    biased;
                    cmd = self.commands_rx.recv() => match cmd {
                        Some(SessionCommand::Stop) | None => break None,
                        Some(other) => log::debug!("ignoring {:?} while connecting", other),
                    },
                    res = &mut connect => break Some(res),
                }
            }
        };

        match opened {
            None => Next::Done(self.stopped(observer)),
            Some(Ok(Ok(stream))) => {
                log::info!(
                    "✅ stream open ({} generation, resume_from={:?})",
                    request.generation_type,
                    request.resume_from
                );
                self.set_status(SessionStatus::Streaming, observer);
                self.set_phase("generating", "Generating content...", observer);
                Next::Stream(stream)
            }
            Some(Ok(Err(err))) => self.transport_failure(ErrorCode::ConnectionError, err, observer),
            Some(Err(_)) => self.transport_failure(
                ErrorCode::ConnectionError,
                TransportError::Timeout(self.config.connect_timeout),
                observer,
            ),
        }
    }

    async fn pump(&mut self, mut stream: EventStream, observer: &mut dyn SessionObserver) -> Next {
        let mut last_message = Instant::now();
        loop {
            let heartbeat_at = last_message + self.config.heartbeat_timeout;
            let render_at = self.batcher.deadline();

            let step = tokio::select! {
                biased;
                cmd = self.commands_rx.recv() => PumpStep::Command(cmd),
                item = stream.next() => PumpStep::Item(item),
                _ = sleep_until_opt(render_at) => PumpStep::RenderDue,
                _ = tokio::time::sleep_until(heartbeat_at) => PumpStep::HeartbeatTimeout,
            };

            match step {
                PumpStep::Command(Some(SessionCommand::Pause)) => {
                    drop(stream);
                    self.flush_render(observer);
                    log::info!("⏸️  generation paused at {} words", self.word_count);
                    self.set_status(SessionStatus::Paused, observer);
                    self.set_phase("paused", "Generation paused", observer);
                    return Next::Paused;
                }
                PumpStep::Command(Some(SessionCommand::Stop)) | PumpStep::Command(None) => {
                    drop(stream);
                    return Next::Done(self.stopped(observer));
                }
                PumpStep::Command(Some(SessionCommand::Resume)) => {
                    log::debug!("ignoring resume while streaming");
                }
                PumpStep::Item(None) => {
                    drop(stream);
                    return self.transport_failure(
                        ErrorCode::StreamClosed,
                        TransportError::Stream("stream closed before completion".to_string()),
                        observer,
                    );
                }
                PumpStep::Item(Some(Err(err))) => {
                    drop(stream);
                    return self.transport_failure(ErrorCode::ConnectionError, err, observer);
                }
                PumpStep::Item(Some(Ok(event))) => {
                    last_message = Instant::now();
                    if let Some(next) = self.handle_event(event, observer) {
                        return next;
                    }
                }
                PumpStep::RenderDue => self.flush_render(observer),
                PumpStep::HeartbeatTimeout => {
                    drop(stream);
                    return self.transport_failure(
                        ErrorCode::HeartbeatTimeout,
                        TransportError::Timeout(self.config.heartbeat_timeout),
                        observer,
                    );
                }
            }
        }
    }

    async fn backoff(&mut self, delay: Duration, observer: &mut dyn SessionObserver) -> Next {
        let network = self.probe.network().clone();

        if !network.is_online() {
            log::warn!("📴 offline, waiting up to {:?} for the network", self.config.offline_wait);
            let online = tokio::select! {
                biased;
                cmd = self.commands_rx.recv() => match cmd {
                    Some(SessionCommand::Stop) | None => return Next::Done(self.stopped(observer)),
                    Some(_) => network.is_online(),
                },
                online = network.wait_for_online(self.config.offline_wait) => online,
            };
            if !online {
                log::warn!("still offline, attempting reconnect anyway");
            }
        }

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                cmd = self.commands_rx.recv() => match cmd {
                    Some(SessionCommand::Stop) | None => return Next::Done(self.stopped(observer)),
                    Some(other) => log::debug!("ignoring {:?} while reconnecting", other),
                },
                _ = &mut sleep => break,
            }
        }

        self.set_status(SessionStatus::Connecting, observer);
        Next::Connect
    }

    async fn wait_paused(&mut self, observer: &mut dyn SessionObserver) -> Next {
        loop {
            match self.commands_rx.recv().await {
                Some(SessionCommand::Resume) => {
                    log::info!("▶️  resuming from {} words", self.word_count);
                    self.set_status(SessionStatus::Connecting, observer);
                    return Next::Connect;
                }
                Some(SessionCommand::Stop) | None => return Next::Done(self.stopped(observer)),
                Some(SessionCommand::Pause) => {}
            }
        }
    }

    // ------------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------------

    fn handle_event(&mut self, event: ServerEvent, observer: &mut dyn SessionObserver) -> Option<Next> {
        log::trace!("stream event: {}", event.kind());
        match event {
            ServerEvent::Start { generation_id, message } => {
                self.first_message_received();
                if let Some(id) = generation_id {
                    if self.generation_id.as_deref() != Some(id.as_str()) {
                        log::info!("🆔 generation id {}", id);
                    }
                    self.generation_id = Some(id);
                }
                if let Some(message) = message {
                    self.set_phase("generating", &message, observer);
                }
                observer.on_start(self.generation_id.as_deref());
                None
            }
            ServerEvent::Content { content, word_count } => {
                self.first_message_received();
                self.buffer.push_str(&content);
                self.word_count = self.tally.update(&self.buffer);
                if let Some(server_count) = word_count {
                    reconcile(self.word_count, server_count, self.config.word_count_tolerance);
                }
                self.progress.word_count = self.word_count;
                self.progress.update_percentage();

                let now = Instant::now();
                if self.batcher.push(now) {
                    self.flush_render(observer);
                }
                None
            }
            ServerEvent::Heartbeat { .. } => None,
            ServerEvent::Autosave { word_count, .. } => {
                if word_count > self.server_ack_word_count {
                    self.server_ack_word_count = word_count;
                }
                log::debug!("💾 server autosaved {} words", word_count);
                observer.on_autosave(word_count);
                None
            }
            ServerEvent::Complete { final_word_count, generation_id } => {
                if let Some(id) = generation_id {
                    self.generation_id = Some(id);
                }
                Some(self.complete(final_word_count, observer))
            }
            ServerEvent::End => {
                log::debug!("stream ended without a complete event, using local count");
                Some(self.complete(self.word_count, observer))
            }
            ServerEvent::Error(err) => Some(self.server_error(err, observer)),
        }
    }

    fn first_message_received(&mut self) {
        if self.policy.attempts() > 0 {
            log::info!("🔗 reconnected after {} attempt(s)", self.policy.attempts());
            self.policy.reset();
        }
    }

    fn complete(&mut self, final_word_count: usize, observer: &mut dyn SessionObserver) -> Next {
        self.flush_render(observer);
        reconcile(self.word_count, final_word_count, self.config.word_count_tolerance);
        self.server_ack_word_count = self.server_ack_word_count.max(final_word_count);

        self.progress.word_count = self.word_count;
        self.progress.percentage = 100;
        self.set_status(SessionStatus::Complete, observer);
        self.set_phase("complete", "Generation complete", observer);
        log::info!("🎉 generation complete: {} words", final_word_count);

        observer.on_complete(&self.buffer, final_word_count);
        Next::Done(SessionOutcome::Completed {
            content: self.buffer.clone(),
            word_count: self.word_count,
            final_word_count,
        })
    }

    fn server_error(&mut self, err: ServerErrorEvent, observer: &mut dyn SessionObserver) -> Next {
        let recoverable = is_server_error_recoverable(&err);
        let record = ErrorRecord::new(err.code.clone(), err.message.clone(), recoverable);
        self.errors.push(record.clone());

        if err.partial_saved {
            self.partial_saved = true;
            if let Some(saved) = err.saved_word_count {
                self.server_ack_word_count = self.server_ack_word_count.max(saved);
            }
        }

        log::warn!("server error {} (recoverable={})", record, recoverable);
        observer.on_error(&record);

        if !recoverable {
            self.flush_render(observer);
            return self.fail(record, observer);
        }
        self.schedule_reconnect(observer)
    }

    // ------------------------------------------------------------------------
    // Failure paths
    // ------------------------------------------------------------------------

    fn transport_failure(
        &mut self,
        code: ErrorCode,
        err: TransportError,
        observer: &mut dyn SessionObserver,
    ) -> Next {
        let fatal = err.is_fatal();
        let record = ErrorRecord::new(code.as_str(), err.to_string(), !fatal);
        log::warn!("⚠️  transport failure in {}: {}", self.status, err);
        self.errors.push(record.clone());

        if fatal {
            observer.on_error(&record);
            return self.fail(record, observer);
        }
        self.schedule_reconnect(observer)
    }

    fn schedule_reconnect(&mut self, observer: &mut dyn SessionObserver) -> Next {
        self.flush_render(observer);
        match self.policy.register_failure() {
            Some(delay) => {
                let attempt = self.policy.attempts();
                let max = self.policy.max_attempts();
                log::info!(
                    "🔄 reconnecting in {:?} (attempt {}/{}, resume_from={})",
                    delay,
                    attempt,
                    max,
                    self.word_count
                );
                self.set_status(SessionStatus::Reconnecting, observer);
                self.set_phase(
                    "reconnecting",
                    &format!("Connection lost. Reconnecting ({}/{})...", attempt, max),
                    observer,
                );
                observer.on_reconnecting(attempt, max, delay);
                Next::Backoff(delay)
            }
            None => {
                let record = ErrorRecord::new(
                    ErrorCode::MaxRetriesExceeded.as_str(),
                    format!(
                        "Connection failed after {} reconnect attempts",
                        self.policy.max_attempts()
                    ),
                    false,
                );
                self.errors.push(record.clone());
                observer.on_error(&record);
                self.fail(record, observer)
            }
        }
    }

    fn fail(&mut self, record: ErrorRecord, observer: &mut dyn SessionObserver) -> Next {
        self.set_status(SessionStatus::Error, observer);
        self.set_phase("error", &record.message, observer);
        log::error!("❌ generation failed: {}", record);
        Next::Done(SessionOutcome::Failed(self.failure_report(record)))
    }

    fn failure_report(&self, error: ErrorRecord) -> FailureReport {
        let recovery_available = self.word_count > self.config.recovery_threshold_words;
        let safe_word_count = if self.server_ack_word_count > 0 {
            self.server_ack_word_count
        } else if recovery_available {
            self.word_count
        } else {
            0
        };
        FailureReport {
            error,
            safe_word_count,
            buffered_word_count: self.word_count,
            partial_saved: self.partial_saved,
            can_retry: self.policy.can_retry(),
            recovery_available,
        }
    }

    fn stopped(&mut self, observer: &mut dyn SessionObserver) -> SessionOutcome {
        self.flush_render(observer);
        log::info!("⏹️  generation stopped at {} words", self.word_count);
        self.set_status(SessionStatus::Idle, observer);
        self.batcher.reset();
        SessionOutcome::Stopped
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn next_request(&self) -> Option<StreamRequest> {
        let mut request = self.request.clone()?;
        request.resume_from = (self.word_count > 0).then_some(self.word_count);
        request.generation_id = self.generation_id.clone();
        Some(request)
    }

    fn flush_render(&mut self, observer: &mut dyn SessionObserver) {
        if !self.batcher.has_pending() {
            return;
        }
        self.batcher.mark_rendered(Instant::now());
        observer.on_content(&self.buffer, &self.progress);
    }

    fn set_status(&mut self, next: SessionStatus, observer: &mut dyn SessionObserver) -> bool {
        let current = self.status;
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            log::error!("refusing invalid session transition {} -> {}", current, next);
            return false;
        }
        log::debug!("session {} -> {}", current, next);
        self.status = next;
        observer.on_status(current, next);
        true
    }

    fn set_phase(&mut self, phase: &str, message: &str, observer: &mut dyn SessionObserver) {
        self.progress.phase = phase.to_string();
        self.progress.message = message.to_string();
        observer.on_progress(&self.progress);
    }
}

// ============================================================================
// Tests
// ============================================================================
