use std::sync::Arc;
use std::time::Duration;

use thesis_stream::collaborators::{project_events_path, ChapterRef, Collaborators, HttpBackend};
use thesis_stream::config::{GeneratorConfig, StreamConfig};
use thesis_stream::events::GenerationType;
use thesis_stream::orchestrator::{GenerationOptions, GenerationOrchestrator};
use thesis_stream::probe::{ConnectionProbe, NetworkStatus};
use thesis_stream::progress_channel::{JobStatus, ProgressChannelListener, StageKind, StageStatus};
use thesis_stream::requests::CancellationToken;
use thesis_stream::session::SessionStatus;
use thesis_stream::simulator::{self, simulated_text, SimulatorConfig, SimulatorState};
use thesis_stream::transport::SseTransport;
use thesis_stream::word_count::count_words;

async fn spawn_simulator(config: SimulatorConfig) -> (String, Arc<SimulatorState>) {
    let state = Arc::new(SimulatorState::new(config));
    let app = simulator::router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), state)
}

fn generator_config(base_url: &str) -> GeneratorConfig {
    GeneratorConfig {
        base_url: base_url.to_string(),
        paper_poll_interval: Duration::from_millis(10),
        paper_poll_max_attempts: 50,
        stream: StreamConfig {
            reconnect_base_delay: Duration::from_millis(20),
            reconnect_max_delay: Duration::from_millis(100),
            heartbeat_timeout: Duration::from_secs(5),
            ..StreamConfig::default()
        },
        ..GeneratorConfig::default()
    }
}

fn orchestrator(config: GeneratorConfig) -> GenerationOrchestrator {
    let probe = ConnectionProbe::from_config(Arc::new(NetworkStatus::online()), &config.stream)
        .with_ping(config.endpoint("/api/health"));
    let collaborators = Collaborators::http(HttpBackend::new(config.clone()));
    GenerationOrchestrator::new(config, Arc::new(SseTransport::default()), probe, collaborators)
}

#[tokio::test]
async fn chapter_survives_dropped_connection() {
    let (base_url, state) = spawn_simulator(SimulatorConfig {
        chunk_delay: Duration::ZERO,
        collection_polls: 3,
        fail_after: Some(120),
        ..Default::default()
    })
    .await;
    let orchestrator = orchestrator(generator_config(&base_url));
    let chapter = ChapterRef::new("thesis-1", "chapter-2");
    let mut editor = String::new();

    let report = orchestrator
        .generate_chapter(&chapter, GenerationType::Progressive, GenerationOptions::new(300), &mut editor)
        .await
        .unwrap();

    assert_eq!(editor, simulated_text(0..300));
    assert_eq!(count_words(&editor), 300);
    assert_eq!(report.final_word_count, 300);
    assert!(report.saved);

    let generation_id = report.generation_id.clone().unwrap();
    let record = state.generation(&generation_id).await.unwrap();
    assert_eq!(record.connections, 2);
    assert!(record.completed);

    let saved = state.saved_chapter(&chapter).await.unwrap();
    assert_eq!(saved.word_count, 300);

    let final_state = orchestrator.state();
    assert!(!final_state.is_generating);
    assert_eq!(final_state.session_status, Some(SessionStatus::Complete));
    assert_eq!(final_state.word_count, 300);

    let mut usage = Vec::new();
    for _ in 0..50 {
        usage = state.usage_records().await;
        if !usage.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].words_used, 300);
    assert_eq!(usage[0].reference_id, generation_id);
}

#[tokio::test]
async fn insufficient_balance_stops_before_streaming() {
    let (base_url, state) = spawn_simulator(SimulatorConfig {
        chunk_delay: Duration::ZERO,
        initial_balance: 100,
        ..Default::default()
    })
    .await;
    let orchestrator = orchestrator(generator_config(&base_url));
    let chapter = ChapterRef::new("thesis-1", "chapter-3");
    let mut editor = String::from("existing draft");

    let err = orchestrator
        .generate_chapter(
            &chapter,
            GenerationType::Progressive,
            GenerationOptions::new(500).without_papers(),
            &mut editor,
        )
        .await
        .unwrap_err();

    assert_eq!(err.code.as_str(), "INSUFFICIENT_BALANCE");
    assert_eq!(editor, "existing draft");
    assert!(state.saved_chapter(&chapter).await.is_none());
    assert!(state.usage_records().await.is_empty());
}

#[tokio::test]
async fn project_channel_reports_chapter_stages() {
    let (base_url, _state) = spawn_simulator(SimulatorConfig {
        chunk_delay: Duration::ZERO,
        ..Default::default()
    })
    .await;
    let transport = SseTransport::default();
    let url = format!("{}{}?chapters=2", base_url, project_events_path("thesis-1"));
    let events = transport.subscribe(&url).await.unwrap();

    let mut listener = ProgressChannelListener::new("thesis-1");
    let mut updates = 0;
    let status = listener
        .listen(events, &CancellationToken::new(), |_| updates += 1)
        .await
        .unwrap();

    assert_eq!(status, JobStatus::Completed);
    assert!(updates >= 7);
    let progress = listener.progress();
    assert_eq!(progress.chapter_count(), 2);
    for kind in [StageKind::LiteratureMining, StageKind::Chapter(1), StageKind::Chapter(2)] {
        assert_eq!(progress.stage(kind).unwrap().status, StageStatus::Completed);
    }
}

#[tokio::test]
async fn project_channel_failure_is_resumable() {
    let (base_url, _state) = spawn_simulator(SimulatorConfig {
        chunk_delay: Duration::ZERO,
        ..Default::default()
    })
    .await;
    let transport = SseTransport::default();
    let url = format!(
        "{}{}?chapters=3&fail_at_chapter=2",
        base_url,
        project_events_path("thesis-1")
    );
    let events = transport.subscribe(&url).await.unwrap();

    let mut listener = ProgressChannelListener::new("thesis-1");
    let status = listener
        .listen(events, &CancellationToken::new(), |_| {})
        .await
        .unwrap();

    assert_eq!(status, JobStatus::Failed);
    assert!(listener.progress().is_resumable());
}
