use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use thesis_stream::config::ServerConfig;
use thesis_stream::simulator::{self, SimulatorConfig, SimulatorState};

fn create_app_router(state: Arc<SimulatorState>) -> Router {
    simulator::router(state).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("🚀 Starting thesis generation simulator...");
    dotenv::dotenv().ok();
    let config = ServerConfig::from_env()?;
    let state = Arc::new(SimulatorState::new(SimulatorConfig {
        chunk_delay: config.chunk_delay,
        ..Default::default()
    }));
    log::info!("✅ Simulator state initialized");
    let app = create_app_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    log::info!("");
    log::info!("🎉 Server started!");
    log::info!("📍 http://{}", addr);
    log::info!("📡 Stream: http://{}/api/projects/{{project}}/chapters/{{chapter}}/stream", addr);
    log::info!("📚 Papers: http://{}/api/projects/{{project}}/chapters/{{chapter}}/papers/status", addr);
    log::info!("📊 Jobs:   http://{}/api/projects/{{project}}/generation/events", addr);
    log::info!("❤️  Health: http://{}/api/health", addr);
    log::info!("⏱️  Chunk delay: {:?}", config.chunk_delay);
    log::info!("");

    axum::serve(listener, app).await?;

    Ok(())
}
