use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Stream Session Configuration
// ============================================================================

/// Tunables for a single [`StreamSession`](crate::session::StreamSession).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Fraction of the computed delay added as random jitter (0.0 to 1.0).
    pub jitter_factor: f64,
    pub heartbeat_timeout: Duration,
    /// Bound on the reachability ping performed before connecting.
    pub probe_timeout: Duration,
    /// Bound on opening the transport.
    pub connect_timeout: Duration,
    /// How long a reconnect waits for the network to come back.
    pub offline_wait: Duration,
    pub render_batch_size: usize,
    pub render_interval: Duration,
    /// Relative drift tolerated between local and server word counts.
    pub word_count_tolerance: f64,
    /// Streamed words above which a failure offers a recovery path.
    pub recovery_threshold_words: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            jitter_factor: 0.3,
            heartbeat_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(15),
            offline_wait: Duration::from_secs(30),
            render_batch_size: 5,
            render_interval: Duration::from_millis(50),
            word_count_tolerance: 0.05,
            recovery_threshold_words: 100,
        }
    }
}

impl StreamConfig {
    /// Defaults overlaid with any `THESIS_STREAM_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().merge(StreamConfigOverrides::from_env())
    }

    /// Shallow merge: every field set in `overrides` replaces the current one.
    pub fn merge(mut self, overrides: StreamConfigOverrides) -> Self {
        if let Some(v) = overrides.max_reconnect_attempts {
            self.max_reconnect_attempts = v;
        }
        if let Some(v) = overrides.reconnect_base_delay {
            self.reconnect_base_delay = v;
        }
        if let Some(v) = overrides.reconnect_max_delay {
            self.reconnect_max_delay = v;
        }
        if let Some(v) = overrides.jitter_factor {
            self.jitter_factor = v.clamp(0.0, 1.0);
        }
        if let Some(v) = overrides.heartbeat_timeout {
            self.heartbeat_timeout = v;
        }
        if let Some(v) = overrides.probe_timeout {
            self.probe_timeout = v;
        }
        if let Some(v) = overrides.connect_timeout {
            self.connect_timeout = v;
        }
        if let Some(v) = overrides.offline_wait {
            self.offline_wait = v;
        }
        if let Some(v) = overrides.render_batch_size {
            self.render_batch_size = v.max(1);
        }
        if let Some(v) = overrides.render_interval {
            self.render_interval = v;
        }
        if let Some(v) = overrides.word_count_tolerance {
            self.word_count_tolerance = v;
        }
        if let Some(v) = overrides.recovery_threshold_words {
            self.recovery_threshold_words = v;
        }
        self
    }
}

/// Optional overrides for [`StreamConfig`]; unset fields keep the default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfigOverrides {
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_base_delay: Option<Duration>,
    pub reconnect_max_delay: Option<Duration>,
    pub jitter_factor: Option<f64>,
    pub heartbeat_timeout: Option<Duration>,
    pub probe_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub offline_wait: Option<Duration>,
    pub render_batch_size: Option<usize>,
    pub render_interval: Option<Duration>,
    pub word_count_tolerance: Option<f64>,
    pub recovery_threshold_words: Option<usize>,
}

impl StreamConfigOverrides {
    pub fn from_env() -> Self {
        Self {
            max_reconnect_attempts: env_parse("THESIS_STREAM_MAX_RECONNECT_ATTEMPTS"),
            reconnect_base_delay: env_millis("THESIS_STREAM_RECONNECT_BASE_DELAY_MS"),
            reconnect_max_delay: env_millis("THESIS_STREAM_RECONNECT_MAX_DELAY_MS"),
            jitter_factor: env_parse("THESIS_STREAM_JITTER_FACTOR"),
            heartbeat_timeout: env_millis("THESIS_STREAM_HEARTBEAT_TIMEOUT_MS"),
            probe_timeout: env_millis("THESIS_STREAM_PROBE_TIMEOUT_MS"),
            connect_timeout: env_millis("THESIS_STREAM_CONNECT_TIMEOUT_MS"),
            offline_wait: env_millis("THESIS_STREAM_OFFLINE_WAIT_MS"),
            render_batch_size: env_parse("THESIS_STREAM_RENDER_BATCH_SIZE"),
            render_interval: env_millis("THESIS_STREAM_RENDER_INTERVAL_MS"),
            word_count_tolerance: env_parse("THESIS_STREAM_WORD_COUNT_TOLERANCE"),
            recovery_threshold_words: env_parse("THESIS_STREAM_RECOVERY_THRESHOLD_WORDS"),
        }
    }
}

// ============================================================================
// Generator (orchestrator) Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Base URL of the writing service, e.g. `http://127.0.0.1:3000`.
    pub base_url: String,
    pub paper_poll_interval: Duration,
    pub paper_poll_max_attempts: u32,
    /// Safety multiplier applied to the target length for the balance check.
    pub balance_multiplier: f64,
    pub stream: StreamConfig,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".to_string(),
            paper_poll_interval: Duration::from_secs(2),
            paper_poll_max_attempts: 300,
            balance_multiplier: 1.2,
            stream: StreamConfig::default(),
        }
    }
}

impl GeneratorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("THESIS_STREAM_BASE_URL").unwrap_or(defaults.base_url),
            paper_poll_interval: env_millis("THESIS_STREAM_PAPER_POLL_INTERVAL_MS")
                .unwrap_or(defaults.paper_poll_interval),
            paper_poll_max_attempts: env_parse("THESIS_STREAM_PAPER_POLL_MAX_ATTEMPTS")
                .unwrap_or(defaults.paper_poll_max_attempts),
            balance_multiplier: env_parse("THESIS_STREAM_BALANCE_MULTIPLIER")
                .unwrap_or(defaults.balance_multiplier),
            stream: StreamConfig::from_env(),
        }
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

// ============================================================================
// Simulation Server Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Delay between simulated content chunks.
    pub chunk_delay: Duration,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?,
            chunk_delay: env_millis("SIM_CHUNK_DELAY_MS").unwrap_or(Duration::from_millis(150)),
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
