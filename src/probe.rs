use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::watch;

use crate::config::StreamConfig;

// ============================================================================
// Network monitor
// ============================================================================

/// Effective link type as reported by the host runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkQuality {
    #[default]
    Unknown,
    Slow2g,
    TwoG,
    ThreeG,
    FourG,
}

impl LinkQuality {
    pub fn is_slow(&self) -> bool {
        matches!(self, Self::Slow2g | Self::TwoG)
    }
}

/// Connectivity signal supplied by whatever hosts the engine.
#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    fn is_online(&self) -> bool;

    fn link_quality(&self) -> LinkQuality {
        LinkQuality::Unknown
    }

    /// Waits for an offline → online transition. Returns `false` on timeout.
    async fn wait_for_online(&self, timeout: Duration) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NetworkState {
    online: bool,
    link: LinkQuality,
}

/// Host-updated connectivity state backed by a watch channel.
#[derive(Debug, Clone)]
pub struct NetworkStatus {
    tx: Arc<watch::Sender<NetworkState>>,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::online()
    }
}

impl NetworkStatus {
    fn with_state(online: bool) -> Self {
        let (tx, _rx) = watch::channel(NetworkState {
            online,
            link: LinkQuality::Unknown,
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn online() -> Self {
        Self::with_state(true)
    }

    pub fn offline() -> Self {
        Self::with_state(false)
    }

    pub fn set_online(&self, online: bool) {
        self.tx.send_modify(|s| {
            if s.online != online {
                log::info!("🌐 network is now {}", if online { "online" } else { "offline" });
            }
            s.online = online;
        });
    }

    pub fn set_link_quality(&self, link: LinkQuality) {
        self.tx.send_modify(|s| s.link = link);
    }
}

#[async_trait]
impl NetworkMonitor for NetworkStatus {
    fn is_online(&self) -> bool {
        self.tx.borrow().online
    }

    fn link_quality(&self) -> LinkQuality {
        self.tx.borrow().link
    }

    async fn wait_for_online(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| s.online)).await,
            Ok(Ok(_))
        )
    }
}

// ============================================================================
// Connection quality probe
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The runtime reports no connectivity at all.
    Offline,
    /// Connected over a very slow link; advisory only.
    Slow,
    /// The ping failed or timed out; advisory only.
    Unreachable,
    Ok,
}

impl ProbeOutcome {
    /// Only a hard offline signal blocks the stream. The stream connection
    /// itself is the authoritative test for everything else.
    pub fn can_proceed(&self) -> bool {
        !matches!(self, Self::Offline)
    }
}

#[derive(Clone)]
pub struct ConnectionProbe {
    network: Arc<dyn NetworkMonitor>,
    ping_url: Option<String>,
    client: Client,
    timeout: Duration,
}

impl ConnectionProbe {
    pub fn new(network: Arc<dyn NetworkMonitor>, timeout: Duration) -> Self {
        Self {
            network,
            ping_url: None,
            client: Client::new(),
            timeout,
        }
    }

    /// Probe bounded by [`StreamConfig::probe_timeout`].
    pub fn from_config(network: Arc<dyn NetworkMonitor>, config: &StreamConfig) -> Self {
        Self::new(network, config.probe_timeout)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn with_ping(mut self, url: impl Into<String>) -> Self {
        self.ping_url = Some(url.into());
        self
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn network(&self) -> &Arc<dyn NetworkMonitor> {
        &self.network
    }

    pub async fn check_connection_quality(&self) -> ProbeOutcome {
        if !self.network.is_online() {
            log::warn!("📴 no network connectivity reported");
            return ProbeOutcome::Offline;
        }

        if self.network.link_quality().is_slow() {
            log::warn!("🐢 slow connection detected, generation may take longer");
            return ProbeOutcome::Slow;
        }

        let Some(url) = &self.ping_url else {
            return ProbeOutcome::Ok;
        };

        match self.client.head(url).timeout(self.timeout).send().await {
            Ok(resp) => {
                log::debug!("ping {} -> {}", url, resp.status());
                ProbeOutcome::Ok
            }
            Err(e) => {
                log::warn!("⚠️  connection check failed ({}), proceeding anyway", e);
                ProbeOutcome::Unreachable
            }
        }
    }
}
