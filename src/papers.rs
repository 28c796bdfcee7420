use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use tokio::time::MissedTickBehavior;

use crate::collaborators::ChapterRef;
use crate::error::{ErrorCode, GenerationError, Result};
use crate::requests::CancellationToken;

// ============================================================================
// Status payload
// ============================================================================

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CollectionStatus {
    #[default]
    Initializing,
    CollectingPapers,
    Processing,
    Storing,
    Completed,
    CollectionFailed,
}

impl CollectionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::CollectionFailed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperPreview {
    pub title: String,
    pub authors: Vec<String>,
    pub year: Option<i32>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperCollectionStatus {
    pub status: CollectionStatus,
    #[serde(alias = "count")]
    pub papers_count: usize,
    pub message: String,
    pub percentage: f64,
    pub current_source: Option<String>,
    pub sources_completed: Vec<String>,
    pub papers_preview: Vec<PaperPreview>,
}

#[async_trait]
pub trait PaperCollectionApi: Send + Sync {
    async fn start_collection(&self, target: &ChapterRef) -> Result<()>;

    async fn fetch_status(&self, target: &ChapterRef) -> Result<PaperCollectionStatus>;
}

// ============================================================================
// Polling
// ============================================================================

/// Drives the pre-stream source collection phase by polling its status.
///
/// The poll timer lives inside [`PaperCollector::collect`], so it is torn
/// down whenever that future finishes or is dropped.
pub struct PaperCollector {
    api: Arc<dyn PaperCollectionApi>,
    interval: Duration,
    max_attempts: u32,
}

impl PaperCollector {
    pub fn new(api: Arc<dyn PaperCollectionApi>, interval: Duration, max_attempts: u32) -> Self {
        Self {
            api,
            interval,
            max_attempts,
        }
    }

    pub async fn collect(
        &self,
        target: &ChapterRef,
        token: &CancellationToken,
        mut on_status: impl FnMut(&PaperCollectionStatus) + Send,
    ) -> Result<PaperCollectionStatus> {
        token.check()?;
        log::info!("📚 collecting papers for {}", target);
        self.api.start_collection(target).await?;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        for attempt in 1..=self.max_attempts {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    log::info!("paper collection for {} cancelled", target);
                    return Err(GenerationError::cancelled());
                }
                _ = ticker.tick() => {}
            }

            let status = match self.api.fetch_status(target).await {
                Ok(status) => status,
                Err(e) => {
                    log::warn!("paper status poll {} failed: {}", attempt, e);
                    continue;
                }
            };
            log::debug!(
                "paper collection {} ({:.0}%, {} papers)",
                status.status,
                status.percentage,
                status.papers_count
            );
            on_status(&status);

            match status.status {
                CollectionStatus::Completed => {
                    log::info!("✅ collected {} papers for {}", status.papers_count, target);
                    return Ok(status);
                }
                CollectionStatus::CollectionFailed => {
                    let message = if status.message.is_empty() {
                        "Paper collection failed".to_string()
                    } else {
                        status.message.clone()
                    };
                    return Err(GenerationError::new(ErrorCode::CollectionFailed, message));
                }
                _ => {}
            }
        }

        Err(GenerationError::new(
            ErrorCode::CollectionTimeout,
            format!(
                "Paper collection did not finish after {} status checks",
                self.max_attempts
            ),
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Serves a fixed sequence of statuses, repeating the last one.
    pub(crate) struct ScriptedPapers {
        statuses: Mutex<VecDeque<CollectionStatus>>,
        pub(crate) polls: AtomicU32,
        pub(crate) starts: AtomicU32,
    }

    impl ScriptedPapers {
        pub(crate) fn new(statuses: Vec<CollectionStatus>) -> Self {
            Self {
                statuses: Mutex::new(statuses.into()),
                polls: AtomicU32::new(0),
                starts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl PaperCollectionApi for ScriptedPapers {
        async fn start_collection(&self, _target: &ChapterRef) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn fetch_status(&self, _target: &ChapterRef) -> Result<PaperCollectionStatus> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut statuses = self.statuses.lock().unwrap();
            let status = if statuses.len() > 1 {
                statuses.pop_front().unwrap()
            } else {
                *statuses.front().unwrap()
            };
            Ok(PaperCollectionStatus {
                status,
                papers_count: 4,
                message: format!("{}", status),
                ..Default::default()
            })
        }
    }

    fn target() -> ChapterRef {
        ChapterRef::new("p", "c")
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_completed() {
        let api = Arc::new(ScriptedPapers::new(vec![
            CollectionStatus::CollectingPapers,
            CollectionStatus::Processing,
            CollectionStatus::Completed,
        ]));
        let collector = PaperCollector::new(api.clone(), Duration::from_secs(2), 10);
        let mut seen = Vec::new();

        let started = tokio::time::Instant::now();
        let status = collector
            .collect(&target(), &CancellationToken::new(), |s| seen.push(s.status))
            .await
            .unwrap();

        assert_eq!(status.status, CollectionStatus::Completed);
        assert_eq!(seen.len(), 3);
        assert_eq!(api.polls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_collection() {
        let api = Arc::new(ScriptedPapers::new(vec![CollectionStatus::CollectionFailed]));
        let collector = PaperCollector::new(api, Duration::from_secs(2), 10);
        let err = collector
            .collect(&target(), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CollectionFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_after_max_attempts() {
        let api = Arc::new(ScriptedPapers::new(vec![CollectionStatus::Processing]));
        let collector = PaperCollector::new(api.clone(), Duration::from_secs(2), 5);
        let err = collector
            .collect(&target(), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CollectionTimeout);
        assert_eq!(api.polls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_polling() {
        let api = Arc::new(ScriptedPapers::new(vec![CollectionStatus::Processing]));
        let collector = PaperCollector::new(api.clone(), Duration::from_secs(2), 300);
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let err = collector.collect(&target(), &token, |_| {}).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Cancelled);
        assert_eq!(api.polls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_status_accepts_count_alias() {
        let status: PaperCollectionStatus =
            serde_json::from_str(r#"{"status":"collecting_papers","count":7,"percentage":40}"#).unwrap();
        assert_eq!(status.papers_count, 7);
        assert_eq!(status.status, CollectionStatus::CollectingPapers);
        assert!(!status.status.is_terminal());
    }
}
