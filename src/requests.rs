use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::error::{GenerationError, Result};

// ============================================================================
// CANCELLATION TOKEN
// ============================================================================

#[derive(Clone, Debug)]
pub struct CancellationToken {
    cancelled: Arc<watch::Sender<bool>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            cancelled: Arc::new(tx),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(GenerationError::cancelled())
        } else {
            Ok(())
        }
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.subscribe();
        // the sender lives in self, so wait_for cannot observe a closed channel
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

// ============================================================================
// REQUEST MANAGER
// ============================================================================

/// Tracks in-flight generations per target (a chapter, section or selection).
///
/// The map is behind a blocking mutex that is never held across an await, so
/// a [`RequestGuard`] can release its target from `Drop`.
#[derive(Clone, Default)]
pub struct RequestManager {
    active_requests: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl RequestManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.active_requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers `target`, rejecting it while another generation holds it.
    ///
    /// The target is released when the returned guard is dropped, including
    /// when the owning future is cancelled.
    pub fn register(&self, target: &str) -> Result<RequestGuard> {
        let mut requests = self.lock();
        if requests.contains_key(target) {
            return Err(GenerationError::already_active(target));
        }
        let token = CancellationToken::new();
        requests.insert(target.to_string(), token.clone());
        Ok(RequestGuard {
            manager: self.clone(),
            target: target.to_string(),
            token,
        })
    }

    pub fn cancel(&self, target: &str) -> bool {
        match self.lock().get(target) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let requests = self.lock();
        for token in requests.values() {
            token.cancel();
        }
        requests.len()
    }

    pub fn unregister(&self, target: &str) {
        self.lock().remove(target);
    }

    pub fn is_active(&self, target: &str) -> bool {
        self.lock().contains_key(target)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }
}

/// Holds a registered target until dropped.
pub struct RequestGuard {
    manager: RequestManager,
    target: String,
    token: CancellationToken,
}

impl RequestGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        log::debug!("releasing {}", self.target);
        self.manager.unregister(&self.target);
    }
}
