//! Word balance shared by every component of one editing visit.
//!
//! The store starts its live feed (if any) when the first subscription is
//! taken and tears it down when the last one is dropped.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

type FeedStarter = Arc<dyn Fn(BalanceStore) -> JoinHandle<()> + Send + Sync>;

struct Lifecycle {
    subscribers: usize,
    feed: Option<JoinHandle<()>>,
}

struct Inner {
    tx: watch::Sender<Option<u64>>,
    lifecycle: Mutex<Lifecycle>,
    starter: Option<FeedStarter>,
}

#[derive(Clone)]
pub struct BalanceStore {
    inner: Arc<Inner>,
}

impl Default for BalanceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BalanceStore {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A store whose updates come from a background feed, e.g. a push
    /// channel from the billing service.
    pub fn with_feed(starter: impl Fn(BalanceStore) -> JoinHandle<()> + Send + Sync + 'static) -> Self {
        Self::build(Some(Arc::new(starter)))
    }

    fn build(starter: Option<FeedStarter>) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                tx,
                lifecycle: Mutex::new(Lifecycle {
                    subscribers: 0,
                    feed: None,
                }),
                starter,
            }),
        }
    }

    /// Last known balance; `None` until the first update.
    pub fn current(&self) -> Option<u64> {
        *self.inner.tx.borrow()
    }

    pub fn apply_update(&self, balance: u64) {
        self.inner.tx.send_if_modified(|current| {
            if *current == Some(balance) {
                return false;
            }
            *current = Some(balance);
            true
        });
    }

    /// Optimistic local debit after usage was reported.
    pub fn debit(&self, words: u64) {
        self.inner.tx.send_if_modified(|current| match current {
            Some(balance) => {
                *balance = balance.saturating_sub(words);
                true
            }
            None => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_lifecycle().subscribers
    }

    pub fn subscribe(&self) -> BalanceSubscription {
        let start_feed = {
            let mut lifecycle = self.lock_lifecycle();
            lifecycle.subscribers += 1;
            lifecycle.subscribers == 1 && lifecycle.feed.is_none()
        };
        if start_feed {
            if let Some(starter) = &self.inner.starter {
                log::debug!("💰 starting balance feed");
                let handle = starter(self.clone());
                self.lock_lifecycle().feed = Some(handle);
            }
        }
        BalanceSubscription {
            store: self.clone(),
            rx: self.inner.tx.subscribe(),
        }
    }

    fn release(&self) {
        let feed = {
            let mut lifecycle = self.lock_lifecycle();
            lifecycle.subscribers = lifecycle.subscribers.saturating_sub(1);
            if lifecycle.subscribers == 0 {
                lifecycle.feed.take()
            } else {
                None
            }
        };
        if let Some(handle) = feed {
            log::debug!("💰 last balance subscriber gone, stopping feed");
            handle.abort();
        }
    }

    fn lock_lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Keeps the store's feed alive while held.
pub struct BalanceSubscription {
    store: BalanceStore,
    rx: watch::Receiver<Option<u64>>,
}

impl BalanceSubscription {
    pub fn current(&self) -> Option<u64> {
        *self.rx.borrow()
    }

    /// Waits for the next change. Returns `None` if the store is gone.
    pub async fn changed(&mut self) -> Option<Option<u64>> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}

impl Drop for BalanceSubscription {
    fn drop(&mut self) {
        self.store.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_updates_reach_subscribers() {
        let store = BalanceStore::new();
        let mut sub = store.subscribe();
        assert_eq!(sub.current(), None);

        store.apply_update(1000);
        assert_eq!(sub.changed().await, Some(Some(1000)));

        store.debit(250);
        assert_eq!(sub.changed().await, Some(Some(750)));
        assert_eq!(store.current(), Some(750));
    }

    #[test]
    fn test_debit_without_balance_is_noop() {
        let store = BalanceStore::new();
        store.debit(10);
        assert_eq!(store.current(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_follows_subscriber_count() {
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = starts.clone();
        let store = BalanceStore::with_feed(move |store| {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut balance = 500;
                loop {
                    store.apply_update(balance);
                    balance += 1;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            })
        });

        let first = store.subscribe();
        let second = store.subscribe();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(store.subscriber_count(), 2);

        drop(first);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.current().is_some());

        drop(second);
        assert_eq!(store.subscriber_count(), 0);
        tokio::task::yield_now().await;
        let frozen = store.current();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.current(), frozen);

        let _again = store.subscribe();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }
}
