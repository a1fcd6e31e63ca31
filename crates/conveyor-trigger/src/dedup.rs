//! Time-bounded memory of recently processed commits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Entry count above which `mark_processed` purges expired keys inline.
const DEFAULT_SWEEP_THRESHOLD: usize = 1024;

/// Remembers `repository:commit` keys for a fixed TTL so redelivered
/// webhooks and overlapping notifications only trigger once.
#[derive(Debug)]
pub struct CommitDedupCache {
    entries: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
    sweep_threshold: usize,
    /// Held by every trigger source across check, submit and mark.
    admission: Mutex<()>,
}

impl CommitDedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_sweep_threshold(ttl, DEFAULT_SWEEP_THRESHOLD)
    }

    pub fn with_sweep_threshold(ttl: Duration, sweep_threshold: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            sweep_threshold,
            admission: Mutex::new(()),
        }
    }

    /// Serialize an admission decision against other trigger sources.
    pub async fn admit(&self) -> MutexGuard<'_, ()> {
        self.admission.lock().await
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// True while `key` was marked less than one TTL ago.
    pub async fn is_processed(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(marked_at) if marked_at.elapsed() < self.ttl => true,
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }

    /// Mark `key` as processed now, refreshing any earlier mark.
    pub async fn mark_processed(&self, key: &str) {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), Instant::now());

        if entries.len() > self.sweep_threshold {
            let removed = purge_expired(&mut entries, self.ttl);
            debug!(removed, remaining = entries.len(), "Inline dedup sweep");
        }
    }

    /// Forget `key`. Returns whether it was present.
    pub async fn unmark(&self, key: &str) -> bool {
        self.entries.lock().await.remove(key).is_some()
    }

    /// Drop expired keys and return how many were removed.
    pub async fn cleanup(&self) -> usize {
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, self.ttl)
    }

    /// Number of keys currently held, including ones not yet swept.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.cleanup().await;
                        if removed > 0 {
                            debug!(removed, "Expired commits swept from dedup cache");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("Dedup sweeper stopped");
                        break;
                    }
                }
            }
        })
    }
}

fn purge_expired(entries: &mut HashMap<String, Instant>, ttl: Duration) -> usize {
    let before = entries.len();
    entries.retain(|_, marked_at| marked_at.elapsed() < ttl);
    before - entries.len()
}
