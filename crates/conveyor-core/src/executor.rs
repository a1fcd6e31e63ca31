//! Executor trait and execution context.
//!
//! Executors perform the actual build for a queue entry. The scheduler only
//! decides when they run and what happens with their outcome.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::queue::QueueEntry;

/// Outcome reported by an executor that ran to completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub success: bool,
    pub message: Option<String>,
}

impl BuildResult {
    pub fn success() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// Shared progress counter, clamped to 0..=100.
#[derive(Debug, Clone, Default)]
pub struct ProgressHandle(Arc<AtomicU8>);

impl ProgressHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, percent: u8) {
        self.0.store(percent.min(100), Ordering::Relaxed);
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Everything an executor receives for one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Snapshot of the entry at dispatch time.
    pub entry: QueueEntry,
    /// Triggered when the entry is cancelled while running. Honoring it is
    /// up to the executor.
    pub cancellation: CancellationToken,
    pub progress: ProgressHandle,
}

/// Trait for build executors.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Run one attempt of a queue entry.
    ///
    /// An `Err` and an `Ok` result with `success == false` are both treated
    /// as a failed attempt.
    async fn execute(&self, ctx: ExecutionContext) -> Result<BuildResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_is_clamped_and_shared() {
        let progress = ProgressHandle::new();
        let clone = progress.clone();
        clone.set(250);
        assert_eq!(progress.get(), 100);
        clone.set(40);
        assert_eq!(progress.get(), 40);
    }
}
