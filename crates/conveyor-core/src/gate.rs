//! Commit gate used by callers that decide whether a commit needs a build.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub should_build: bool,
    pub reason: String,
}

impl GateDecision {
    pub fn build(reason: impl Into<String>) -> Self {
        Self {
            should_build: true,
            reason: reason.into(),
        }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            should_build: false,
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait CommitGate: Send + Sync {
    async fn should_build_commit(&self, job_id: &str, commit: &str) -> GateDecision;

    /// Record that `commit` was started for `job_id`.
    async fn record_build(&self, job_id: &str, commit: &str);
}
