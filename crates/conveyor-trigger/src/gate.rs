//! In-memory commit gate keyed by job.

use async_trait::async_trait;
use conveyor_core::gate::{CommitGate, GateDecision};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Builds a commit unless it is the last one started for the same job.
#[derive(Debug, Default)]
pub struct LastBuiltCommitGate {
    last_built: Mutex<HashMap<String, String>>,
}

impl LastBuiltCommitGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn last_built(&self, job_id: &str) -> Option<String> {
        self.last_built.lock().await.get(job_id).cloned()
    }
}

#[async_trait]
impl CommitGate for LastBuiltCommitGate {
    async fn should_build_commit(&self, job_id: &str, commit: &str) -> GateDecision {
        match self.last_built.lock().await.get(job_id) {
            Some(last) if last == commit => GateDecision::skip("already_built"),
            Some(_) => GateDecision::build("new_commit"),
            None => GateDecision::build("first_build"),
        }
    }

    async fn record_build(&self, job_id: &str, commit: &str) {
        self.last_built
            .lock()
            .await
            .insert(job_id.to_string(), commit.to_string());
    }
}
