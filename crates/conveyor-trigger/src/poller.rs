//! Branch-head polling for jobs that are not (only) webhook driven.

use crate::dedup::CommitDedupCache;
use async_trait::async_trait;
use conveyor_core::Result;
use conveyor_core::gate::CommitGate;
use conveyor_core::job::JobRegistry;
use conveyor_core::queue::{JobMetadata, NewJob, Priority, TriggerSource};
use conveyor_core::repository::job_dedup_key;
use conveyor_scheduler::JobScheduler;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Resolves the current head commit of a remote branch.
#[async_trait]
pub trait RemoteHeads: Send + Sync {
    async fn head(&self, repository: &str, branch: &str) -> Result<String>;
}

/// Counts from one polling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSummary {
    pub checked: usize,
    pub queued: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub struct RepositoryPoller {
    registry: Arc<dyn JobRegistry>,
    scheduler: JobScheduler,
    gate: Arc<dyn CommitGate>,
    /// Shared with the webhook gateway so each job admits a commit once.
    dedup: Arc<CommitDedupCache>,
    heads: Arc<dyn RemoteHeads>,
    interval: Duration,
    /// Last head observed per job id.
    observed: Mutex<HashMap<String, String>>,
}

impl RepositoryPoller {
    pub fn new(
        registry: Arc<dyn JobRegistry>,
        scheduler: JobScheduler,
        gate: Arc<dyn CommitGate>,
        dedup: Arc<CommitDedupCache>,
        heads: Arc<dyn RemoteHeads>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            scheduler,
            gate,
            dedup,
            heads,
            interval,
            observed: Mutex::new(HashMap::new()),
        }
    }

    /// Check every polled job once.
    pub async fn poll_once(&self) -> Result<PollSummary> {
        let mut summary = PollSummary::default();

        for job in self.registry.all_jobs().await? {
            if !job.is_polled() {
                continue;
            }
            summary.checked += 1;

            let head = match self.heads.head(&job.repository, &job.branch).await {
                Ok(head) => head,
                Err(e) => {
                    warn!(job_id = %job.id, repository = %job.repository, error = %e, "Failed to resolve branch head");
                    summary.errors += 1;
                    continue;
                }
            };

            let previous = self
                .observed
                .lock()
                .await
                .insert(job.id.clone(), head.clone());

            match previous {
                None => {
                    debug!(job_id = %job.id, commit = %head, "Recorded polling baseline");
                    continue;
                }
                Some(previous) if previous == head => continue,
                Some(_) => {}
            }

            let _admission = self.dedup.admit().await;
            let job_key = job_dedup_key(&job.repository, &head, &job.id);
            if self.dedup.is_processed(&job_key).await {
                debug!(job_id = %job.id, commit = %head, "Commit already admitted for job");
                summary.skipped += 1;
                continue;
            }

            let decision = self.gate.should_build_commit(&job.id, &head).await;
            if !decision.should_build {
                debug!(job_id = %job.id, commit = %head, reason = %decision.reason, "Commit gate skipped build");
                summary.skipped += 1;
                continue;
            }

            let submission = NewJob::from_definition(&job)
                .with_priority(Priority::Medium)
                .with_metadata(JobMetadata {
                    source: TriggerSource::Polling,
                    branch: Some(job.branch.clone()),
                    commit_hash: Some(head.clone()),
                    triggered_by: Some("poller".to_string()),
                });

            match self.scheduler.add_job(submission).await {
                Ok(queue_id) => {
                    info!(job_id = %job.id, commit = %head, queue_id = %queue_id, "New commit detected by poller");
                    self.dedup.mark_processed(&job_key).await;
                    self.gate.record_build(&job.id, &head).await;
                    summary.queued += 1;
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Failed to queue polled job");
                    summary.errors += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Poll every `interval` until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval = ?self.interval, "Starting repository poller");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(summary) if summary.queued > 0 || summary.errors > 0 => {
                            info!(?summary, "Polling pass finished");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Polling pass failed"),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Repository poller stopped");
                    break;
                }
            }
        }
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::LastBuiltCommitGate;
    use crate::gateway::TriggerGateway;
    use conveyor_core::repository::GitProvider;
    use conveyor_core::Error;
    use conveyor_core::executor::{BuildResult, ExecutionContext, JobExecutor};
    use conveyor_core::job::{JobDefinition, StaticJobRegistry, TriggerMode};
    use conveyor_scheduler::{SchedulerOptions, StaticUsageMonitor};

    struct NoopExecutor;

    #[async_trait]
    impl JobExecutor for NoopExecutor {
        fn name(&self) -> &'static str {
            "noop"
        }

        async fn execute(&self, _ctx: ExecutionContext) -> Result<BuildResult> {
            Ok(BuildResult::success())
        }
    }

    /// Heads keyed by repository; missing repositories fail.
    #[derive(Default)]
    struct FakeHeads {
        heads: std::sync::Mutex<HashMap<String, String>>,
    }

    impl FakeHeads {
        fn set(&self, repository: &str, head: &str) {
            self.heads
                .lock()
                .unwrap()
                .insert(repository.to_string(), head.to_string());
        }
    }

    #[async_trait]
    impl RemoteHeads for FakeHeads {
        async fn head(&self, repository: &str, _branch: &str) -> Result<String> {
            self.heads
                .lock()
                .unwrap()
                .get(repository)
                .cloned()
                .ok_or_else(|| Error::NotFound(repository.to_string()))
        }
    }

    struct Harness {
        poller: RepositoryPoller,
        heads: Arc<FakeHeads>,
        gate: Arc<LastBuiltCommitGate>,
        dedup: Arc<CommitDedupCache>,
        registry: Arc<StaticJobRegistry>,
        scheduler: JobScheduler,
    }

    fn harness(jobs: Vec<JobDefinition>) -> Harness {
        let scheduler = JobScheduler::new(
            Arc::new(NoopExecutor),
            Arc::new(StaticUsageMonitor::new(0.0)),
            SchedulerOptions::default(),
        )
        .unwrap();
        let heads = Arc::new(FakeHeads::default());
        let gate = Arc::new(LastBuiltCommitGate::new());
        let dedup = Arc::new(CommitDedupCache::new(Duration::from_secs(300)));
        let registry = Arc::new(StaticJobRegistry::new(jobs));
        let poller = RepositoryPoller::new(
            registry.clone(),
            scheduler.clone(),
            gate.clone(),
            dedup.clone(),
            heads.clone(),
            Duration::from_secs(60),
        );
        Harness {
            poller,
            heads,
            gate,
            dedup,
            registry,
            scheduler,
        }
    }

    fn poller_with(
        jobs: Vec<JobDefinition>,
    ) -> (RepositoryPoller, Arc<FakeHeads>, Arc<LastBuiltCommitGate>, JobScheduler) {
        let h = harness(jobs);
        (h.poller, h.heads, h.gate, h.scheduler)
    }

    fn polled_job() -> JobDefinition {
        JobDefinition {
            trigger_mode: TriggerMode::Polling,
            ..JobDefinition::new("nightly", "github.com/org/api", "main")
        }
    }

    #[tokio::test]
    async fn test_first_observation_is_baseline() {
        let (poller, heads, _, scheduler) = poller_with(vec![polled_job()]);
        heads.set("github.com/org/api", "aaa");

        let summary = poller.poll_once().await.unwrap();
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.queued, 0);

        heads.set("github.com/org/api", "bbb");
        let summary = poller.poll_once().await.unwrap();
        assert_eq!(summary.queued, 1);

        let snapshot = scheduler.queue_status().await;
        assert_eq!(snapshot.pending.len(), 1);
        let entry = &snapshot.pending[0];
        assert_eq!(entry.priority, Priority::Medium);
        assert_eq!(entry.metadata.source, TriggerSource::Polling);
        assert_eq!(entry.metadata.commit_hash.as_deref(), Some("bbb"));

        // Unchanged head does nothing.
        let summary = poller.poll_once().await.unwrap();
        assert_eq!(summary.queued, 0);
    }

    #[tokio::test]
    async fn test_gate_blocks_commit_already_built_by_webhook() {
        let job = JobDefinition::new("api", "github.com/org/api", "main");
        let (poller, heads, gate, _) = poller_with(vec![job]);

        heads.set("github.com/org/api", "aaa");
        poller.poll_once().await.unwrap();

        gate.record_build("api", "bbb").await;
        heads.set("github.com/org/api", "bbb");

        let summary = poller.poll_once().await.unwrap();
        assert_eq!(summary.queued, 0);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test]
    async fn test_webhook_only_and_disabled_jobs_are_not_polled() {
        let webhook_only = JobDefinition {
            trigger_mode: TriggerMode::Webhook,
            ..JobDefinition::new("hooks", "github.com/org/api", "main")
        };
        let disabled = JobDefinition {
            enabled: false,
            ..polled_job()
        };
        let (poller, _, _, _) = poller_with(vec![webhook_only, disabled]);

        let summary = poller.poll_once().await.unwrap();
        assert_eq!(summary, PollSummary::default());
    }

    #[tokio::test]
    async fn test_lookup_failure_is_counted_and_skipped() {
        let (poller, _, _, _) = poller_with(vec![polled_job()]);
        let summary = poller.poll_once().await.unwrap();
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.errors, 1);
    }

    fn gitlab_push(after: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "ref": "refs/heads/main",
            "after": after,
            "repository": { "git_http_url": "https://github.com/org/api.git" },
            "user_username": "dev"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_webhook_then_poll_of_same_commit_queues_once() {
        let h = harness(vec![JobDefinition::new("api", "github.com/org/api", "main")]);
        let gateway = TriggerGateway::new(h.registry.clone(), h.dedup.clone(), h.scheduler.clone());
        h.scheduler.stop_processing().await;

        h.heads.set("github.com/org/api", "aaa");
        h.poller.poll_once().await.unwrap();

        let outcome = gateway
            .handle_push(GitProvider::Gitlab, &gitlab_push("bbb"), None, None)
            .await
            .unwrap();
        assert_eq!(outcome.triggered_jobs, 1);

        h.heads.set("github.com/org/api", "bbb");
        let summary = h.poller.poll_once().await.unwrap();
        assert_eq!(summary.queued, 0);
        assert_eq!(summary.skipped, 1);

        let pending = h.scheduler.queue_status().await.pending;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].metadata.source, TriggerSource::Webhook);
    }

    #[tokio::test]
    async fn test_poll_then_webhook_of_same_commit_queues_once() {
        let h = harness(vec![JobDefinition::new("api", "github.com/org/api", "main")]);
        let gateway = TriggerGateway::new(h.registry.clone(), h.dedup.clone(), h.scheduler.clone());
        h.scheduler.stop_processing().await;

        h.heads.set("github.com/org/api", "aaa");
        h.poller.poll_once().await.unwrap();
        h.heads.set("github.com/org/api", "bbb");
        assert_eq!(h.poller.poll_once().await.unwrap().queued, 1);

        let outcome = gateway
            .handle_push(GitProvider::Gitlab, &gitlab_push("bbb"), None, None)
            .await
            .unwrap();
        assert!(outcome.skipped);
        assert_eq!(outcome.reason.as_deref(), Some("duplicate"));

        let pending = h.scheduler.queue_status().await.pending;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].metadata.source, TriggerSource::Polling);
    }
}
