//! Webhook push ingestion.

use crate::dedup::CommitDedupCache;
use crate::signature::verify_push;
use conveyor_core::job::JobRegistry;
use conveyor_core::queue::{JobMetadata, NewJob, Priority, TriggerSource};
use conveyor_core::repository::{GitProvider, PushEvent, job_dedup_key};
use conveyor_core::{QueueEntryId, Result};
use conveyor_scheduler::JobScheduler;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-job result of a push submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Queued,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmission {
    pub job_id: String,
    pub status: SubmissionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_job_id: Option<QueueEntryId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate answer to a push notification.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub triggered_jobs: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<JobSubmission>,
}

impl PushOutcome {
    fn skipped(event: &PushEvent, reason: &str) -> Self {
        Self {
            success: true,
            skipped: true,
            reason: Some(reason.to_string()),
            ..Self::describing(event)
        }
    }

    fn no_action(event: &PushEvent, reason: &str) -> Self {
        Self {
            success: false,
            reason: Some(reason.to_string()),
            ..Self::describing(event)
        }
    }

    fn describing(event: &PushEvent) -> Self {
        Self {
            repository: Some(event.normalized_repository()),
            branch: Some(event.branch.clone()),
            commit: Some(event.after.clone()),
            ..Default::default()
        }
    }

    /// Short label used by the HTTP surface.
    pub fn status(&self) -> &'static str {
        if self.skipped {
            "skipped"
        } else if self.success {
            "success"
        } else {
            "no_action"
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookStats {
    /// Dedup keys held, counting commit keys and per-job admission keys.
    pub cached_commits: usize,
    pub cache_timeout_ms: u64,
}

/// Authenticates pushes, filters duplicates and queues matching jobs.
pub struct TriggerGateway {
    registry: Arc<dyn JobRegistry>,
    dedup: Arc<CommitDedupCache>,
    scheduler: JobScheduler,
}

impl TriggerGateway {
    pub fn new(
        registry: Arc<dyn JobRegistry>,
        dedup: Arc<CommitDedupCache>,
        scheduler: JobScheduler,
    ) -> Self {
        Self {
            registry,
            dedup,
            scheduler,
        }
    }

    pub fn dedup(&self) -> &Arc<CommitDedupCache> {
        &self.dedup
    }

    pub async fn stats(&self) -> WebhookStats {
        WebhookStats {
            cached_commits: self.dedup.len().await,
            cache_timeout_ms: self.dedup.ttl().as_millis() as u64,
        }
    }

    /// Handle one push notification.
    ///
    /// Returns `Error::Authentication` when the signature check fails and
    /// `Error::Validation` for unparseable payloads. Everything else is
    /// reported through the outcome.
    pub async fn handle_push(
        &self,
        provider: GitProvider,
        raw: &[u8],
        signature: Option<&str>,
        secret: Option<&str>,
    ) -> Result<PushOutcome> {
        if let Err(e) = verify_push(provider, raw, signature, secret) {
            warn!(provider = %provider, error = %e, "Webhook authentication failed");
            return Err(e);
        }
        if secret.is_none() {
            debug!(provider = %provider, "No webhook secret configured, accepting unsigned push");
        }

        let event = PushEvent::parse(provider, raw)?;
        let repository = event.normalized_repository();
        let key = event.dedup_key();

        info!(
            provider = %provider,
            repository = %repository,
            branch = %event.branch,
            commit = %event.after,
            actor = %event.actor,
            commits = event.commits.len(),
            "Received push event"
        );

        if event.is_branch_deletion() {
            info!(repository = %repository, branch = %event.branch, "Branch deleted, nothing to build");
            return Ok(PushOutcome::skipped(&event, "branch_deleted"));
        }

        // Held until the submissions settle, so a redelivery never observes
        // a mark that is about to be rolled back.
        let _admission = self.dedup.admit().await;

        if self.dedup.is_processed(&key).await {
            info!(key = %key, "Duplicate push ignored");
            return Ok(PushOutcome::skipped(&event, "duplicate"));
        }

        let mut matched = Vec::new();
        let mut already_admitted = 0;
        for job in self.registry.all_jobs().await? {
            if !job.matches_push(&repository, &event.branch) {
                continue;
            }
            let job_key = job_dedup_key(&repository, &event.after, &job.id);
            if self.dedup.is_processed(&job_key).await {
                debug!(job_id = %job.id, commit = %event.after, "Commit already admitted for job");
                already_admitted += 1;
                continue;
            }
            matched.push(job);
        }

        if matched.is_empty() {
            if already_admitted > 0 {
                self.dedup.mark_processed(&key).await;
                info!(key = %key, "Every matching job already admitted this commit");
                return Ok(PushOutcome::skipped(&event, "duplicate"));
            }
            info!(repository = %repository, branch = %event.branch, "No jobs match push");
            return Ok(PushOutcome::no_action(&event, "no_matching_jobs"));
        }

        self.dedup.mark_processed(&key).await;

        let mut results = Vec::with_capacity(matched.len());
        for job in &matched {
            let submission = NewJob::from_definition(job)
                .with_priority(Priority::High)
                .with_metadata(JobMetadata {
                    source: TriggerSource::Webhook,
                    branch: Some(event.branch.clone()),
                    commit_hash: Some(event.after.clone()),
                    triggered_by: Some(event.actor.clone()),
                });

            match self.scheduler.add_job(submission).await {
                Ok(queue_id) => {
                    info!(job_id = %job.id, queue_id = %queue_id, "Job triggered by push");
                    self.dedup
                        .mark_processed(&job_dedup_key(&repository, &event.after, &job.id))
                        .await;
                    results.push(JobSubmission {
                        job_id: job.id.clone(),
                        status: SubmissionStatus::Queued,
                        queue_job_id: Some(queue_id),
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Failed to queue job for push");
                    results.push(JobSubmission {
                        job_id: job.id.clone(),
                        status: SubmissionStatus::Failed,
                        queue_job_id: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let triggered = results
            .iter()
            .filter(|r| r.status == SubmissionStatus::Queued)
            .count();

        if triggered == 0 {
            self.dedup.unmark(&key).await;
            warn!(key = %key, "All submissions failed, commit released");
            return Ok(PushOutcome {
                results,
                ..PushOutcome::no_action(&event, "submission_failed")
            });
        }

        Ok(PushOutcome {
            success: true,
            triggered_jobs: triggered,
            results,
            ..PushOutcome::describing(&event)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::compute_hmac_sha256;
    use async_trait::async_trait;
    use conveyor_core::Error;
    use conveyor_core::executor::{BuildResult, ExecutionContext, JobExecutor};
    use conveyor_core::job::{JobDefinition, StaticJobRegistry, TriggerMode};
    use conveyor_core::queue::QueueStatus;
    use conveyor_scheduler::{SchedulerOptions, StaticUsageMonitor};
    use serde_json::json;
    use std::time::Duration;

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

    fn gateway_with(jobs: Vec<JobDefinition>, ttl: Duration) -> (TriggerGateway, JobScheduler) {
        let scheduler = JobScheduler::new(
            Arc::new(NoopExecutor),
            Arc::new(StaticUsageMonitor::new(0.0)),
            SchedulerOptions::default(),
        )
        .unwrap();
        let gateway = TriggerGateway::new(
            Arc::new(StaticJobRegistry::new(jobs)),
            Arc::new(CommitDedupCache::new(ttl)),
            scheduler.clone(),
        );
        (gateway, scheduler)
    }

    fn api_job() -> JobDefinition {
        JobDefinition::new("api", "https://github.com/Org/Api.git", "main")
    }

    fn github_push(after: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "ref": "refs/heads/main",
            "after": after,
            "repository": { "clone_url": "https://github.com/org/api.git" },
            "pusher": { "name": "octocat" },
            "commits": [{ "id": after, "message": "fix", "author": { "name": "Octo" } }]
        }))
        .unwrap()
    }

    fn gitlab_push(after: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "ref": "refs/heads/main",
            "after": after,
            "repository": { "git_http_url": "https://github.com/org/api.git" },
            "user_username": "dev"
        }))
        .unwrap()
    }

    fn sign(body: &[u8]) -> String {
        format!("sha256={}", compute_hmac_sha256(b"secret", body))
    }

    #[tokio::test]
    async fn test_push_queues_matching_job_with_webhook_metadata() {
        let (gateway, scheduler) = gateway_with(vec![api_job()], Duration::from_secs(300));
        let body = github_push("abc123");

        let outcome = gateway
            .handle_push(GitProvider::Github, &body, Some(&sign(&body)), Some("secret"))
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.status(), "success");
        assert_eq!(outcome.triggered_jobs, 1);
        let queue_id = outcome.results[0].queue_job_id.unwrap();

        let entry = scheduler.get_job(&queue_id).await.unwrap();
        assert_eq!(entry.status, QueueStatus::Queued);
        assert_eq!(entry.priority, Priority::High);
        assert_eq!(entry.metadata.source, TriggerSource::Webhook);
        assert_eq!(entry.metadata.commit_hash.as_deref(), Some("abc123"));
        assert_eq!(entry.metadata.triggered_by.as_deref(), Some("octocat"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_within_ttl_then_accepted_after() {
        let (gateway, scheduler) = gateway_with(vec![api_job()], Duration::from_secs(300));
        let body = gitlab_push("abc123");

        let first = gateway
            .handle_push(GitProvider::Gitlab, &body, None, None)
            .await
            .unwrap();
        assert_eq!(first.triggered_jobs, 1);

        let second = gateway
            .handle_push(GitProvider::Gitlab, &body, None, None)
            .await
            .unwrap();
        assert!(second.success);
        assert!(second.skipped);
        assert_eq!(second.reason.as_deref(), Some("duplicate"));
        assert_eq!(scheduler.stats().await.queued, 1);

        tokio::time::advance(Duration::from_secs(301)).await;

        let third = gateway
            .handle_push(GitProvider::Gitlab, &body, None, None)
            .await
            .unwrap();
        assert!(!third.skipped);
        assert_eq!(third.triggered_jobs, 1);
        assert_eq!(scheduler.stats().await.queued, 2);
    }

    #[tokio::test]
    async fn test_same_commit_from_both_providers_is_deduplicated() {
        let (gateway, _) = gateway_with(vec![api_job()], Duration::from_secs(300));

        gateway
            .handle_push(GitProvider::Gitlab, &gitlab_push("abc"), None, None)
            .await
            .unwrap();

        let body = github_push("abc");
        let outcome = gateway
            .handle_push(GitProvider::Github, &body, Some(&sign(&body)), Some("secret"))
            .await
            .unwrap();
        assert_eq!(outcome.reason.as_deref(), Some("duplicate"));
    }

    #[tokio::test]
    async fn test_concurrent_identical_pushes_admit_once() {
        let (gateway, scheduler) = gateway_with(vec![api_job()], Duration::from_secs(300));
        let gateway = Arc::new(gateway);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    gateway
                        .handle_push(GitProvider::Gitlab, &gitlab_push("abc"), None, None)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            admitted += handle.await.unwrap().triggered_jobs;
        }
        assert_eq!(admitted, 1);
        assert_eq!(scheduler.stats().await.queued, 1);
    }

    #[tokio::test]
    async fn test_push_skips_jobs_already_admitted_for_commit() {
        let docs = JobDefinition::new("docs", "github.com/org/api", "main");
        let (gateway, scheduler) = gateway_with(vec![api_job(), docs], Duration::from_secs(300));
        gateway
            .dedup()
            .mark_processed(&job_dedup_key("github.com/org/api", "abc", "api"))
            .await;

        let outcome = gateway
            .handle_push(GitProvider::Gitlab, &gitlab_push("abc"), None, None)
            .await
            .unwrap();
        assert_eq!(outcome.triggered_jobs, 1);
        assert_eq!(outcome.results[0].job_id, "docs");
        assert_eq!(scheduler.stats().await.queued, 1);
    }

    #[tokio::test]
    async fn test_push_is_duplicate_when_every_job_already_admitted() {
        let (gateway, scheduler) = gateway_with(vec![api_job()], Duration::from_secs(300));
        gateway
            .dedup()
            .mark_processed(&job_dedup_key("github.com/org/api", "abc", "api"))
            .await;

        let outcome = gateway
            .handle_push(GitProvider::Gitlab, &gitlab_push("abc"), None, None)
            .await
            .unwrap();
        assert!(outcome.skipped);
        assert_eq!(outcome.reason.as_deref(), Some("duplicate"));
        assert_eq!(scheduler.stats().await.queued, 0);
    }

    #[tokio::test]
    async fn test_redelivery_waits_for_rollback() {
        let broken = JobDefinition::new(" ", "github.com/org/api", "main");
        let (gateway, _) = gateway_with(vec![broken], Duration::from_secs(300));
        let gateway = Arc::new(gateway);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    gateway
                        .handle_push(GitProvider::Gitlab, &gitlab_push("abc"), None, None)
                        .await
                        .unwrap()
                })
            })
            .collect();

        // No delivery may be swallowed as a duplicate of a mark that was
        // released.
        for handle in handles {
            let outcome = handle.await.unwrap();
            assert_eq!(outcome.reason.as_deref(), Some("submission_failed"));
        }
        assert_eq!(gateway.stats().await.cached_commits, 0);
    }

    #[tokio::test]
    async fn test_authentication_failures() {
        let (gateway, _) = gateway_with(vec![api_job()], Duration::from_secs(300));
        let body = github_push("abc");

        let result = gateway
            .handle_push(GitProvider::Github, &body, Some("sha256=deadbeef"), Some("secret"))
            .await;
        assert!(matches!(result, Err(Error::Authentication(_))));

        let result = gateway
            .handle_push(GitProvider::Github, &body, Some(&sign(&body)), None)
            .await;
        assert!(matches!(result, Err(Error::Authentication(_))));

        let result = gateway
            .handle_push(GitProvider::Gitlab, &gitlab_push("abc"), None, Some("token"))
            .await;
        assert!(matches!(result, Err(Error::Authentication(_))));

        // Rejected pushes never reach the dedup cache.
        assert_eq!(gateway.stats().await.cached_commits, 0);
    }

    #[tokio::test]
    async fn test_invalid_payload_is_validation_error() {
        let (gateway, _) = gateway_with(vec![api_job()], Duration::from_secs(300));
        let result = gateway
            .handle_push(GitProvider::Gitlab, b"not json", None, None)
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_no_matching_jobs_does_not_mark() {
        let polling_only = JobDefinition {
            trigger_mode: TriggerMode::Polling,
            ..api_job()
        };
        let other_branch = JobDefinition::new("api-dev", "github.com/org/api", "develop");
        let (gateway, _) = gateway_with(vec![polling_only, other_branch], Duration::from_secs(300));

        let outcome = gateway
            .handle_push(GitProvider::Gitlab, &gitlab_push("abc"), None, None)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.status(), "no_action");
        assert_eq!(outcome.reason.as_deref(), Some("no_matching_jobs"));
        assert_eq!(gateway.stats().await.cached_commits, 0);
    }

    #[tokio::test]
    async fn test_branch_deletion_is_skipped() {
        let (gateway, scheduler) = gateway_with(vec![api_job()], Duration::from_secs(300));
        let outcome = gateway
            .handle_push(GitProvider::Gitlab, &gitlab_push(&"0".repeat(40)), None, None)
            .await
            .unwrap();
        assert!(outcome.skipped);
        assert_eq!(outcome.reason.as_deref(), Some("branch_deleted"));
        assert_eq!(scheduler.stats().await.queued, 0);
    }

    #[tokio::test]
    async fn test_partial_submission_failure() {
        let broken = JobDefinition::new(" ", "github.com/org/api", "main");
        let (gateway, _) = gateway_with(vec![api_job(), broken], Duration::from_secs(300));

        let outcome = gateway
            .handle_push(GitProvider::Gitlab, &gitlab_push("abc"), None, None)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.triggered_jobs, 1);
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[1].status, SubmissionStatus::Failed);
        assert!(outcome.results[1].error.is_some());
    }

    #[tokio::test]
    async fn test_total_submission_failure_releases_commit() {
        let broken = JobDefinition::new(" ", "github.com/org/api", "main");
        let (gateway, _) = gateway_with(vec![broken], Duration::from_secs(300));

        let outcome = gateway
            .handle_push(GitProvider::Gitlab, &gitlab_push("abc"), None, None)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.reason.as_deref(), Some("submission_failed"));
        assert_eq!(gateway.stats().await.cached_commits, 0);
    }

    #[tokio::test]
    async fn test_stats_report_ttl() {
        let (gateway, _) = gateway_with(vec![], Duration::from_secs(300));
        let stats = gateway.stats().await;
        assert_eq!(stats.cache_timeout_ms, 300_000);
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["cachedCommits"], 0);
    }
}
