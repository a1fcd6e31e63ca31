//! System configuration parsing.

use crate::{ConfigError, ConfigResult};
use conveyor_core::job::{JobDefinition, TriggerMode};
use conveyor_core::queue::QueueConfig;
use kdl::{KdlDocument, KdlNode, KdlValue};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const GITLAB_SECRET_ENV: &str = "CONVEYOR_GITLAB_SECRET";
pub const GITHUB_SECRET_ENV: &str = "CONVEYOR_GITHUB_SECRET";

/// System-wide configuration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemConfig {
    pub server: ServerSettings,
    pub scheduler: SchedulerSettings,
    pub webhook: WebhookSettings,
    pub poller: PollerSettings,
    pub jobs: Vec<JobDefinition>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerSettings {
    pub listen: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSettings {
    pub max_concurrent_jobs: usize,
    pub resource_threshold: f64,
    /// Period of the safety-net dispatch tick.
    pub tick_interval: Duration,
    /// Terminal entries kept for inspection.
    pub history_limit: usize,
    /// Start dispatching as soon as the server is up.
    pub autostart: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        let queue = QueueConfig::default();
        Self {
            max_concurrent_jobs: queue.max_concurrent_jobs,
            resource_threshold: queue.resource_threshold,
            tick_interval: Duration::from_secs(5),
            history_limit: 100,
            autostart: true,
        }
    }
}

impl SchedulerSettings {
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_concurrent_jobs: self.max_concurrent_jobs,
            resource_threshold: self.resource_threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookSettings {
    pub dedup_ttl: Duration,
    /// Answer authentication failures with 401 instead of a `no_action` body.
    pub legacy_unauthorized: bool,
    #[serde(skip)]
    pub gitlab_secret: Option<String>,
    #[serde(skip)]
    pub github_secret: Option<String>,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            dedup_ttl: Duration::from_secs(300),
            legacy_unauthorized: false,
            gitlab_secret: None,
            github_secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PollerSettings {
    pub enabled: bool,
    pub interval: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
        }
    }
}

impl SystemConfig {
    /// Load configuration from a KDL file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        parse_system_config(&content)
    }

    /// Overlay secrets from the environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Overlay secrets using an arbitrary lookup function.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(secret) = lookup(GITLAB_SECRET_ENV).filter(|s| !s.is_empty()) {
            self.webhook.gitlab_secret = Some(secret);
        }
        if let Some(secret) = lookup(GITHUB_SECRET_ENV).filter(|s| !s.is_empty()) {
            self.webhook.github_secret = Some(secret);
        }
        self
    }
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();
    let mut job_ids = HashSet::new();

    for node in doc.nodes() {
        match node.name().value() {
            "server" => {
                if let Some(listen) = get_string_setting(node, "listen") {
                    config.server.listen = listen;
                }
            }
            "scheduler" => parse_scheduler(node, &mut config.scheduler)?,
            "webhook" => parse_webhook(node, &mut config.webhook)?,
            "poller" => parse_poller(node, &mut config.poller)?,
            "job" => {
                let job = parse_job(node)?;
                if !job_ids.insert(job.id.clone()) {
                    return Err(ConfigError::DuplicateJob(job.id));
                }
                config.jobs.push(job);
            }
            other => debug!(node = %other, "Ignoring unknown configuration node"),
        }
    }

    Ok(config)
}

fn parse_scheduler(node: &KdlNode, settings: &mut SchedulerSettings) -> ConfigResult<()> {
    if let Some(max) = get_u64_setting(node, "max-concurrent-jobs")? {
        settings.max_concurrent_jobs = max as usize;
    }
    if let Some(threshold) = get_f64_setting(node, "resource-threshold")? {
        settings.resource_threshold = threshold;
    }
    if let Some(ms) = get_u64_setting(node, "tick-interval-ms")? {
        settings.tick_interval = Duration::from_millis(ms.max(1));
    }
    if let Some(limit) = get_u64_setting(node, "history-limit")? {
        settings.history_limit = limit as usize;
    }
    if let Some(autostart) = get_bool_setting(node, "autostart") {
        settings.autostart = autostart;
    }

    settings
        .queue_config()
        .validate()
        .map_err(|e| ConfigError::InvalidValue {
            field: "scheduler".to_string(),
            message: e.to_string(),
        })
}

fn parse_webhook(node: &KdlNode, settings: &mut WebhookSettings) -> ConfigResult<()> {
    if let Some(secs) = get_u64_setting(node, "dedup-ttl-secs")? {
        if secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "dedup-ttl-secs".to_string(),
                message: "must be positive".to_string(),
            });
        }
        settings.dedup_ttl = Duration::from_secs(secs);
    }
    if let Some(legacy) = get_bool_setting(node, "legacy-unauthorized") {
        settings.legacy_unauthorized = legacy;
    }
    settings.gitlab_secret = get_string_setting(node, "gitlab-secret").filter(|s| !s.is_empty());
    settings.github_secret = get_string_setting(node, "github-secret").filter(|s| !s.is_empty());
    Ok(())
}

fn parse_poller(node: &KdlNode, settings: &mut PollerSettings) -> ConfigResult<()> {
    if let Some(enabled) = get_bool_setting(node, "enabled") {
        settings.enabled = enabled;
    }
    if let Some(secs) = get_u64_setting(node, "interval-secs")? {
        settings.interval = Duration::from_secs(secs.max(1));
    }
    Ok(())
}

fn parse_job(node: &KdlNode) -> ConfigResult<JobDefinition> {
    let id = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("job id".to_string()))?;
    let repository = get_string_setting(node, "repository")
        .ok_or_else(|| ConfigError::MissingField(format!("job '{}' repository", id)))?;
    let branch = get_string_setting(node, "branch").unwrap_or_else(|| "main".to_string());

    let mut job = JobDefinition::new(id, repository, branch);

    if let Some(name) = get_string_setting(node, "name") {
        job.name = name;
    }
    if let Some(enabled) = get_bool_setting(node, "enabled") {
        job.enabled = enabled;
    }
    if let Some(trigger) = get_string_setting(node, "trigger") {
        job.trigger_mode =
            trigger
                .parse::<TriggerMode>()
                .map_err(|message| ConfigError::InvalidValue {
                    field: format!("job '{}' trigger", job.id),
                    message,
                })?;
    }
    job.command = get_string_setting(node, "command");
    if let Some(retries) = get_u64_setting(node, "max-retries")? {
        job.max_retries = retries as u32;
    }
    if let Some(estimate) = get_u64_setting(node, "estimated-time")? {
        job.estimated_time = estimate;
    }

    Ok(job)
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

/// A setting is either a property on the node (`name=value`) or a child node
/// whose first argument is the value (`name value`).
fn get_setting<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlValue> {
    if let Some(value) = node.get(name) {
        return Some(value);
    }

    node.children()?
        .nodes()
        .iter()
        .find(|child| child.name().value() == name)
        .and_then(|child| child.entries().iter().find(|e| e.name().is_none()))
        .map(|entry| entry.value())
}

fn get_string_setting(node: &KdlNode, name: &str) -> Option<String> {
    get_setting(node, name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_setting(node: &KdlNode, name: &str) -> Option<bool> {
    get_setting(node, name).and_then(|v| v.as_bool())
}

fn get_u64_setting(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    let Some(value) = get_setting(node, name) else {
        return Ok(None);
    };

    value
        .as_integer()
        .and_then(|i| u64::try_from(i).ok())
        .map(Some)
        .ok_or_else(|| ConfigError::InvalidValue {
            field: name.to_string(),
            message: format!("expected a non-negative integer, got {}", value),
        })
}

fn get_f64_setting(node: &KdlNode, name: &str) -> ConfigResult<Option<f64>> {
    let Some(value) = get_setting(node, name) else {
        return Ok(None);
    };

    value
        .as_float()
        .or_else(|| value.as_integer().map(|i| i as f64))
        .map(Some)
        .ok_or_else(|| ConfigError::InvalidValue {
            field: name.to_string(),
            message: format!("expected a number, got {}", value),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_system_config("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:3000");
        assert_eq!(config.scheduler.max_concurrent_jobs, 2);
        assert_eq!(config.scheduler.resource_threshold, 80.0);
        assert_eq!(config.webhook.dedup_ttl, Duration::from_secs(300));
        assert!(!config.webhook.legacy_unauthorized);
        assert!(config.jobs.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            server listen="127.0.0.1:8080"
            scheduler max-concurrent-jobs=4 resource-threshold=90 tick-interval-ms=250 autostart=#false
            webhook dedup-ttl-secs=60 legacy-unauthorized=#true github-secret="s3cret"
            poller enabled=#false interval-secs=30

            job "api" repository="https://github.com/org/api.git" trigger="webhook" {
                command "make deploy"
                max-retries 1
                estimated-time 120
            }

            job "docs" repository="https://gitlab.com/org/docs" branch="develop" enabled=#false
        "#;

        let config = parse_system_config(kdl).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert_eq!(config.scheduler.max_concurrent_jobs, 4);
        assert_eq!(config.scheduler.resource_threshold, 90.0);
        assert_eq!(config.scheduler.tick_interval, Duration::from_millis(250));
        assert!(!config.scheduler.autostart);
        assert_eq!(config.webhook.dedup_ttl, Duration::from_secs(60));
        assert!(config.webhook.legacy_unauthorized);
        assert_eq!(config.webhook.github_secret.as_deref(), Some("s3cret"));
        assert!(config.webhook.gitlab_secret.is_none());
        assert!(!config.poller.enabled);

        assert_eq!(config.jobs.len(), 2);
        let api = &config.jobs[0];
        assert_eq!(api.id, "api");
        assert_eq!(api.branch, "main");
        assert_eq!(api.trigger_mode, TriggerMode::Webhook);
        assert_eq!(api.command.as_deref(), Some("make deploy"));
        assert_eq!(api.max_retries, 1);
        assert_eq!(api.estimated_time, 120);

        let docs = &config.jobs[1];
        assert_eq!(docs.branch, "develop");
        assert!(!docs.enabled);
        assert_eq!(docs.trigger_mode, TriggerMode::Hybrid);
    }

    #[test]
    fn test_block_syntax_settings() {
        let kdl = r#"
            scheduler {
                max-concurrent-jobs 3
                resource-threshold 75.5
            }
        "#;

        let config = parse_system_config(kdl).unwrap();
        assert_eq!(config.scheduler.max_concurrent_jobs, 3);
        assert_eq!(config.scheduler.resource_threshold, 75.5);
    }

    #[test]
    fn test_rejects_invalid_scheduler_limits() {
        let result = parse_system_config("scheduler max-concurrent-jobs=0");
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));

        let result = parse_system_config("scheduler resource-threshold=\"high\"");
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_job_requires_repository() {
        let result = parse_system_config(r#"job "api" branch="main""#);
        assert!(matches!(result.unwrap_err(), ConfigError::MissingField(_)));
    }

    #[test]
    fn test_duplicate_jobs_rejected() {
        let kdl = r#"
            job "api" repository="github.com/org/api"
            job "api" repository="github.com/org/api"
        "#;
        assert!(matches!(
            parse_system_config(kdl).unwrap_err(),
            ConfigError::DuplicateJob(_)
        ));
    }

    #[test]
    fn test_unknown_trigger_mode() {
        let result = parse_system_config(r#"job "api" repository="x/y" trigger="cron""#);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_env_overrides_secrets() {
        let config = parse_system_config(r#"webhook github-secret="from-file""#)
            .unwrap()
            .with_overrides(|key| match key {
                GITHUB_SECRET_ENV => Some("from-env".to_string()),
                GITLAB_SECRET_ENV => Some(String::new()),
                _ => None,
            });
        assert_eq!(config.webhook.github_secret.as_deref(), Some("from-env"));
        assert!(config.webhook.gitlab_secret.is_none());
    }

    #[test]
    fn test_sample_config_parses() {
        let config = parse_system_config(include_str!("../../../conveyor.kdl")).unwrap();
        assert_eq!(config.jobs.len(), 3);

        let api = &config.jobs[0];
        assert_eq!(api.name, "API service");
        assert_eq!(api.max_retries, 2);
        assert!(api.matches_push("github.com/example/api", "main"));

        let docs = &config.jobs[1];
        assert!(docs.matches_push("gitlab.com/example/docs", "main"));
        assert!(!docs.is_polled());

        let nightly = &config.jobs[2];
        assert_eq!(nightly.trigger_mode, TriggerMode::Polling);
        assert_eq!(nightly.max_retries, 0);
    }

    #[test]
    fn test_load_reports_path() {
        let err = SystemConfig::load("/nonexistent/conveyor.kdl").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/conveyor.kdl"));
    }
}
