//! Job definitions and the registry that serves them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::repository::normalize_repo_url;
use crate::{Error, Result};

/// Which ingestion paths may admit work for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    Polling,
    Webhook,
    #[default]
    Hybrid,
}

impl TriggerMode {
    pub fn accepts_webhook(self) -> bool {
        !matches!(self, TriggerMode::Polling)
    }

    pub fn accepts_polling(self) -> bool {
        !matches!(self, TriggerMode::Webhook)
    }
}

impl std::fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerMode::Polling => write!(f, "polling"),
            TriggerMode::Webhook => write!(f, "webhook"),
            TriggerMode::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl std::str::FromStr for TriggerMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "polling" => Ok(TriggerMode::Polling),
            "webhook" => Ok(TriggerMode::Webhook),
            "hybrid" => Ok(TriggerMode::Hybrid),
            _ => Err(format!("Unknown trigger mode: {}", s)),
        }
    }
}

/// A configured build job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub repository: String,
    pub branch: String,
    pub trigger_mode: TriggerMode,
    /// Shell command run by the shell executor.
    pub command: Option<String>,
    pub max_retries: u32,
    /// Advisory duration in seconds.
    pub estimated_time: u64,
}

impl JobDefinition {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_ESTIMATED_TIME: u64 = 300;

    pub fn new(
        id: impl Into<String>,
        repository: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            repository: repository.into(),
            branch: branch.into(),
            trigger_mode: TriggerMode::default(),
            command: None,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            estimated_time: Self::DEFAULT_ESTIMATED_TIME,
        }
    }

    /// Whether a webhook push for `repository` (already normalized) on
    /// `branch` should admit this job.
    pub fn matches_push(&self, repository: &str, branch: &str) -> bool {
        self.enabled
            && self.trigger_mode.accepts_webhook()
            && normalize_repo_url(&self.repository) == repository
            && self.branch == branch
    }

    /// Whether the repository poller should watch this job.
    pub fn is_polled(&self) -> bool {
        self.enabled && self.trigger_mode.accepts_polling()
    }
}

/// Read-only source of job definitions.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    async fn all_jobs(&self) -> Result<Vec<JobDefinition>>;

    async fn get_job(&self, id: &str) -> Result<JobDefinition> {
        self.all_jobs()
            .await?
            .into_iter()
            .find(|job| job.id == id)
            .ok_or_else(|| Error::NotFound(format!("job {}", id)))
    }
}

/// Registry over a fixed list of definitions, typically loaded from config.
#[derive(Debug, Clone, Default)]
pub struct StaticJobRegistry {
    jobs: Vec<JobDefinition>,
}

impl StaticJobRegistry {
    pub fn new(jobs: Vec<JobDefinition>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl JobRegistry for StaticJobRegistry {
    async fn all_jobs(&self) -> Result<Vec<JobDefinition>> {
        Ok(self.jobs.clone())
    }
}
