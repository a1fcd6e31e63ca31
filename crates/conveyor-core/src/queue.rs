//! Queue entry types shared by the scheduler, the trigger gateway and the API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobDefinition;
use crate::{Error, QueueEntryId, Result};

/// Dispatch priority. Higher tiers are always popped first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// Lifecycle state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl QueueStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Success | QueueStatus::Failed | QueueStatus::Cancelled
        )
    }
}

/// Ingestion path that produced a queue entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Webhook,
    Polling,
    #[default]
    Manual,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    pub source: TriggerSource,
    pub branch: Option<String>,
    pub commit_hash: Option<String>,
    pub triggered_by: Option<String>,
}

/// Submission accepted by `add_job`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: String,
    pub name: String,
    pub priority: Priority,
    pub estimated_time: u64,
    pub max_retries: u32,
    pub metadata: JobMetadata,
}

impl NewJob {
    pub fn new(job_id: impl Into<String>) -> Self {
        let job_id = job_id.into();
        Self {
            name: job_id.clone(),
            job_id,
            priority: Priority::default(),
            estimated_time: JobDefinition::DEFAULT_ESTIMATED_TIME,
            max_retries: JobDefinition::DEFAULT_MAX_RETRIES,
            metadata: JobMetadata::default(),
        }
    }

    /// Submission carrying a definition's name and retry/estimate settings.
    pub fn from_definition(job: &JobDefinition) -> Self {
        Self {
            job_id: job.id.clone(),
            name: job.name.clone(),
            priority: Priority::default(),
            estimated_time: job.estimated_time,
            max_retries: job.max_retries,
            metadata: JobMetadata::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_metadata(mut self, metadata: JobMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A unit of work tracked by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: QueueEntryId,
    pub job_id: String,
    pub name: String,
    pub priority: Priority,
    pub estimated_time: u64,
    pub max_retries: u32,
    pub retry_count: u32,
    pub status: QueueStatus,
    pub progress: u8,
    pub metadata: JobMetadata,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    /// Admit a submission, assigning a fresh id.
    pub fn admit(job: NewJob) -> Result<Self> {
        if job.job_id.trim().is_empty() {
            return Err(Error::Validation("jobId is required".to_string()));
        }

        Ok(Self {
            id: QueueEntryId::new(),
            job_id: job.job_id,
            name: job.name,
            priority: job.priority,
            estimated_time: job.estimated_time,
            max_retries: job.max_retries,
            retry_count: 0,
            status: QueueStatus::Queued,
            progress: 0,
            metadata: job.metadata,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        })
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Live scheduler limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    pub max_concurrent_jobs: usize,
    /// Usage percent at or above which dispatch is deferred.
    pub resource_threshold: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            resource_threshold: 80.0,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(Error::Config(
                "maxConcurrentJobs must be at least 1".to_string(),
            ));
        }
        if !(self.resource_threshold > 0.0 && self.resource_threshold <= 100.0) {
            return Err(Error::Config(format!(
                "resourceThreshold must be in (0, 100], got {}",
                self.resource_threshold
            )));
        }
        Ok(())
    }

    /// Apply a partial update, validating the merged result.
    pub fn apply(&self, update: &ConfigUpdate) -> Result<Self> {
        let merged = Self {
            max_concurrent_jobs: update
                .max_concurrent_jobs
                .unwrap_or(self.max_concurrent_jobs),
            resource_threshold: update.resource_threshold.unwrap_or(self.resource_threshold),
        };
        merged.validate()?;
        Ok(merged)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    pub max_concurrent_jobs: Option<usize>,
    pub resource_threshold: Option<f64>,
}
