//! Application state.

use crate::services::shell::ShellExecutor;
use conveyor_config::{SystemConfig, WebhookSettings};
use conveyor_core::Result;
use conveyor_core::executor::JobExecutor;
use conveyor_core::job::{JobRegistry, StaticJobRegistry};
use conveyor_core::resources::ResourceMonitor;
use conveyor_scheduler::{JobScheduler, LoadAverageMonitor, SchedulerOptions};
use conveyor_trigger::{CommitDedupCache, LastBuiltCommitGate, TriggerGateway};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<dyn JobRegistry>,
    pub scheduler: JobScheduler,
    pub gateway: Arc<TriggerGateway>,
    pub gate: Arc<LastBuiltCommitGate>,
    pub webhook: Arc<WebhookSettings>,
}

impl AppState {
    /// State backed by the shell executor and the host load average.
    pub fn from_config(config: &SystemConfig) -> Result<Self> {
        Self::with_components(
            config,
            Arc::new(ShellExecutor::from_jobs(&config.jobs)),
            Arc::new(LoadAverageMonitor::new()),
        )
    }

    pub fn with_components(
        config: &SystemConfig,
        executor: Arc<dyn JobExecutor>,
        monitor: Arc<dyn ResourceMonitor>,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new(
            executor,
            monitor,
            SchedulerOptions {
                config: config.scheduler.queue_config(),
                tick_interval: config.scheduler.tick_interval,
                history_limit: config.scheduler.history_limit,
                ..Default::default()
            },
        )?;

        let registry: Arc<dyn JobRegistry> = Arc::new(StaticJobRegistry::new(config.jobs.clone()));
        let dedup = Arc::new(CommitDedupCache::new(config.webhook.dedup_ttl));
        let gateway = Arc::new(TriggerGateway::new(
            registry.clone(),
            dedup,
            scheduler.clone(),
        ));

        Ok(Self {
            registry,
            scheduler,
            gateway,
            gate: Arc::new(LastBuiltCommitGate::new()),
            webhook: Arc::new(config.webhook.clone()),
        })
    }
}
