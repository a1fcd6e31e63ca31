//! Background work started alongside the HTTP server.

use conveyor_config::SystemConfig;
use conveyor_core::gate::CommitGate;
use conveyor_scheduler::SchedulerEvent;
use conveyor_trigger::{RemoteHeads, RepositoryPoller};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::AppState;

/// Handles to the server's long-running tasks.
pub struct BackgroundTasks {
    state: AppState,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn spawn(state: &AppState, config: &SystemConfig, heads: Arc<dyn RemoteHeads>) -> Self {
        let shutdown = CancellationToken::new();
        let mut handles = vec![state.scheduler.spawn()];

        handles.push(
            state
                .gateway
                .dedup()
                .clone()
                .spawn_sweeper(config.webhook.dedup_ttl, shutdown.clone()),
        );

        handles.push(tokio::spawn(log_events(
            state.scheduler.subscribe(),
            shutdown.clone(),
        )));

        let gate: Arc<dyn CommitGate> = state.gate.clone();
        handles.push(tokio::spawn(record_started_commits(
            state.scheduler.subscribe(),
            gate.clone(),
            shutdown.clone(),
        )));

        let polled = config.jobs.iter().filter(|job| job.is_polled()).count();
        if config.poller.enabled && polled > 0 {
            let poller = Arc::new(RepositoryPoller::new(
                state.registry.clone(),
                state.scheduler.clone(),
                gate,
                state.gateway.dedup().clone(),
                heads,
                config.poller.interval,
            ));
            info!(jobs = polled, "Repository poller enabled");
            handles.push(poller.spawn(shutdown.clone()));
        } else {
            info!("Repository poller disabled");
        }

        Self {
            state: state.clone(),
            shutdown,
            handles,
        }
    }

    /// Stop every task and wait for them to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.state.scheduler.shutdown();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
    }
}

/// Trace every scheduler event at debug level.
pub async fn log_events(
    mut events: broadcast::Receiver<SchedulerEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let entry = event.entry();
                    debug!(
                        event = event.kind(),
                        queue_id = %entry.id,
                        job_id = %entry.job_id,
                        status = ?entry.status,
                        retry = entry.retry_count,
                        "Scheduler event"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger lagged behind scheduler events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }
}

/// Feed the commit gate from `JobStarted` events so the poller does not
/// rebuild commits that a webhook already started.
pub async fn record_started_commits(
    mut events: broadcast::Receiver<SchedulerEvent>,
    gate: Arc<dyn CommitGate>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SchedulerEvent::JobStarted { entry }) => {
                    if let Some(commit) = &entry.metadata.commit_hash {
                        gate.record_build(&entry.job_id, commit).await;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Commit recorder lagged behind scheduler events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }
}
