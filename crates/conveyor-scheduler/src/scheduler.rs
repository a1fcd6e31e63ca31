//! Job queue and dispatch loop.
//!
//! All queue bookkeeping happens under a single mutex and never awaits
//! while holding it. Executors run in their own tasks and report back
//! through [`Inner::finish`], which re-enters the dispatch tick.

use crate::admission::{Admission, ResourceAdmission};
use crate::events::{EventBus, SchedulerEvent};
use crate::queue::PendingQueue;
use chrono::Utc;
use conveyor_core::executor::{BuildResult, ExecutionContext, JobExecutor, ProgressHandle};
use conveyor_core::queue::{ConfigUpdate, NewJob, QueueConfig, QueueEntry, QueueStatus};
use conveyor_core::resources::ResourceMonitor;
use conveyor_core::{Error, QueueEntryId, Result};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Construction options for [`JobScheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub config: QueueConfig,
    /// Period of the safety-net tick that picks up work deferred by load.
    pub tick_interval: Duration,
    /// Terminal entries kept for inspection.
    pub history_limit: usize,
    pub event_capacity: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            config: QueueConfig::default(),
            tick_interval: Duration::from_secs(5),
            history_limit: 100,
            event_capacity: 256,
        }
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Pending entries in dispatch order.
    pub pending: Vec<QueueEntry>,
    pub running: Vec<QueueEntry>,
    pub config: QueueConfig,
    pub processing: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub queued: usize,
    /// Occupied concurrency slots, including cancelled entries whose
    /// executor has not returned yet.
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
    pub dispatched: u64,
    pub history: usize,
    pub processing: bool,
    pub current_usage: f64,
    pub config: QueueConfig,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    completed: u64,
    failed: u64,
    cancelled: u64,
    retried: u64,
    dispatched: u64,
}

struct RunningJob {
    entry: QueueEntry,
    cancellation: CancellationToken,
    progress: ProgressHandle,
}

impl RunningJob {
    fn snapshot(&self) -> QueueEntry {
        let mut entry = self.entry.clone();
        entry.progress = self.progress.get();
        entry
    }
}

struct QueueState {
    pending: PendingQueue,
    running: HashMap<QueueEntryId, RunningJob>,
    history: VecDeque<QueueEntry>,
    config: QueueConfig,
    processing: bool,
    counters: Counters,
}

impl QueueState {
    fn can_dispatch(&self) -> bool {
        self.processing
            && self.running.len() < self.config.max_concurrent_jobs
            && !self.pending.is_empty()
    }
}

struct Inner {
    state: Mutex<QueueState>,
    executor: RwLock<Arc<dyn JobExecutor>>,
    admission: ResourceAdmission,
    events: EventBus,
    shutdown: CancellationToken,
    tick_interval: Duration,
    history_limit: usize,
}

/// Bounded-concurrency priority queue driving an injected executor.
///
/// Cloning is cheap; all clones share the same queue.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    /// Create a scheduler. Processing starts disabled; call
    /// [`start_processing`](Self::start_processing) to begin dispatching.
    pub fn new(
        executor: Arc<dyn JobExecutor>,
        monitor: Arc<dyn ResourceMonitor>,
        options: SchedulerOptions,
    ) -> Result<Self> {
        options.config.validate()?;

        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    pending: PendingQueue::new(),
                    running: HashMap::new(),
                    history: VecDeque::new(),
                    config: options.config,
                    processing: false,
                    counters: Counters::default(),
                }),
                executor: RwLock::new(executor),
                admission: ResourceAdmission::new(monitor),
                events: EventBus::new(options.event_capacity),
                shutdown: CancellationToken::new(),
                tick_interval: options.tick_interval,
                history_limit: options.history_limit,
            }),
        })
    }

    /// Replace the executor used for subsequent dispatches.
    pub async fn set_executor(&self, executor: Arc<dyn JobExecutor>) {
        info!(executor = executor.name(), "Executor replaced");
        *self.inner.executor.write().await = executor;
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// Admit a job into the pending queue and return its queue id.
    pub async fn add_job(&self, job: NewJob) -> Result<QueueEntryId> {
        let entry = QueueEntry::admit(job)?;
        let id = entry.id;

        {
            let mut state = self.inner.state.lock().await;
            info!(
                queue_id = %id,
                job_id = %entry.job_id,
                priority = %entry.priority,
                source = ?entry.metadata.source,
                pending = state.pending.len() + 1,
                "Job queued"
            );
            state.pending.push(entry);
        }

        self.inner.tick().await;
        Ok(id)
    }

    /// Cancel a queued or running entry.
    ///
    /// Queued entries are removed immediately. Running entries are flagged
    /// and their executor's cancellation token is triggered; the entry keeps
    /// its slot until the executor returns. Returns `false` for unknown or
    /// already terminal entries.
    pub async fn cancel_job(&self, id: &QueueEntryId) -> bool {
        let mut state = self.inner.state.lock().await;

        if let Some(mut entry) = state.pending.remove(id) {
            entry.status = QueueStatus::Cancelled;
            entry.finished_at = Some(Utc::now());
            state.counters.cancelled += 1;
            info!(queue_id = %id, job_id = %entry.job_id, "Cancelled queued job");
            self.inner
                .events
                .emit(SchedulerEvent::JobCancelled { entry: entry.clone() });
            self.inner.record_terminal(&mut state, entry);
            return true;
        }

        let snapshot = match state.running.get_mut(id) {
            Some(running) if running.entry.status != QueueStatus::Cancelled => {
                running.entry.status = QueueStatus::Cancelled;
                running.entry.finished_at = Some(Utc::now());
                running.cancellation.cancel();
                running.snapshot()
            }
            _ => return false,
        };

        state.counters.cancelled += 1;
        info!(queue_id = %id, job_id = %snapshot.job_id, "Cancellation requested for running job");
        self.inner
            .events
            .emit(SchedulerEvent::JobCancelled { entry: snapshot });
        true
    }

    /// Look up an entry in the pending, running or retained terminal sets.
    pub async fn get_job(&self, id: &QueueEntryId) -> Option<QueueEntry> {
        let state = self.inner.state.lock().await;
        state
            .pending
            .get(id)
            .cloned()
            .or_else(|| state.running.get(id).map(RunningJob::snapshot))
            .or_else(|| state.history.iter().rev().find(|e| e.id == *id).cloned())
    }

    pub async fn queue_status(&self) -> QueueSnapshot {
        let state = self.inner.state.lock().await;
        let mut running: Vec<QueueEntry> =
            state.running.values().map(RunningJob::snapshot).collect();
        running.sort_by_key(|e| e.started_at);

        QueueSnapshot {
            pending: state.pending.iter().cloned().collect(),
            running,
            config: state.config,
            processing: state.processing,
        }
    }

    pub async fn stats(&self) -> SchedulerStats {
        let current_usage = self.inner.admission.sample().await;
        let state = self.inner.state.lock().await;
        let counters = state.counters;

        SchedulerStats {
            queued: state.pending.len(),
            running: state.running.len(),
            completed: counters.completed,
            failed: counters.failed,
            cancelled: counters.cancelled,
            retried: counters.retried,
            dispatched: counters.dispatched,
            history: state.history.len(),
            processing: state.processing,
            current_usage,
            config: state.config,
        }
    }

    pub async fn config(&self) -> QueueConfig {
        self.inner.state.lock().await.config
    }

    /// Apply new limits. Takes effect immediately for the next dispatch.
    pub async fn update_config(&self, update: ConfigUpdate) -> Result<QueueConfig> {
        let config = {
            let mut state = self.inner.state.lock().await;
            let config = state.config.apply(&update)?;
            state.config = config;
            config
        };

        info!(
            max_concurrent_jobs = config.max_concurrent_jobs,
            resource_threshold = config.resource_threshold,
            "Queue configuration updated"
        );
        self.inner.tick().await;
        Ok(config)
    }

    pub async fn start_processing(&self) {
        self.inner.state.lock().await.processing = true;
        info!("Queue processing started");
        self.inner.tick().await;
    }

    /// Stop dispatching new work. Running jobs continue and queued jobs stay
    /// queued.
    pub async fn stop_processing(&self) {
        self.inner.state.lock().await.processing = false;
        info!("Queue processing stopped");
    }

    pub async fn is_processing(&self) -> bool {
        self.inner.state.lock().await.processing
    }

    /// Run one dispatch pass.
    pub async fn tick(&self) {
        self.inner.tick().await;
    }

    /// Drive periodic ticks until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) {
        info!(interval = ?self.inner.tick_interval, "Starting dispatch loop");
        let mut interval = tokio::time::interval(self.inner.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.inner.tick().await,
                _ = self.inner.shutdown.cancelled() => {
                    info!("Dispatch loop stopped");
                    break;
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) onto the runtime.
    pub fn spawn(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run().await })
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    async fn tick(self: &Arc<Self>) {
        if !self.state.lock().await.can_dispatch() {
            return;
        }

        // Sampled once per tick, outside the queue lock.
        let usage = self.admission.sample().await;
        let executor = Arc::clone(&*self.executor.read().await);
        let mut state = self.state.lock().await;

        if !state.can_dispatch() {
            return;
        }
        if let Admission::Deferred { usage, threshold } =
            ResourceAdmission::evaluate(usage, state.config.resource_threshold)
        {
            debug!(
                usage,
                threshold,
                pending = state.pending.len(),
                "Dispatch deferred by resource usage"
            );
            return;
        }

        while state.can_dispatch() {
            let Some(mut entry) = state.pending.pop() else {
                break;
            };

            entry.status = QueueStatus::Running;
            entry.started_at = Some(Utc::now());
            entry.progress = 0;

            let cancellation = CancellationToken::new();
            let progress = ProgressHandle::new();
            state.running.insert(
                entry.id,
                RunningJob {
                    entry: entry.clone(),
                    cancellation: cancellation.clone(),
                    progress: progress.clone(),
                },
            );
            state.counters.dispatched += 1;

            info!(
                queue_id = %entry.id,
                job_id = %entry.job_id,
                attempt = entry.retry_count + 1,
                running = state.running.len(),
                "Dispatching job"
            );
            self.events
                .emit(SchedulerEvent::JobStarted { entry: entry.clone() });

            let ctx = ExecutionContext {
                entry,
                cancellation,
                progress,
            };
            self.launch(Arc::clone(&executor), ctx);
        }
    }

    /// Run the executor in its own task and route the outcome back.
    fn launch(self: &Arc<Self>, executor: Arc<dyn JobExecutor>, ctx: ExecutionContext) {
        let inner = Arc::clone(self);
        let id = ctx.entry.id;

        tokio::spawn(async move {
            // A nested task turns an executor panic into a failed attempt.
            let outcome = match tokio::spawn(async move { executor.execute(ctx).await }).await {
                Ok(outcome) => outcome,
                Err(e) => Err(Error::Execution(format!("executor task aborted: {}", e))),
            };
            inner.finish(id, outcome).await;
        });
    }

    async fn finish(self: &Arc<Self>, id: QueueEntryId, outcome: Result<BuildResult>) {
        {
            let mut state = self.state.lock().await;
            let Some(running) = state.running.remove(&id) else {
                warn!(queue_id = %id, "Completion for unknown job ignored");
                return;
            };
            let mut entry = running.snapshot();

            if entry.status == QueueStatus::Cancelled {
                info!(queue_id = %id, job_id = %entry.job_id, "Cancelled job released its slot");
                self.record_terminal(&mut state, entry);
            } else {
                let failure = match outcome {
                    Ok(result) if result.success => None,
                    Ok(result) => Some(
                        result
                            .message
                            .unwrap_or_else(|| "build reported failure".to_string()),
                    ),
                    Err(e) => Some(e.to_string()),
                };

                match failure {
                    None => {
                        entry.status = QueueStatus::Success;
                        entry.progress = 100;
                        entry.finished_at = Some(Utc::now());
                        state.counters.completed += 1;
                        info!(queue_id = %id, job_id = %entry.job_id, "Job completed successfully");
                        self.events
                            .emit(SchedulerEvent::JobCompleted { entry: entry.clone() });
                        self.record_terminal(&mut state, entry);
                    }
                    Some(error) if entry.can_retry() => {
                        entry.retry_count += 1;
                        entry.status = QueueStatus::Queued;
                        entry.started_at = None;
                        entry.progress = 0;
                        entry.last_error = Some(error.clone());
                        state.counters.retried += 1;
                        warn!(
                            queue_id = %id,
                            job_id = %entry.job_id,
                            retry = entry.retry_count,
                            max_retries = entry.max_retries,
                            error = %error,
                            "Job failed, requeueing"
                        );
                        self.events.emit(SchedulerEvent::JobRetry {
                            entry: entry.clone(),
                            error,
                        });
                        state.pending.push(entry);
                    }
                    Some(error) => {
                        entry.status = QueueStatus::Failed;
                        entry.finished_at = Some(Utc::now());
                        entry.last_error = Some(error.clone());
                        state.counters.failed += 1;
                        error!(
                            queue_id = %id,
                            job_id = %entry.job_id,
                            retries = entry.retry_count,
                            error = %error,
                            "Job failed permanently"
                        );
                        self.events.emit(SchedulerEvent::JobFailed {
                            entry: entry.clone(),
                            error,
                        });
                        self.record_terminal(&mut state, entry);
                    }
                }
            }
        }

        self.tick().await;
    }

    fn record_terminal(&self, state: &mut QueueState, entry: QueueEntry) {
        if self.history_limit == 0 {
            return;
        }
        state.history.push_back(entry);
        while state.history.len() > self.history_limit {
            state.history.pop_front();
        }
    }
}
