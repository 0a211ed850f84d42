//! Daemon startup and main loop for the Docling batch orchestrator
//!
//! The orchestrator is one cooperative loop over cancellation, worker
//! reports, the scan interval and a one-second housekeeping tick. Failure
//! routing happens only on this loop; workers record successes themselves.

use crate::aggregator::{ProgressAggregator, StallAuditor};
use crate::broker::{JobQueue, LocalBroker};
use crate::config::{Config, ConfigError, Pipeline};
use crate::dispatcher::{JobDispatcher, QueueNames};
use crate::engine::{ConversionEngine, DoclingCommandEngine, DoclingSettings};
use crate::jobs::{current_timestamp_ms, Job, JobState};
use crate::lifecycle::{DaemonLock, LifecycleError, LifecycleState};
use crate::metrics::{collect_system_metrics, new_shared_status, SharedStatus};
use crate::registry::{BatchRegistry, CounterDelta, RegistryError, TransitionOutcome};
use crate::retry::RetryPolicy;
use crate::router::{FallbackRouter, RouteOutcome};
use crate::startup::{prepare_directories, run_startup_checks, StartupError};
use crate::status_server::run_status_server;
use crate::store::{open_store, KvError, KvStore};
use crate::watcher::DirectoryWatcher;
use crate::worker::{spawn_pool, WorkerContext, WorkerReport};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Key-value store unreachable or unusable
    #[error("Store error: {0}")]
    Store(#[from] KvError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Workers for the standard pipeline: configured count, or one per CPU.
pub fn standard_concurrency(config: &Config) -> usize {
    match config.celery.worker_concurrency {
        0 => num_cpus::get(),
        n => n as usize,
    }
}

pub fn vlm_concurrency(config: &Config) -> usize {
    config.vlm_fallback.worker_concurrency as usize
}

/// Time after `Started` when a silent job is treated as failed; None disables.
pub fn hard_time_limit(config: &Config) -> Option<Duration> {
    match config.celery.task_time_limit {
        0 => None,
        limit => Some(Duration::from_secs(limit + config.celery.result_grace_seconds)),
    }
}

/// What a startup recovery pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub batches: usize,
    /// Running records reset to queued.
    pub reset: usize,
    pub resubmitted: usize,
    pub abandoned: usize,
}

/// Mutable state owned by the orchestrator loop.
#[derive(Default)]
struct LoopState {
    running: HashMap<String, (Job, Instant)>,
    auditor: StallAuditor,
    completed_files: u64,
    failed_files: u64,
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    registry: Arc<BatchRegistry>,
    dispatcher: Arc<JobDispatcher>,
    router: FallbackRouter,
    watcher: DirectoryWatcher,
    aggregator: ProgressAggregator,
    engine: Arc<dyn ConversionEngine>,
    queues: HashMap<Pipeline, JobQueue>,
    status: SharedStatus,
    cancel: CancellationToken,
    instance_id: String,
}

impl Daemon {
    /// Initialize the daemon with full startup checks
    ///
    /// 1. Create the input, output and lock directories
    /// 2. Verify the conversion engine runs
    /// 3. Open the key-value store
    ///
    /// # Returns
    /// * `Ok(Daemon)` - Daemon initialized successfully
    /// * `Err(DaemonError)` - A check failed or the store is unreachable
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        let store = open_store(&config)?;
        let engine = Arc::new(DoclingCommandEngine::new(DoclingSettings::from_config(&config)));
        Ok(Self::with_components(config, store, engine))
    }

    /// Initialize the daemon without checking for the conversion engine
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        prepare_directories(&config)?;
        let store = open_store(&config)?;
        let engine = Arc::new(DoclingCommandEngine::new(DoclingSettings::from_config(&config)));
        Ok(Self::with_components(config, store, engine))
    }

    /// Assemble a daemon from an existing store and engine
    pub fn with_components(
        config: Config,
        store: Arc<dyn KvStore>,
        engine: Arc<dyn ConversionEngine>,
    ) -> Self {
        let registry = Arc::new(BatchRegistry::new(store));
        let queue_names = QueueNames::from_config(&config);

        let (broker, mut receivers) =
            LocalBroker::new(&[queue_names.standard.as_str(), queue_names.vlm.as_str()]);
        let mut queues = HashMap::new();
        for pipeline in [Pipeline::Standard, Pipeline::Vlm] {
            if let Some(queue) = receivers.remove(queue_names.for_pipeline(pipeline)) {
                queues.insert(pipeline, queue);
            }
        }

        let dispatcher = Arc::new(JobDispatcher::new(
            Arc::new(broker),
            registry.clone(),
            queue_names,
            RetryPolicy::from_config(&config.retry),
        ));
        let router = FallbackRouter::new(
            dispatcher.clone(),
            registry.clone(),
            config.vlm_fallback.enabled,
        );
        let watcher = DirectoryWatcher::new(&config, registry.clone());
        let aggregator = ProgressAggregator::new(registry.clone(), config.audit_delay_seconds);

        Self {
            config,
            registry,
            dispatcher,
            router,
            watcher,
            aggregator,
            engine,
            queues,
            status: new_shared_status(),
            cancel: CancellationToken::new(),
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn registry(&self) -> Arc<BatchRegistry> {
        self.registry.clone()
    }

    /// Get the shared status
    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    /// Cancelling this token shuts the daemon down
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn set_lifecycle(&self, state: LifecycleState) {
        let mut status = self.status.write().await;
        status.lifecycle = state;
        status.instance_id = self.instance_id.clone();
        status.timestamp_unix_ms = current_timestamp_ms();
        info!(lifecycle = %state, "Lifecycle changed");
    }

    fn spawn_workers(
        &self,
        reports: mpsc::Sender<WorkerReport>,
        cancel: &CancellationToken,
        abort: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for (pipeline, concurrency) in [
            (Pipeline::Standard, standard_concurrency(&self.config)),
            (Pipeline::Vlm, vlm_concurrency(&self.config)),
        ] {
            let Some(queue) = self.queues.get(&pipeline) else {
                continue;
            };
            let ctx = WorkerContext {
                pipeline,
                queue: queue.clone(),
                engine: self.engine.clone(),
                registry: self.registry.clone(),
                retry: self.dispatcher.retry_policy().clone(),
                reports: reports.clone(),
                cancel: cancel.clone(),
                abort: abort.clone(),
                max_tasks_per_child: self.config.celery.worker_max_tasks_per_child,
            };
            info!(pipeline = %pipeline, concurrency, "Starting workers");
            handles.extend(spawn_pool(ctx, concurrency));
        }
        handles
    }

    /// Resubmit unfinished work of incomplete batches.
    ///
    /// Queue contents do not survive a restart, so every queued record is
    /// submitted again and every running record is reset to queued first.
    /// Job ids, pipelines and attempt counts are kept; counters do not move.
    pub async fn recover(&self) -> Result<RecoverySummary, DaemonError> {
        let retry = self.dispatcher.retry_policy();
        let mut summary = RecoverySummary::default();

        for batch in self.registry.list()? {
            if batch.is_complete() {
                continue;
            }
            let files = match self.registry.files(&batch.batch_id) {
                Ok(files) => files,
                Err(e) => {
                    error!(batch_id = %batch.batch_id, error = %e, "Cannot read file records; batch left for the stall audit");
                    continue;
                }
            };
            summary.batches += 1;

            for record in files {
                let job = match record.state {
                    JobState::Queued => record.to_job(),
                    JobState::Running => {
                        let queued = record.clone().with_state(JobState::Queued);
                        match self
                            .registry
                            .transition_with_retry(retry, &record.job_id, JobState::Running, &queued, CounterDelta::default())
                            .await
                        {
                            Ok(TransitionOutcome::Applied(_)) => {
                                summary.reset += 1;
                                queued.to_job()
                            }
                            Ok(TransitionOutcome::Stale) => continue,
                            Err(e) => {
                                warn!(job_id = %record.job_id, error = %e, "Cannot reset running job");
                                continue;
                            }
                        }
                    }
                    JobState::Succeeded | JobState::Failed => continue,
                };
                match self.dispatcher.submit_or_abandon(&job).await {
                    Ok(true) => summary.resubmitted += 1,
                    Ok(false) => summary.abandoned += 1,
                    Err(e) => warn!(job_id = %job.job_id, error = %e, "Could not record abandoned job"),
                }
            }
        }

        if summary.batches > 0 {
            info!(
                batches = summary.batches,
                reset = summary.reset,
                resubmitted = summary.resubmitted,
                abandoned = summary.abandoned,
                "Recovered unfinished batches"
            );
        }
        Ok(summary)
    }

    /// Claim new directories and dispatch their jobs.
    pub async fn scan_and_dispatch(&self) -> usize {
        let created = match self.watcher.scan_once() {
            Ok(created) => created,
            Err(e) => {
                error!(dir = %self.watcher.watch_directory().display(), error = %e, "Scan failed");
                return 0;
            }
        };
        for new_batch in &created {
            self.dispatcher
                .dispatch_batch(&new_batch.batch, &new_batch.files)
                .await;
        }
        created.len()
    }

    async fn handle_report(&self, report: WorkerReport, state: &mut LoopState) {
        match report {
            WorkerReport::Started { job, at } => {
                state.running.insert(job.job_id.clone(), (job, at));
            }
            WorkerReport::Succeeded { job_id } => {
                state.running.remove(&job_id);
                state.completed_files += 1;
            }
            WorkerReport::Failed { job, reason } => {
                if state.running.remove(&job.job_id).is_none() {
                    // Already reaped by the hard time limit
                    debug!(job_id = %job.job_id, "Ignoring failure of reaped job");
                    return;
                }
                self.route_failure(&job, &reason, state).await;
            }
        }
    }

    async fn route_failure(&self, job: &Job, reason: &str, state: &mut LoopState) {
        match self.router.handle_failure(job, reason).await {
            Ok(RouteOutcome::Failed) | Ok(RouteOutcome::FallbackAbandoned(_)) => {
                state.failed_files += 1;
            }
            Ok(RouteOutcome::FallbackQueued(_)) | Ok(RouteOutcome::Stale) => {}
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "Failed to route job failure; batch left for the stall audit");
            }
        }
    }

    /// Treat jobs silent past the hard time limit as failed.
    async fn reap_overdue(&self, state: &mut LoopState) {
        let Some(limit) = hard_time_limit(&self.config) else {
            return;
        };
        let overdue: Vec<Job> = state
            .running
            .values()
            .filter(|(_, started)| started.elapsed() > limit)
            .map(|(job, _)| job.clone())
            .collect();
        for job in overdue {
            state.running.remove(&job.job_id);
            warn!(job_id = %job.job_id, limit_secs = limit.as_secs(), "Job exceeded hard time limit");
            let reason = format!("no result within {}s", limit.as_secs());
            self.route_failure(&job, &reason, state).await;
        }
    }

    async fn refresh_status(&self, state: &mut LoopState) {
        let now = current_timestamp_ms();
        let batches = match self.aggregator.all(now) {
            Ok(batches) => batches,
            Err(e) => {
                warn!(error = %e, "Cannot read batches for status");
                return;
            }
        };
        state.auditor.audit(&batches);

        let queues = self.dispatcher.queues();
        let mut status = self.status.write().await;
        status.timestamp_unix_ms = now;
        status.batches = batches;
        for pipeline in [Pipeline::Standard, Pipeline::Vlm] {
            if let Some(depth) = self.dispatcher.queue_depth(pipeline) {
                status
                    .queue_depths
                    .insert(queues.for_pipeline(pipeline).to_string(), depth);
            }
        }
        status.running_jobs = state.running.len();
        status.completed_files = state.completed_files;
        status.failed_files = state.failed_files;
    }

    /// Run the daemon main loop until the cancel token fires
    ///
    /// Starts the worker pools, recovers unfinished batches, then scans,
    /// dispatches and routes failures. On shutdown workers stop taking
    /// jobs and get `daemon.shutdown_timeout` seconds to finish.
    pub async fn run(&self) -> Result<(), DaemonError> {
        self.set_lifecycle(LifecycleState::Starting).await;

        let (report_tx, mut report_rx) = mpsc::channel(1024);
        let intake = CancellationToken::new();
        let abort = CancellationToken::new();
        let workers = self.spawn_workers(report_tx, &intake, &abort);

        if let Err(e) = self.recover().await {
            intake.cancel();
            abort.cancel();
            self.set_lifecycle(LifecycleState::Stopped).await;
            return Err(e);
        }
        self.set_lifecycle(LifecycleState::Running).await;

        let mut state = LoopState::default();
        let mut scan_tick = tokio::time::interval(Duration::from_secs(self.config.daemon.scan_interval.max(1)));
        let mut housekeeping = tokio::time::interval(Duration::from_secs(1));
        scan_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(report) = report_rx.recv() => {
                    self.handle_report(report, &mut state).await;
                }
                _ = scan_tick.tick() => {
                    let created = self.scan_and_dispatch().await;
                    if created > 0 {
                        self.refresh_status(&mut state).await;
                    }
                }
                _ = housekeeping.tick() => {
                    self.reap_overdue(&mut state).await;
                    self.refresh_status(&mut state).await;
                }
            }
        }

        self.set_lifecycle(LifecycleState::Stopping).await;
        intake.cancel();

        let timeout = Duration::from_secs(self.config.daemon.shutdown_timeout);
        let drain = async move {
            for handle in workers {
                let _ = handle.await;
            }
        };
        tokio::pin!(drain);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut drain => break,
                _ = &mut deadline => {
                    warn!(timeout_secs = timeout.as_secs(), "Workers did not finish in time; aborting running jobs");
                    abort.cancel();
                    break;
                }
                Some(report) = report_rx.recv() => {
                    self.handle_report(report, &mut state).await;
                }
            }
        }
        abort.cancel();

        self.refresh_status(&mut state).await;
        self.set_lifecycle(LifecycleState::Stopped).await;
        Ok(())
    }

    /// Start the status HTTP server
    pub fn start_status_server(&self) -> JoinHandle<()> {
        let status = self.status.clone();
        let cancel = self.cancel.clone();
        let addr = self.config.daemon.status_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = run_status_server(&addr, status, cancel).await {
                error!(addr = %addr, error = %e, "Status server error");
            }
        })
    }

    /// Start the system metrics update task
    ///
    /// Periodically updates host metrics in the shared status.
    pub fn start_metrics_updater(&self) -> JoinHandle<()> {
        let status = self.status.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let system = collect_system_metrics();
                status.write().await.system = system;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                }
            }
        })
    }

    /// Run the daemon with all background tasks
    ///
    /// Takes the single-instance lock, starts the status server and the
    /// metrics updater, then runs the main loop.
    pub async fn run_with_server(&self) -> Result<(), DaemonError> {
        let _lock = DaemonLock::acquire(&self.config.daemon.lock_file, &self.config.daemon.status_addr)?;

        let server = self.start_status_server();
        let updater = self.start_metrics_updater();

        let result = self.run().await;

        self.cancel.cancel();
        let _ = updater.await;
        if tokio::time::timeout(Duration::from_secs(5), server).await.is_err() {
            warn!("Status server did not stop in time");
        }
        result
    }
}
