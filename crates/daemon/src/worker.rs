//! Worker pool.
//!
//! Each pipeline gets `concurrency` worker slots reading one shared queue.
//! A worker converts jobs one at a time, records successes in the registry
//! itself, and reports everything else to the orchestrator. After
//! `max_tasks_per_child` jobs a worker retires and its slot starts a fresh
//! one.

use crate::broker::JobQueue;
use crate::config::Pipeline;
use crate::engine::{ConversionEngine, ConversionRequest};
use crate::jobs::{Job, JobState};
use crate::registry::{BatchRegistry, CounterDelta, FileRecord, TransitionOutcome};
use crate::retry::RetryPolicy;
use crate::router::success_delta;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Messages from workers to the orchestrator loop.
#[derive(Debug, Clone)]
pub enum WorkerReport {
    /// The job is running; the hard time limit starts now.
    Started { job: Job, at: Instant },
    /// The job succeeded and the registry has been updated.
    Succeeded { job_id: String },
    /// The job failed and needs routing.
    Failed { job: Job, reason: String },
}

/// Why a worker's run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Task budget spent; the slot should start a replacement.
    Retired,
    /// Shutdown or the queue closed.
    Stopped,
}

/// Everything a worker needs, shared by all slots of one pipeline.
#[derive(Clone)]
pub struct WorkerContext {
    pub pipeline: Pipeline,
    pub queue: JobQueue,
    pub engine: Arc<dyn ConversionEngine>,
    pub registry: Arc<BatchRegistry>,
    pub retry: RetryPolicy,
    pub reports: mpsc::Sender<WorkerReport>,
    /// Stop taking new jobs.
    pub cancel: CancellationToken,
    /// Drop the job in progress.
    pub abort: CancellationToken,
    /// Zero means unlimited.
    pub max_tasks_per_child: u32,
}

/// Spawn `concurrency` supervised worker slots.
pub fn spawn_pool(ctx: WorkerContext, concurrency: usize) -> Vec<JoinHandle<()>> {
    (0..concurrency)
        .map(|slot| {
            let ctx = ctx.clone();
            tokio::spawn(async move { supervise_slot(ctx, slot).await })
        })
        .collect()
}

async fn supervise_slot(ctx: WorkerContext, slot: usize) {
    let mut generation = 0u64;
    loop {
        generation += 1;
        let worker_ctx = ctx.clone();
        let handle = tokio::spawn(async move { run_worker(worker_ctx).await });
        match handle.await {
            Ok(WorkerExit::Retired) => {
                debug!(pipeline = %ctx.pipeline, slot, generation, "Worker retired; starting replacement");
            }
            Ok(WorkerExit::Stopped) => break,
            Err(e) => {
                error!(pipeline = %ctx.pipeline, slot, generation, error = %e, "Worker crashed; starting replacement");
            }
        }
        if ctx.cancel.is_cancelled() {
            break;
        }
    }
}

/// Process jobs until retired, cancelled or the queue closes.
pub async fn run_worker(ctx: WorkerContext) -> WorkerExit {
    let mut handled = 0u32;
    loop {
        if ctx.max_tasks_per_child > 0 && handled >= ctx.max_tasks_per_child {
            return WorkerExit::Retired;
        }

        let next = tokio::select! {
            _ = ctx.cancel.cancelled() => return WorkerExit::Stopped,
            job = ctx.queue.recv() => job,
        };
        let Some(job) = next else {
            return WorkerExit::Stopped;
        };

        tokio::select! {
            // Dropping an in-progress conversion kills the engine process;
            // the record stays running and is recovered on the next start
            _ = ctx.abort.cancelled() => return WorkerExit::Stopped,
            _ = process_job(&ctx, job) => {}
        }
        handled += 1;
    }
}

async fn process_job(ctx: &WorkerContext, mut job: Job) {
    let queued = job.clone();
    job.set_state(JobState::Running);

    // Claim the attempt; a superseded or duplicate delivery is dropped here
    let started = ctx
        .registry
        .transition_with_retry(
            &ctx.retry,
            &queued.job_id,
            JobState::Queued,
            &FileRecord::from_job(&job),
            CounterDelta::default(),
        )
        .await;
    match started {
        Ok(TransitionOutcome::Applied(_)) => {}
        Ok(TransitionOutcome::Stale) => {
            debug!(job_id = %job.job_id, "Skipping job that is no longer queued");
            return;
        }
        Err(e) => {
            error!(job_id = %job.job_id, error = %e, "Cannot mark job running; skipping");
            return;
        }
    }

    let _ = ctx
        .reports
        .send(WorkerReport::Started {
            job: job.clone(),
            at: Instant::now(),
        })
        .await;

    let request = ConversionRequest {
        job_id: job.job_id.clone(),
        input_path: job.file_path.clone(),
        output_dir: job.output_dir.clone(),
        pipeline: job.pipeline,
    };
    let started_at = Instant::now();

    match ctx.engine.convert(&request).await {
        Ok(output) => {
            let record = FileRecord::from_job(&job)
                .with_state(JobState::Succeeded)
                .with_output(output.output_file.clone());
            let recorded = ctx
                .registry
                .transition_with_retry(&ctx.retry, &job.job_id, JobState::Running, &record, success_delta(&job))
                .await;
            match recorded {
                Ok(TransitionOutcome::Applied(batch)) => {
                    info!(
                        job_id = %job.job_id,
                        pipeline = %job.pipeline,
                        output = %output.output_file.display(),
                        elapsed_ms = started_at.elapsed().as_millis() as u64,
                        succeeded = batch.succeeded,
                        total = batch.total,
                        "Converted document"
                    );
                }
                Ok(TransitionOutcome::Stale) => {
                    warn!(job_id = %job.job_id, "Result arrived after the attempt was resolved; ignored");
                }
                Err(e) => {
                    error!(job_id = %job.job_id, error = %e, "Failed to record successful conversion");
                }
            }
            let _ = ctx
                .reports
                .send(WorkerReport::Succeeded {
                    job_id: job.job_id.clone(),
                })
                .await;
        }
        Err(e) => {
            debug!(job_id = %job.job_id, error = %e, "Conversion failed");
            let _ = ctx
                .reports
                .send(WorkerReport::Failed {
                    job,
                    reason: e.to_string(),
                })
                .await;
        }
    }
}
