//! Job dispatcher: turns file records into queued jobs.
//!
//! Submission is fire-and-forget. Broker errors are retried with backoff;
//! once the budget is spent the file is marked failed directly, without
//! consuming its fallback attempt.

use crate::broker::{Broker, BrokerError};
use crate::config::{Config, Pipeline};
use crate::jobs::{Job, JobState};
use crate::registry::{Batch, BatchRegistry, FileRecord, RegistryError, TransitionOutcome};
use crate::retry::RetryPolicy;
use crate::router::failure_delta;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Queue names per pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueNames {
    pub standard: String,
    pub vlm: String,
}

impl QueueNames {
    pub fn from_config(config: &Config) -> Self {
        Self {
            standard: config.queue_for(Pipeline::Standard).to_string(),
            vlm: config.queue_for(Pipeline::Vlm).to_string(),
        }
    }

    pub fn for_pipeline(&self, pipeline: Pipeline) -> &str {
        match pipeline {
            Pipeline::Standard => &self.standard,
            Pipeline::Vlm => &self.vlm,
        }
    }
}

/// Outcome of dispatching one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub submitted: usize,
    /// Files marked failed because no queue accepted them.
    pub abandoned: usize,
}

pub struct JobDispatcher {
    broker: Arc<dyn Broker>,
    registry: Arc<BatchRegistry>,
    queues: QueueNames,
    retry: RetryPolicy,
}

impl JobDispatcher {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<BatchRegistry>,
        queues: QueueNames,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            broker,
            registry,
            queues,
            retry,
        }
    }

    pub fn queues(&self) -> &QueueNames {
        &self.queues
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Jobs waiting in the queue serving `pipeline`, if known.
    pub fn queue_depth(&self, pipeline: Pipeline) -> Option<usize> {
        self.broker.depth(self.queues.for_pipeline(pipeline))
    }

    /// Submit a job to the queue for its pipeline, retrying with backoff.
    pub async fn submit(&self, job: &Job) -> Result<(), BrokerError> {
        let queue = self.queues.for_pipeline(job.pipeline);
        let what = format!("submit {} to {}", job.job_id, queue);
        let broker = &self.broker;
        self.retry
            .run(&what, |_: &BrokerError| true, move || async move {
                broker.submit(queue, job.clone())
            })
            .await
    }

    /// Mark a queued job failed without running it.
    ///
    /// A fallback attempt leaves `fallback_pending` as it moves to `failed`.
    pub async fn abandon(&self, job: &Job, reason: &str) -> Result<TransitionOutcome, RegistryError> {
        let record = FileRecord::from_job(job)
            .with_state(JobState::Failed)
            .with_error(reason);
        self.registry
            .transition_with_retry(
                &self.retry,
                &job.job_id,
                JobState::Queued,
                &record,
                failure_delta(job),
            )
            .await
    }

    /// Submit a queued file record; abandon it if no queue accepts it.
    ///
    /// Returns true if the job was queued.
    pub async fn submit_or_abandon(&self, job: &Job) -> Result<bool, RegistryError> {
        match self.submit(job).await {
            Ok(()) => Ok(true),
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "Submission failed; marking file failed");
                self.abandon(job, &format!("submission failed: {}", e)).await?;
                Ok(false)
            }
        }
    }

    /// Enqueue one job per file of a newly created batch.
    pub async fn dispatch_batch(&self, batch: &Batch, files: &[FileRecord]) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        for record in files {
            let job = record.to_job();
            match self.submit_or_abandon(&job).await {
                Ok(true) => summary.submitted += 1,
                Ok(false) => summary.abandoned += 1,
                Err(e) => {
                    // Record stays queued; the batch surfaces as stalled
                    warn!(job_id = %job.job_id, error = %e, "Could not record abandoned job");
                    summary.abandoned += 1;
                }
            }
        }
        info!(
            batch_id = %batch.batch_id,
            pipeline = %batch.primary_mode,
            submitted = summary.submitted,
            abandoned = summary.abandoned,
            "Dispatched batch"
        );
        summary
    }
}
