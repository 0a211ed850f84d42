//! Fallback router.
//!
//! Decides what happens to a failed job. A first attempt with fallback
//! enabled is re-queued once on the alternate pipeline; anything else is
//! terminal. The decision never looks at which engine ran, only at the
//! attempt count and the job's pipeline, so a `standard` primary falls
//! back to `vlm` and a `vlm` primary falls back to `standard` the same way.

use crate::dispatcher::JobDispatcher;
use crate::jobs::{Job, JobState};
use crate::registry::{BatchRegistry, CounterDelta, FileRecord, RegistryError, TransitionOutcome};
use std::sync::Arc;
use tracing::{info, warn};

/// What to do with a failed job.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    /// Queue this attempt on the alternate pipeline.
    Fallback(Job),
    /// Count the file as failed.
    Terminal,
}

/// How a failure report was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// The fallback attempt is queued.
    FallbackQueued(Job),
    /// The fallback attempt could not be submitted; the file is failed.
    FallbackAbandoned(Job),
    /// The file is failed.
    Failed,
    /// The report referred to a superseded or already resolved attempt.
    Stale,
}

pub fn decide(job: &Job, fallback_enabled: bool) -> RouteDecision {
    if !fallback_enabled {
        return RouteDecision::Terminal;
    }
    match job.fallback() {
        Some(next) => RouteDecision::Fallback(next),
        None => RouteDecision::Terminal,
    }
}

/// Counter change when `job` succeeds.
pub fn success_delta(job: &Job) -> CounterDelta {
    CounterDelta {
        succeeded: 1,
        failed: 0,
        fallback_pending: if job.is_fallback() { -1 } else { 0 },
    }
}

/// Counter change when `job` fails for good.
pub fn failure_delta(job: &Job) -> CounterDelta {
    CounterDelta {
        succeeded: 0,
        failed: 1,
        fallback_pending: if job.is_fallback() { -1 } else { 0 },
    }
}

/// Counter change when a file enters its fallback attempt.
pub fn fallback_delta() -> CounterDelta {
    CounterDelta {
        fallback_pending: 1,
        ..CounterDelta::default()
    }
}

pub struct FallbackRouter {
    dispatcher: Arc<JobDispatcher>,
    registry: Arc<BatchRegistry>,
    fallback_enabled: bool,
}

impl FallbackRouter {
    pub fn new(dispatcher: Arc<JobDispatcher>, registry: Arc<BatchRegistry>, fallback_enabled: bool) -> Self {
        Self {
            dispatcher,
            registry,
            fallback_enabled,
        }
    }

    /// Resolve a failed running job.
    pub async fn handle_failure(&self, job: &Job, reason: &str) -> Result<RouteOutcome, RegistryError> {
        let retry = self.dispatcher.retry_policy();

        match decide(job, self.fallback_enabled) {
            RouteDecision::Terminal => {
                let record = FileRecord::from_job(job)
                    .with_state(JobState::Failed)
                    .with_error(reason);
                let outcome = self
                    .registry
                    .transition_with_retry(retry, &job.job_id, JobState::Running, &record, failure_delta(job))
                    .await?;
                match outcome {
                    TransitionOutcome::Applied(batch) => {
                        warn!(
                            job_id = %job.job_id,
                            pipeline = %job.pipeline,
                            attempt = job.attempt_count,
                            reason = %reason,
                            failed = batch.failed,
                            "File failed"
                        );
                        Ok(RouteOutcome::Failed)
                    }
                    TransitionOutcome::Stale => Ok(RouteOutcome::Stale),
                }
            }
            RouteDecision::Fallback(next) => {
                // New attempt record and fallback_pending move together
                let record = FileRecord::from_job(&next).with_error(reason);
                let outcome = self
                    .registry
                    .transition_with_retry(retry, &job.job_id, JobState::Running, &record, fallback_delta())
                    .await?;
                if outcome == TransitionOutcome::Stale {
                    return Ok(RouteOutcome::Stale);
                }

                info!(
                    job_id = %job.job_id,
                    from = %job.pipeline,
                    to = %next.pipeline,
                    reason = %reason,
                    "Routing failed job to fallback pipeline"
                );

                if self.dispatcher.submit_or_abandon(&next).await? {
                    Ok(RouteOutcome::FallbackQueued(next))
                } else {
                    Ok(RouteOutcome::FallbackAbandoned(next))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{JobQueue, LocalBroker};
    use crate::config::Pipeline;
    use crate::dispatcher::QueueNames;
    use crate::registry::Batch;
    use crate::retry::RetryPolicy;
    use crate::store::MemoryKvStore;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    struct Harness {
        registry: Arc<BatchRegistry>,
        router: FallbackRouter,
        receivers: HashMap<String, JobQueue>,
    }

    fn harness(fallback_enabled: bool) -> Harness {
        let registry = Arc::new(BatchRegistry::new(Arc::new(MemoryKvStore::new())));
        let (broker, receivers) = LocalBroker::new(&["celery", "vlm_pdf"]);
        let dispatcher = Arc::new(JobDispatcher::new(
            Arc::new(broker),
            registry.clone(),
            QueueNames {
                standard: "celery".to_string(),
                vlm: "vlm_pdf".to_string(),
            },
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        ));
        let router = FallbackRouter::new(dispatcher, registry.clone(), fallback_enabled);
        Harness {
            registry,
            router,
            receivers,
        }
    }

    /// Claim a one-file batch and move its job to running.
    fn running_job(registry: &BatchRegistry, mode: Pipeline) -> Job {
        let batch = Batch::new("b", PathBuf::from("/in/b"), PathBuf::from("/out/b"), 1, mode);
        let mut job = Job::primary("b", "x.pdf", PathBuf::from("/in/b/x.pdf"), PathBuf::from("/out/b"), mode);
        registry.claim_batch(&batch, &[FileRecord::from_job(&job)]).unwrap();
        job.set_state(JobState::Running);
        registry
            .transition(&job.job_id, JobState::Queued, &FileRecord::from_job(&job), CounterDelta::default())
            .unwrap();
        job
    }

    fn start(registry: &BatchRegistry, job: &Job) -> Job {
        let mut running = job.clone();
        running.set_state(JobState::Running);
        registry
            .transition(&job.job_id, JobState::Queued, &FileRecord::from_job(&running), CounterDelta::default())
            .unwrap();
        running
    }

    #[test]
    fn test_deltas() {
        let primary = Job::primary("b", "x.pdf", PathBuf::from("/x.pdf"), PathBuf::from("/o"), Pipeline::Standard);
        let fallback = primary.fallback().unwrap();
        assert_eq!(success_delta(&primary), CounterDelta { succeeded: 1, ..Default::default() });
        assert_eq!(
            success_delta(&fallback),
            CounterDelta { succeeded: 1, fallback_pending: -1, ..Default::default() }
        );
        assert_eq!(failure_delta(&primary), CounterDelta { failed: 1, ..Default::default() });
        assert_eq!(
            failure_delta(&fallback),
            CounterDelta { failed: 1, fallback_pending: -1, ..Default::default() }
        );
    }

    #[test]
    fn test_decide_disabled_is_terminal() {
        let job = Job::primary("b", "x.pdf", PathBuf::from("/x.pdf"), PathBuf::from("/o"), Pipeline::Vlm);
        assert_eq!(decide(&job, false), RouteDecision::Terminal);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        // **Property: Mode symmetry**
        //
        // *For any* primary pipeline, the router's decision for a first
        // failure is a fallback on the alternate pipeline, and a second
        // failure is terminal.
        #[test]
        fn prop_decide_is_mode_symmetric(mode in prop_oneof![Just(Pipeline::Standard), Just(Pipeline::Vlm)]) {
            let job = Job::primary("b", "x.pdf", PathBuf::from("/x.pdf"), PathBuf::from("/o"), mode);
            match decide(&job, true) {
                RouteDecision::Fallback(next) => {
                    prop_assert_eq!(next.pipeline, mode.alternate());
                    prop_assert_eq!(decide(&next, true), RouteDecision::Terminal);
                }
                RouteDecision::Terminal => prop_assert!(false, "first failure must fall back"),
            }
        }
    }

    #[tokio::test]
    async fn test_first_failure_queues_fallback_on_alternate_queue() {
        let h = harness(true);
        let job = running_job(&h.registry, Pipeline::Standard);

        let outcome = h.router.handle_failure(&job, "ocr crashed").await.unwrap();
        let next = match outcome {
            RouteOutcome::FallbackQueued(next) => next,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(next.pipeline, Pipeline::Vlm);

        let batch = h.registry.get("b").unwrap().unwrap();
        assert_eq!(batch.fallback_pending, 1);
        assert_eq!(batch.in_flight(), 0);

        let record = h.registry.file("b", "x.pdf").unwrap().unwrap();
        assert_eq!(record.job_id, "b:x.pdf:2");
        assert_eq!(record.state, JobState::Queued);
        assert_eq!(record.error.as_deref(), Some("ocr crashed"));

        let queued = h.receivers["vlm_pdf"].recv().await.unwrap();
        assert_eq!(queued.job_id, "b:x.pdf:2");
    }

    #[tokio::test]
    async fn test_second_failure_is_terminal() {
        let h = harness(true);
        let job = running_job(&h.registry, Pipeline::Vlm);
        let next = match h.router.handle_failure(&job, "vlm oom").await.unwrap() {
            RouteOutcome::FallbackQueued(next) => next,
            other => panic!("unexpected outcome: {:?}", other),
        };
        let next = start(&h.registry, &next);

        assert_eq!(h.router.handle_failure(&next, "still broken").await.unwrap(), RouteOutcome::Failed);
        let batch = h.registry.get("b").unwrap().unwrap();
        assert_eq!((batch.succeeded, batch.failed, batch.fallback_pending), (0, 1, 0));
        assert!(batch.is_complete());
    }

    #[tokio::test]
    async fn test_duplicate_failure_report_is_stale() {
        let h = harness(true);
        let job = running_job(&h.registry, Pipeline::Standard);
        h.router.handle_failure(&job, "boom").await.unwrap();
        assert_eq!(h.router.handle_failure(&job, "boom").await.unwrap(), RouteOutcome::Stale);
        assert_eq!(h.registry.get("b").unwrap().unwrap().fallback_pending, 1);
    }

    #[tokio::test]
    async fn test_fallback_disabled_fails_immediately() {
        let h = harness(false);
        let job = running_job(&h.registry, Pipeline::Standard);
        assert_eq!(h.router.handle_failure(&job, "boom").await.unwrap(), RouteOutcome::Failed);
        let batch = h.registry.get("b").unwrap().unwrap();
        assert_eq!((batch.failed, batch.fallback_pending), (1, 0));
    }

    #[tokio::test]
    async fn test_unsubmittable_fallback_is_failed() {
        let mut h = harness(true);
        // No vlm consumers left, so the fallback cannot be submitted
        drop(h.receivers.remove("vlm_pdf"));

        let job = running_job(&h.registry, Pipeline::Standard);
        let outcome = h.router.handle_failure(&job, "boom").await.unwrap();
        assert!(matches!(outcome, RouteOutcome::FallbackAbandoned(_)));

        let batch = h.registry.get("b").unwrap().unwrap();
        assert_eq!((batch.failed, batch.fallback_pending), (1, 0));
        assert!(batch.is_complete());
    }
}
