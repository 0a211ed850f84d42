//! Progress aggregator: derived batch status over registry snapshots.
//!
//! Read-only; never writes counters.

use crate::config::Pipeline;
use crate::registry::{Batch, BatchRegistry, RegistryError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Derived state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Complete,
    InProgress,
    /// Not complete and no counter change within the audit window.
    Stalled,
    /// Cancelled by an operator.
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Complete => "complete",
            BatchStatus::InProgress => "in_progress",
            BatchStatus::Stalled => "stalled",
            BatchStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one batch as shown by `status` and the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub status: BatchStatus,
    /// Human summary: done, partially failed, in fallback, running or stalled.
    pub summary: String,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub fallback_pending: u64,
    pub in_flight: u64,
    pub progress_percent: f32,
    pub has_failures: bool,
    pub in_fallback: bool,
    pub stalled: bool,
    pub primary_mode: Pipeline,
    pub directory_path: PathBuf,
    pub output_dir: PathBuf,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub cancelled_at: Option<i64>,
}

/// Classify a batch at `now_ms`.
///
/// # Arguments
/// * `batch` - Registry snapshot
/// * `now_ms` - Current unix time in milliseconds
/// * `audit_delay_secs` - Idle window after which an incomplete batch is stalled
pub fn classify(batch: &Batch, now_ms: i64, audit_delay_secs: u64) -> BatchStatus {
    if batch.cancelled_at.is_some() {
        return BatchStatus::Cancelled;
    }
    if batch.is_complete() {
        return BatchStatus::Complete;
    }
    let idle_ms = now_ms.saturating_sub(batch.updated_at);
    if idle_ms > (audit_delay_secs as i64).saturating_mul(1000) {
        BatchStatus::Stalled
    } else {
        BatchStatus::InProgress
    }
}

fn summary(batch: &Batch, status: BatchStatus) -> &'static str {
    match status {
        BatchStatus::Complete if batch.failed > 0 => "partially failed",
        BatchStatus::Complete => "done",
        BatchStatus::Stalled => "stalled",
        BatchStatus::Cancelled if batch.is_complete() => "cancelled",
        BatchStatus::Cancelled => "cancelling",
        BatchStatus::InProgress if batch.fallback_pending > 0 => "in fallback",
        BatchStatus::InProgress => "running",
    }
}

/// Build the full report for one batch.
pub fn report(batch: &Batch, now_ms: i64, audit_delay_secs: u64) -> BatchReport {
    let status = classify(batch, now_ms, audit_delay_secs);
    let resolved = batch.succeeded + batch.failed;
    let progress_percent = if batch.total == 0 {
        100.0
    } else {
        (resolved as f64 / batch.total as f64 * 100.0) as f32
    };
    BatchReport {
        batch_id: batch.batch_id.clone(),
        status,
        summary: summary(batch, status).to_string(),
        total: batch.total,
        succeeded: batch.succeeded,
        failed: batch.failed,
        fallback_pending: batch.fallback_pending,
        in_flight: batch.in_flight(),
        progress_percent,
        has_failures: batch.failed > 0,
        in_fallback: batch.fallback_pending > 0,
        stalled: status == BatchStatus::Stalled,
        primary_mode: batch.primary_mode,
        directory_path: batch.directory_path.clone(),
        output_dir: batch.output_dir.clone(),
        created_at: batch.created_at,
        updated_at: batch.updated_at,
        completed_at: batch.completed_at,
        cancelled_at: batch.cancelled_at,
    }
}

pub struct ProgressAggregator {
    registry: Arc<BatchRegistry>,
    audit_delay_secs: u64,
}

impl ProgressAggregator {
    pub fn new(registry: Arc<BatchRegistry>, audit_delay_secs: u64) -> Self {
        Self {
            registry,
            audit_delay_secs,
        }
    }

    pub fn status(&self, batch_id: &str, now_ms: i64) -> Result<Option<BatchReport>, RegistryError> {
        Ok(self
            .registry
            .get(batch_id)?
            .map(|b| report(&b, now_ms, self.audit_delay_secs)))
    }

    pub fn all(&self, now_ms: i64) -> Result<Vec<BatchReport>, RegistryError> {
        Ok(self
            .registry
            .list()?
            .iter()
            .map(|b| report(b, now_ms, self.audit_delay_secs))
            .collect())
    }
}

/// Warns once each time a batch turns stalled.
#[derive(Debug, Default)]
pub struct StallAuditor {
    flagged: HashSet<String>,
}

impl StallAuditor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the ids of batches that became stalled in this pass.
    pub fn audit(&mut self, reports: &[BatchReport]) -> Vec<String> {
        let mut newly = Vec::new();
        for r in reports {
            if r.stalled {
                if self.flagged.insert(r.batch_id.clone()) {
                    warn!(
                        batch_id = %r.batch_id,
                        lost_jobs = r.in_flight + r.fallback_pending,
                        succeeded = r.succeeded,
                        failed = r.failed,
                        total = r.total,
                        "Batch stalled; jobs may have been lost"
                    );
                    newly.push(r.batch_id.clone());
                }
            } else if self.flagged.remove(&r.batch_id) {
                info!(batch_id = %r.batch_id, status = %r.status, "Batch resumed");
            }
        }
        newly
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CounterDelta;
    use crate::store::MemoryKvStore;
    use proptest::prelude::*;

    fn batch(total: u64, succeeded: u64, failed: u64, fallback_pending: u64) -> Batch {
        let mut b = Batch::new("b", PathBuf::from("/in/b"), PathBuf::from("/out/b"), total, Pipeline::Standard);
        b.succeeded = succeeded;
        b.failed = failed;
        b.fallback_pending = fallback_pending;
        b.updated_at = 1_000_000;
        b
    }

    #[test]
    fn test_complete_and_partially_failed() {
        let done = report(&batch(3, 3, 0, 0), 1_000_000, 36);
        assert_eq!(done.status, BatchStatus::Complete);
        assert_eq!(done.summary, "done");
        assert_eq!(done.progress_percent, 100.0);

        let partial = report(&batch(3, 2, 1, 0), 1_000_000, 36);
        assert_eq!(partial.status, BatchStatus::Complete);
        assert_eq!(partial.summary, "partially failed");
        assert!(partial.has_failures);
    }

    #[test]
    fn test_fallback_pending_is_not_complete() {
        let r = report(&batch(3, 2, 0, 1), 1_000_000, 36);
        assert_eq!(r.status, BatchStatus::InProgress);
        assert_eq!(r.summary, "in fallback");
        assert!(r.in_fallback);
        assert_eq!(r.in_flight, 0);
    }

    #[test]
    fn test_stalled_after_audit_window() {
        let b = batch(3, 1, 0, 0);
        assert_eq!(classify(&b, 1_000_000 + 36_000, 36), BatchStatus::InProgress);
        assert_eq!(classify(&b, 1_000_000 + 36_001, 36), BatchStatus::Stalled);
        // Complete batches never stall
        assert_eq!(classify(&batch(1, 1, 0, 0), i64::MAX, 36), BatchStatus::Complete);
    }

    #[test]
    fn test_counter_change_clears_stall() {
        let registry = Arc::new(BatchRegistry::new(Arc::new(MemoryKvStore::new())));
        let b = Batch::new("b", PathBuf::from("/in/b"), PathBuf::from("/out/b"), 2, Pipeline::Standard);
        registry.claim_batch(&b, &[]).unwrap();
        let aggregator = ProgressAggregator::new(registry.clone(), 0);

        let later = b.updated_at + 10_000;
        assert_eq!(aggregator.status("b", later).unwrap().unwrap().status, BatchStatus::Stalled);

        let updated = registry.apply_delta("b", CounterDelta { succeeded: 1, ..Default::default() }).unwrap();
        let status = aggregator.status("b", updated.updated_at).unwrap().unwrap();
        assert_eq!(status.status, BatchStatus::InProgress);
        assert!(aggregator.status("missing", later).unwrap().is_none());
    }

    #[test]
    fn test_cancelled_batch_is_reported_and_never_stalls() {
        let mut b = batch(3, 1, 2, 0);
        b.cancelled_at = Some(1_000_500);
        let r = report(&b, i64::MAX, 36);
        assert_eq!(r.status, BatchStatus::Cancelled);
        assert_eq!(r.summary, "cancelled");
        assert_eq!(r.cancelled_at, Some(1_000_500));
        assert!(!r.stalled);

        let registry = Arc::new(BatchRegistry::new(Arc::new(MemoryKvStore::new())));
        let b = Batch::new("c", PathBuf::from("/in/c"), PathBuf::from("/out/c"), 0, Pipeline::Standard);
        registry.claim_batch(&b, &[]).unwrap();
        assert_eq!(registry.cancel_batch("c").unwrap(), 0);
        // An empty batch is complete on creation, so there is nothing to cancel
        let aggregator = ProgressAggregator::new(registry, 36);
        assert_eq!(aggregator.status("c", b.updated_at).unwrap().unwrap().status, BatchStatus::Complete);
    }

    #[test]
    fn test_auditor_warns_once_per_stall() {
        let mut auditor = StallAuditor::new();
        let stalled = report(&batch(3, 1, 0, 0), 1_000_000 + 100_000, 36);
        assert_eq!(auditor.audit(&[stalled.clone()]), vec!["b".to_string()]);
        assert!(auditor.audit(&[stalled.clone()]).is_empty());

        let resumed = report(&batch(3, 2, 0, 0), 1_000_000, 36);
        assert!(auditor.audit(&[resumed]).is_empty());
        assert_eq!(auditor.audit(&[stalled]), vec!["b".to_string()]);
    }

    // **Property: Status classification**
    //
    // *For any* counters within bounds, a batch is complete iff
    // succeeded + failed == total and nothing is pending a fallback, and
    // progress never exceeds 100%.
    proptest! {
        #![proptest_config(ProptestConfig { max_global_rejects: 100_000, ..ProptestConfig::with_cases(100) })]

        #[test]
        fn prop_complete_iff_all_resolved(
            total in 0u64..50,
            s in 0u64..50,
            f in 0u64..50,
            p in 0u64..50,
        ) {
            prop_assume!(s + f + p <= total);
            let r = report(&batch(total, s, f, p), 1_000_000, 36);
            prop_assert_eq!(r.status == BatchStatus::Complete, s + f == total && p == 0);
            prop_assert!(r.progress_percent <= 100.0);
            prop_assert_eq!(r.succeeded + r.failed + r.fallback_pending + r.in_flight, total);
        }
    }
}
