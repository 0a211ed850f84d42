//! Status snapshot for the Docling batch orchestrator
//!
//! Provides the status report served over HTTP (lifecycle, batches, queues,
//! host metrics) with JSON serialization support.

use crate::aggregator::BatchReport;
use crate::lifecycle::LifecycleState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete daemon status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusReport {
    pub timestamp_unix_ms: i64,
    pub instance_id: String,
    pub pid: u32,
    pub lifecycle: LifecycleState,
    pub batches: Vec<BatchReport>,
    /// Jobs waiting per queue name
    pub queue_depths: BTreeMap<String, usize>,
    pub running_jobs: usize,
    /// Conversions finished by this daemon instance
    pub completed_files: u64,
    pub failed_files: u64,
    pub system: SystemMetrics,
}

/// Shared status for concurrent access across daemon components
pub type SharedStatus = Arc<RwLock<StatusReport>>;

impl Default for SystemMetrics {
    fn default() -> Self {
        Self {
            cpu_usage_percent: 0.0,
            mem_usage_percent: 0.0,
            load_avg_1: 0.0,
            load_avg_5: 0.0,
            load_avg_15: 0.0,
        }
    }
}

impl Default for StatusReport {
    fn default() -> Self {
        Self {
            timestamp_unix_ms: 0,
            instance_id: String::new(),
            pid: std::process::id(),
            lifecycle: LifecycleState::Stopped,
            batches: Vec::new(),
            queue_depths: BTreeMap::new(),
            running_jobs: 0,
            completed_files: 0,
            failed_files: 0,
            system: SystemMetrics::default(),
        }
    }
}

impl StatusReport {
    pub fn batch(&self, batch_id: &str) -> Option<&BatchReport> {
        self.batches.iter().find(|b| b.batch_id == batch_id)
    }
}

/// Creates a new SharedStatus instance with default values
pub fn new_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(StatusReport::default()))
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}
