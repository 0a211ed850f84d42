//! Docling batch orchestrator
//!
//! Watches a directory for batch folders, converts every document with a
//! worker pool, re-routes failures once to the alternate pipeline and keeps
//! durable per-batch progress.

pub mod aggregator;
pub mod broker;
pub mod daemon;
pub mod dispatcher;
pub mod engine;
pub mod jobs;
pub mod ledger;
pub mod lifecycle;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod router;
pub mod startup;
pub mod status_server;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod watcher;
pub mod worker;

pub use docling_orchestrator_config as config;
pub use docling_orchestrator_config::{Config, Pipeline, ResolvedConfig};
pub use aggregator::{classify, BatchReport, BatchStatus, ProgressAggregator, StallAuditor};
pub use broker::{Broker, BrokerError, JobQueue, LocalBroker};
pub use daemon::{Daemon, DaemonError, RecoverySummary};
pub use dispatcher::{DispatchSummary, JobDispatcher, QueueNames};
pub use engine::{
    ConversionEngine, ConversionOutput, ConversionRequest, DoclingCommandEngine, DoclingSettings,
    EngineError,
};
pub use jobs::{current_timestamp_ms, Job, JobState};
pub use ledger::ProcessedLedger;
pub use lifecycle::{read_lock, DaemonLock, LifecycleError, LifecycleState, LockOwner};
pub use metrics::{collect_system_metrics, new_shared_status, SharedStatus, StatusReport, SystemMetrics};
pub use registry::{Batch, BatchRegistry, CounterDelta, FileRecord, RegistryError, TransitionOutcome};
pub use retry::RetryPolicy;
pub use router::{FallbackRouter, RouteOutcome};
pub use startup::{run_startup_checks, StartupError};
pub use status_server::{create_status_router, run_status_server, ServerError};
pub use store::{open_store, KvError, KvStore, MemoryKvStore, SqliteKvStore};
pub use watcher::{DirectoryWatcher, NewBatch};
