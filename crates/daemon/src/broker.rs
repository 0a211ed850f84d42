//! Task-queue broker.
//!
//! Jobs are submitted by queue name and consumed by the worker pool of the
//! matching pipeline. Submission never blocks. In-process queues are
//! unbounded, so a submission only fails when the queue does not exist or
//! its consumers are gone.

use crate::jobs::Job;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("queue '{0}' is closed")]
    Closed(String),
}

/// Submission side of a task queue.
pub trait Broker: Send + Sync {
    fn submit(&self, queue: &str, job: Job) -> Result<(), BrokerError>;

    /// Jobs waiting in a queue, if the broker can tell.
    fn depth(&self, _queue: &str) -> Option<usize> {
        None
    }
}

/// Consumer side of a queue, shared by every worker of one pipeline.
#[derive(Clone)]
pub struct JobQueue {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    waiting: Arc<AtomicUsize>,
}

impl JobQueue {
    /// Next job, or None once every sender is gone and the queue is drained.
    pub async fn recv(&self) -> Option<Job> {
        let job = self.rx.lock().await.recv().await;
        if job.is_some() {
            self.waiting.fetch_sub(1, Ordering::AcqRel);
        }
        job
    }

    pub fn depth(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }
}

struct QueueSender {
    tx: mpsc::UnboundedSender<Job>,
    waiting: Arc<AtomicUsize>,
}

/// In-process broker backed by unbounded tokio channels.
pub struct LocalBroker {
    queues: HashMap<String, QueueSender>,
}

impl LocalBroker {
    /// Create one queue per name.
    pub fn new(names: &[&str]) -> (Self, HashMap<String, JobQueue>) {
        let mut queues = HashMap::new();
        let mut receivers = HashMap::new();
        for name in names {
            let (tx, rx) = mpsc::unbounded_channel();
            let waiting = Arc::new(AtomicUsize::new(0));
            queues.insert(
                name.to_string(),
                QueueSender {
                    tx,
                    waiting: waiting.clone(),
                },
            );
            receivers.insert(
                name.to_string(),
                JobQueue {
                    rx: Arc::new(Mutex::new(rx)),
                    waiting,
                },
            );
        }
        (Self { queues }, receivers)
    }
}

impl Broker for LocalBroker {
    fn submit(&self, queue: &str, job: Job) -> Result<(), BrokerError> {
        let sender = self
            .queues
            .get(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        // Count before sending so a fast consumer never underflows
        sender.waiting.fetch_add(1, Ordering::AcqRel);
        sender.tx.send(job).map_err(|_| {
            sender.waiting.fetch_sub(1, Ordering::AcqRel);
            BrokerError::Closed(queue.to_string())
        })
    }

    fn depth(&self, queue: &str) -> Option<usize> {
        self.queues
            .get(queue)
            .map(|q| q.waiting.load(Ordering::Acquire))
    }
}
