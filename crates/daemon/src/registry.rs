//! Batch registry: per-batch counters and per-file records in the store.
//!
//! Layout:
//! - `docling_batch:<batch_id>` holds the batch record and its counters
//! - `docling_batch:<batch_id>:file:<file_name>` holds one file's current attempt
//!
//! Counters only ever move through [`AtomicUpdate`] increments. Terminal
//! transitions are guarded by the file's current `job_id` and state, so a
//! late or duplicate report for a superseded attempt comes back as
//! [`TransitionOutcome::Stale`] instead of being counted twice.

use crate::config::Pipeline;
use crate::jobs::{current_timestamp_ms, Job, JobState};
use crate::retry::RetryPolicy;
use crate::store::{AtomicUpdate, FieldMap, KvError, KvStore, UpdateOutcome};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub const BATCH_KEY_PREFIX: &str = "docling_batch:";
pub const LEDGER_KEY: &str = "docling_processed_dirs";
pub const CANCELLED_ERROR: &str = "cancelled by operator";
const FILE_SEGMENT: &str = ":file:";

pub fn batch_key(batch_id: &str) -> String {
    format!("{}{}", BATCH_KEY_PREFIX, batch_id)
}

pub fn file_key(batch_id: &str, file_name: &str) -> String {
    format!("{}{}{}{}", BATCH_KEY_PREFIX, batch_id, FILE_SEGMENT, file_name)
}

fn files_prefix(batch_id: &str) -> String {
    format!("{}{}", batch_key(batch_id), FILE_SEGMENT)
}

/// Error type for registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("batch not found: {0}")]
    BatchNotFound(String),

    #[error("malformed record {key}: {reason}")]
    Malformed { key: String, reason: String },

    #[error(transparent)]
    Store(#[from] KvError),
}

impl RegistryError {
    /// Whether the operation may succeed if simply retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Store(e) if e.is_transient())
    }
}

/// Progress summary of one input directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: String,
    pub directory_path: PathBuf,
    pub output_dir: PathBuf,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub fallback_pending: u64,
    /// Pipeline used for first attempts; fixed when the batch is created.
    pub primary_mode: Pipeline,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    /// Set when an operator cancelled the batch.
    pub cancelled_at: Option<i64>,
}

impl Batch {
    pub fn new(
        batch_id: &str,
        directory_path: PathBuf,
        output_dir: PathBuf,
        total: u64,
        primary_mode: Pipeline,
    ) -> Self {
        let now = current_timestamp_ms();
        Self {
            batch_id: batch_id.to_string(),
            directory_path,
            output_dir,
            total,
            succeeded: 0,
            failed: 0,
            fallback_pending: 0,
            primary_mode,
            created_at: now,
            updated_at: now,
            completed_at: None,
            cancelled_at: None,
        }
    }

    /// Jobs on their primary attempt that have not resolved yet.
    pub fn in_flight(&self) -> u64 {
        self.total
            .saturating_sub(self.succeeded)
            .saturating_sub(self.failed)
            .saturating_sub(self.fallback_pending)
    }

    pub fn is_complete(&self) -> bool {
        self.succeeded + self.failed == self.total && self.fallback_pending == 0
    }

    fn to_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("batch_id".into(), self.batch_id.clone());
        fields.insert(
            "directory_path".into(),
            self.directory_path.to_string_lossy().into_owned(),
        );
        fields.insert(
            "output_dir".into(),
            self.output_dir.to_string_lossy().into_owned(),
        );
        fields.insert("total".into(), self.total.to_string());
        fields.insert("succeeded".into(), self.succeeded.to_string());
        fields.insert("failed".into(), self.failed.to_string());
        fields.insert("fallback_pending".into(), self.fallback_pending.to_string());
        fields.insert("primary_mode".into(), self.primary_mode.to_string());
        fields.insert("created_at".into(), self.created_at.to_string());
        fields.insert("updated_at".into(), self.updated_at.to_string());
        if let Some(at) = self.completed_at {
            fields.insert("completed_at".into(), at.to_string());
        }
        if let Some(at) = self.cancelled_at {
            fields.insert("cancelled_at".into(), at.to_string());
        }
        fields
    }

    fn from_fields(key: &str, fields: &FieldMap) -> Result<Self, RegistryError> {
        let reader = FieldReader { key, fields };
        Ok(Self {
            batch_id: reader.string("batch_id")?,
            directory_path: PathBuf::from(reader.string("directory_path")?),
            output_dir: PathBuf::from(reader.string("output_dir")?),
            total: reader.parse("total")?,
            succeeded: reader.parse("succeeded")?,
            failed: reader.parse("failed")?,
            fallback_pending: reader.parse("fallback_pending")?,
            primary_mode: reader.parse("primary_mode")?,
            created_at: reader.parse("created_at")?,
            updated_at: reader.parse("updated_at")?,
            completed_at: reader.optional("completed_at")?,
            cancelled_at: reader.optional("cancelled_at")?,
        })
    }
}

/// Current attempt of one file in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub batch_id: String,
    pub file_name: String,
    pub file_path: PathBuf,
    pub output_dir: PathBuf,
    pub job_id: String,
    pub pipeline: Pipeline,
    pub attempt_count: u8,
    pub state: JobState,
    /// Last failure reason.
    pub error: Option<String>,
    /// Converted document, once succeeded.
    pub output_file: Option<PathBuf>,
    pub updated_at: i64,
}

impl FileRecord {
    /// Record describing `job` in its current state.
    pub fn from_job(job: &Job) -> Self {
        Self {
            batch_id: job.batch_id.clone(),
            file_name: job.file_name.clone(),
            file_path: job.file_path.clone(),
            output_dir: job.output_dir.clone(),
            job_id: job.job_id.clone(),
            pipeline: job.pipeline,
            attempt_count: job.attempt_count,
            state: job.state,
            error: None,
            output_file: None,
            updated_at: job.updated_at,
        }
    }

    /// Rebuild the job this record describes (used when resubmitting after a restart).
    pub fn to_job(&self) -> Job {
        Job {
            job_id: self.job_id.clone(),
            batch_id: self.batch_id.clone(),
            file_name: self.file_name.clone(),
            file_path: self.file_path.clone(),
            output_dir: self.output_dir.clone(),
            pipeline: self.pipeline,
            attempt_count: self.attempt_count,
            state: self.state,
            created_at: self.updated_at,
            updated_at: self.updated_at,
        }
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = state;
        self.updated_at = current_timestamp_ms();
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_output(mut self, output_file: PathBuf) -> Self {
        self.output_file = Some(output_file);
        self
    }

    fn to_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("batch_id".into(), self.batch_id.clone());
        fields.insert("file_name".into(), self.file_name.clone());
        fields.insert(
            "file_path".into(),
            self.file_path.to_string_lossy().into_owned(),
        );
        fields.insert(
            "output_dir".into(),
            self.output_dir.to_string_lossy().into_owned(),
        );
        fields.insert("job_id".into(), self.job_id.clone());
        fields.insert("pipeline".into(), self.pipeline.to_string());
        fields.insert("attempt_count".into(), self.attempt_count.to_string());
        fields.insert("state".into(), self.state.to_string());
        fields.insert(
            "error".into(),
            self.error.clone().unwrap_or_default(),
        );
        fields.insert(
            "output_file".into(),
            self.output_file
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        fields.insert("updated_at".into(), self.updated_at.to_string());
        fields
    }

    fn from_fields(key: &str, fields: &FieldMap) -> Result<Self, RegistryError> {
        let reader = FieldReader { key, fields };
        let non_empty = |v: String| if v.is_empty() { None } else { Some(v) };
        Ok(Self {
            batch_id: reader.string("batch_id")?,
            file_name: reader.string("file_name")?,
            file_path: PathBuf::from(reader.string("file_path")?),
            output_dir: PathBuf::from(reader.string("output_dir")?),
            job_id: reader.string("job_id")?,
            pipeline: reader.parse("pipeline")?,
            attempt_count: reader.parse("attempt_count")?,
            state: reader.parse("state")?,
            error: fields.get("error").cloned().and_then(non_empty),
            output_file: fields
                .get("output_file")
                .cloned()
                .and_then(non_empty)
                .map(PathBuf::from),
            updated_at: reader.parse("updated_at")?,
        })
    }
}

struct FieldReader<'a> {
    key: &'a str,
    fields: &'a FieldMap,
}

impl FieldReader<'_> {
    fn string(&self, field: &str) -> Result<String, RegistryError> {
        self.fields
            .get(field)
            .cloned()
            .ok_or_else(|| RegistryError::Malformed {
                key: self.key.to_string(),
                reason: format!("missing field '{}'", field),
            })
    }

    fn parse<T: std::str::FromStr>(&self, field: &str) -> Result<T, RegistryError> {
        let raw = self.string(field)?;
        raw.parse::<T>().map_err(|_| RegistryError::Malformed {
            key: self.key.to_string(),
            reason: format!("invalid value {:?} for '{}'", raw, field),
        })
    }

    fn optional<T: std::str::FromStr>(&self, field: &str) -> Result<Option<T>, RegistryError> {
        match self.fields.get(field) {
            None => Ok(None),
            Some(_) => self.parse(field).map(Some),
        }
    }
}

/// Signed change to a batch's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub succeeded: i64,
    pub failed: i64,
    pub fallback_pending: i64,
}

impl CounterDelta {
    pub fn is_zero(&self) -> bool {
        self.succeeded == 0 && self.failed == 0 && self.fallback_pending == 0
    }
}

/// Result of a guarded file transition.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// The record was updated; holds the batch after the update.
    Applied(Batch),
    /// The record no longer describes the expected attempt; nothing changed.
    Stale,
}

/// Store-backed registry of batches and their file records.
pub struct BatchRegistry {
    store: Arc<dyn KvStore>,
}

impl BatchRegistry {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Claim `batch.directory_path` in the ledger and create the batch and its
    /// file records, all in one transaction. Returns false, writing nothing,
    /// if the directory was already claimed.
    ///
    /// File records left from an earlier claim of the same batch id are
    /// dropped in that transaction, so a re-claim after a ledger reset
    /// describes exactly the files found now.
    pub fn claim_batch(&self, batch: &Batch, files: &[FileRecord]) -> Result<bool, RegistryError> {
        let mut records = Vec::with_capacity(files.len() + 1);
        records.push((batch_key(&batch.batch_id), batch.to_fields()));
        for file in files {
            records.push((file_key(&file.batch_id, &file.file_name), file.to_fields()));
        }
        let member = batch.directory_path.to_string_lossy();
        let stale_files = files_prefix(&batch.batch_id);
        Ok(self.store.claim(LEDGER_KEY, &member, Some(&stale_files), &records)?)
    }

    /// Point read of a batch.
    pub fn get(&self, batch_id: &str) -> Result<Option<Batch>, RegistryError> {
        let key = batch_key(batch_id);
        match self.store.hget_all(&key)? {
            Some(fields) => Ok(Some(Batch::from_fields(&key, &fields)?)),
            None => Ok(None),
        }
    }

    /// All batches, ordered by batch id.
    pub fn list(&self) -> Result<Vec<Batch>, RegistryError> {
        let mut batches = Vec::new();
        for key in self.store.keys_with_prefix(BATCH_KEY_PREFIX)? {
            if key.contains(FILE_SEGMENT) {
                continue;
            }
            if let Some(fields) = self.store.hget_all(&key)? {
                batches.push(Batch::from_fields(&key, &fields)?);
            }
        }
        Ok(batches)
    }

    /// All file records of a batch, ordered by file name.
    pub fn files(&self, batch_id: &str) -> Result<Vec<FileRecord>, RegistryError> {
        let prefix = files_prefix(batch_id);
        let mut records = Vec::new();
        for key in self.store.keys_with_prefix(&prefix)? {
            if let Some(fields) = self.store.hget_all(&key)? {
                records.push(FileRecord::from_fields(&key, &fields)?);
            }
        }
        Ok(records)
    }

    pub fn file(&self, batch_id: &str, file_name: &str) -> Result<Option<FileRecord>, RegistryError> {
        let key = file_key(batch_id, file_name);
        match self.store.hget_all(&key)? {
            Some(fields) => Ok(Some(FileRecord::from_fields(&key, &fields)?)),
            None => Ok(None),
        }
    }

    /// Atomically add `delta` to a batch's counters and bump `updated_at`.
    pub fn apply_delta(&self, batch_id: &str, delta: CounterDelta) -> Result<Batch, RegistryError> {
        let update = self.counter_update(AtomicUpdate::new(), batch_id, delta);
        match self.run(batch_id, &update)? {
            TransitionOutcome::Applied(batch) => self.finish_if_complete(batch),
            // No guards, so this cannot happen
            TransitionOutcome::Stale => Err(RegistryError::BatchNotFound(batch_id.to_string())),
        }
    }

    /// Replace a file's record and apply `delta`, only if the stored record
    /// still has `expected_job_id` in `expected_state`.
    pub fn transition(
        &self,
        expected_job_id: &str,
        expected_state: JobState,
        record: &FileRecord,
        delta: CounterDelta,
    ) -> Result<TransitionOutcome, RegistryError> {
        let key = file_key(&record.batch_id, &record.file_name);
        let mut update = AtomicUpdate::new()
            .guard(&key, "job_id", Some(expected_job_id))
            .guard(&key, "state", Some(expected_state.as_str()));
        for (field, value) in record.to_fields() {
            update = update.set(&key, &field, value);
        }
        let update = self.counter_update(update, &record.batch_id, delta);

        match self.run(&record.batch_id, &update)? {
            TransitionOutcome::Applied(batch) => {
                Ok(TransitionOutcome::Applied(self.finish_if_complete(batch)?))
            }
            TransitionOutcome::Stale => {
                debug!(
                    job_id = %expected_job_id,
                    file = %record.file_name,
                    "Ignoring transition for superseded attempt"
                );
                Ok(TransitionOutcome::Stale)
            }
        }
    }

    /// [`transition`](Self::transition), retrying transient store errors.
    pub async fn transition_with_retry(
        &self,
        retry: &RetryPolicy,
        expected_job_id: &str,
        expected_state: JobState,
        record: &FileRecord,
        delta: CounterDelta,
    ) -> Result<TransitionOutcome, RegistryError> {
        retry
            .run("registry transition", RegistryError::is_transient, move || async move {
                self.transition(expected_job_id, expected_state, record, delta)
            })
            .await
    }

    /// Delete a batch record and all its file records.
    pub fn remove_batch(&self, batch_id: &str) -> Result<usize, RegistryError> {
        let prefix = files_prefix(batch_id);
        let mut removed = 0;
        for key in self.store.keys_with_prefix(&prefix)? {
            if self.store.delete(&key)? {
                removed += 1;
            }
        }
        if self.store.delete(&batch_key(batch_id))? {
            removed += 1;
        }
        Ok(removed)
    }

    /// Cancel a batch: mark it cancelled and fail every queued or running
    /// file through the same guarded transition workers use, so a result
    /// that arrives later is stale. Returns how many files were cancelled.
    ///
    /// A batch that is already complete is left untouched.
    pub fn cancel_batch(&self, batch_id: &str) -> Result<usize, RegistryError> {
        let batch = self
            .get(batch_id)?
            .ok_or_else(|| RegistryError::BatchNotFound(batch_id.to_string()))?;
        if batch.is_complete() {
            return Ok(0);
        }

        let key = batch_key(batch_id);
        let mark = AtomicUpdate::new()
            .guard(&key, "batch_id", Some(batch_id))
            .set_if_absent(&key, "cancelled_at", current_timestamp_ms().to_string());
        if let TransitionOutcome::Stale = self.run(batch_id, &mark)? {
            return Err(RegistryError::BatchNotFound(batch_id.to_string()));
        }

        let mut cancelled = 0;
        for record in self.files(batch_id)? {
            if !matches!(record.state, JobState::Queued | JobState::Running) {
                continue;
            }
            let delta = CounterDelta {
                failed: 1,
                fallback_pending: if record.to_job().is_fallback() { -1 } else { 0 },
                ..CounterDelta::default()
            };
            let expected_job_id = record.job_id.clone();
            let expected_state = record.state;
            let failed = record.with_state(JobState::Failed).with_error(CANCELLED_ERROR);
            // A worker may resolve the file first; its result stands
            if let TransitionOutcome::Applied(_) =
                self.transition(&expected_job_id, expected_state, &failed, delta)?
            {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    fn counter_update(&self, mut update: AtomicUpdate, batch_id: &str, delta: CounterDelta) -> AtomicUpdate {
        if delta.is_zero() {
            return update;
        }
        let key = batch_key(batch_id);
        update
            .increment(&key, "succeeded", delta.succeeded)
            .increment(&key, "failed", delta.failed)
            .increment(&key, "fallback_pending", delta.fallback_pending)
            .limit_sum(&key, &["succeeded", "failed", "fallback_pending"], "total")
            .set(&key, "updated_at", current_timestamp_ms().to_string())
    }

    fn run(&self, batch_id: &str, update: &AtomicUpdate) -> Result<TransitionOutcome, RegistryError> {
        let key = batch_key(batch_id);
        let outcome = self.store.apply(update).map_err(|e| match e {
            KvError::MissingKey(k) if k == key => RegistryError::BatchNotFound(batch_id.to_string()),
            other => RegistryError::Store(other),
        })?;

        match outcome {
            UpdateOutcome::GuardFailed { .. } => Ok(TransitionOutcome::Stale),
            UpdateOutcome::Applied(view) => match view.get(&key) {
                Some(fields) => Ok(TransitionOutcome::Applied(Batch::from_fields(&key, fields)?)),
                None => match self.get(batch_id)? {
                    Some(batch) => Ok(TransitionOutcome::Applied(batch)),
                    None => Err(RegistryError::BatchNotFound(batch_id.to_string())),
                },
            },
        }
    }

    /// Stamp `completed_at` the first time a batch reaches completion.
    fn finish_if_complete(&self, mut batch: Batch) -> Result<Batch, RegistryError> {
        if batch.is_complete() && batch.completed_at.is_none() {
            let now = current_timestamp_ms();
            let key = batch_key(&batch.batch_id);
            let update = AtomicUpdate::new().set_if_absent(&key, "completed_at", now.to_string());
            if let UpdateOutcome::Applied(view) = self.store.apply(&update)? {
                batch.completed_at = view
                    .get(&key)
                    .and_then(|f| f.get("completed_at"))
                    .and_then(|v| v.parse().ok());
            }
        }
        Ok(batch)
    }
}
