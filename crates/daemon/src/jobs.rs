//! Job model for single-document conversions.
//!
//! A job converts one file of a batch with one pipeline. A file gets at most
//! two jobs: the primary attempt and, if that fails, one attempt on the
//! alternate pipeline.

use crate::config::Pipeline;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Primary attempt plus one fallback.
pub const MAX_ATTEMPTS: u8 = 2;

/// State of a job (and of the per-file record that tracks it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Submitted to a queue, not yet picked up by a worker.
    Queued,
    /// A worker is converting the file.
    Running,
    /// Conversion produced output.
    Succeeded,
    /// Conversion failed and no further attempt will be made.
    Failed,
}

impl Default for JobState {
    fn default() -> Self {
        Self::Queued
    }
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }

    /// Check if the state is terminal (succeeded or failed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

/// A single conversion attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// `<batch_id>:<file_name>:<attempt>`
    pub job_id: String,
    pub batch_id: String,
    /// File name inside the batch directory.
    pub file_name: String,
    /// Absolute path of the input document.
    pub file_path: PathBuf,
    /// Directory that receives the converted output.
    pub output_dir: PathBuf,
    pub pipeline: Pipeline,
    /// 1 for the primary attempt, 2 for the fallback.
    pub attempt_count: u8,
    pub state: JobState,
    /// Unix timestamp (milliseconds) when the job was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) when the job was last updated.
    pub updated_at: i64,
}

/// Deterministic job id, unique per (batch, file, attempt).
pub fn job_id(batch_id: &str, file_name: &str, attempt: u8) -> String {
    format!("{}:{}:{}", batch_id, file_name, attempt)
}

impl Job {
    /// Create the first attempt for a file.
    pub fn primary(
        batch_id: &str,
        file_name: &str,
        file_path: PathBuf,
        output_dir: PathBuf,
        pipeline: Pipeline,
    ) -> Self {
        let now = current_timestamp_ms();
        Self {
            job_id: job_id(batch_id, file_name, 1),
            batch_id: batch_id.to_string(),
            file_name: file_name.to_string(),
            file_path,
            output_dir,
            pipeline,
            attempt_count: 1,
            state: JobState::Queued,
            created_at: now,
            updated_at: now,
        }
    }

    /// The fallback attempt on the alternate pipeline, or `None` once the
    /// attempt budget is spent.
    pub fn fallback(&self) -> Option<Job> {
        if self.attempt_count >= MAX_ATTEMPTS {
            return None;
        }
        let attempt = self.attempt_count + 1;
        let now = current_timestamp_ms();
        Some(Job {
            job_id: job_id(&self.batch_id, &self.file_name, attempt),
            batch_id: self.batch_id.clone(),
            file_name: self.file_name.clone(),
            file_path: self.file_path.clone(),
            output_dir: self.output_dir.clone(),
            pipeline: self.pipeline.alternate(),
            attempt_count: attempt,
            state: JobState::Queued,
            created_at: now,
            updated_at: now,
        })
    }

    /// Whether this attempt is the fallback (counted in `fallback_pending` while unresolved).
    pub fn is_fallback(&self) -> bool {
        self.attempt_count > 1
    }

    /// Update the job's updated_at timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    /// Set the job state and update timestamp.
    pub fn set_state(&mut self, state: JobState) {
        self.state = state;
        self.touch();
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pipeline_strategy() -> impl Strategy<Value = Pipeline> {
        prop_oneof![Just(Pipeline::Standard), Just(Pipeline::Vlm)]
    }

    fn make_job(pipeline: Pipeline) -> Job {
        Job::primary(
            "batch-a",
            "report.pdf",
            PathBuf::from("/in/batch-a/report.pdf"),
            PathBuf::from("/out/batch-a"),
            pipeline,
        )
    }

    #[test]
    fn test_job_id_format() {
        assert_eq!(job_id("b", "x.pdf", 1), "b:x.pdf:1");
        assert_eq!(make_job(Pipeline::Standard).job_id, "batch-a:report.pdf:1");
    }

    #[test]
    fn test_primary_job_defaults() {
        let job = make_job(Pipeline::Vlm);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.pipeline, Pipeline::Vlm);
        assert!(!job.is_fallback());
        assert!(!job.is_terminal());
    }

    #[test]
    fn test_set_state_updates_timestamp() {
        let mut job = make_job(Pipeline::Standard);
        job.updated_at = 0;
        job.set_state(JobState::Running);
        assert_eq!(job.state, JobState::Running);
        assert!(job.updated_at > 0);
    }

    #[test]
    fn test_job_state_parse_and_display() {
        for state in [
            JobState::Queued,
            JobState::Running,
            JobState::Succeeded,
            JobState::Failed,
        ] {
            assert_eq!(state.to_string().parse::<JobState>().unwrap(), state);
        }
        assert!("fallback".parse::<JobState>().is_err());
    }

    // **Property: Bounded fallback**
    //
    // *For any* primary pipeline, a file gets exactly one fallback attempt on
    // the alternate pipeline and never a third attempt.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_fallback_is_bounded_and_alternates(pipeline in pipeline_strategy()) {
            let primary = make_job(pipeline);
            let fallback = primary.fallback().expect("first attempt has a fallback");

            prop_assert_eq!(fallback.attempt_count, 2);
            prop_assert_eq!(fallback.pipeline, pipeline.alternate());
            prop_assert_ne!(&fallback.job_id, &primary.job_id);
            prop_assert_eq!(&fallback.job_id, &job_id("batch-a", "report.pdf", 2));
            prop_assert!(fallback.is_fallback());
            prop_assert!(fallback.fallback().is_none());
        }
    }
}
