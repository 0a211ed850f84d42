//! Scripted conversion engine for tests. Built only with the `testing`
//! feature, which the crate's own dev-dependencies enable.
//!
//! Writes a small markdown file per successful conversion and fails or
//! hangs on the (file, pipeline) pairs it is told to.

use crate::config::Pipeline;
use crate::engine::{expected_output_path, ConversionEngine, ConversionOutput, ConversionRequest, EngineError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
enum Script {
    /// Fail this many more times, then succeed.
    Fail(usize),
    /// Never return.
    Hang,
}

/// Every request the engine received, in order.
pub type CallLog = Arc<Mutex<Vec<ConversionRequest>>>;

#[derive(Default)]
pub struct ScriptedEngine {
    scripts: Mutex<HashMap<(String, Pipeline), Script>>,
    delay: Duration,
    calls: CallLog,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always fail `file_name` on `pipeline`.
    pub fn fail_on(self, file_name: &str, pipeline: Pipeline) -> Self {
        self.fail_times(file_name, pipeline, usize::MAX)
    }

    /// Fail `file_name` on `pipeline` for the first `times` calls.
    pub fn fail_times(self, file_name: &str, pipeline: Pipeline, times: usize) -> Self {
        self.script(file_name, pipeline, Script::Fail(times))
    }

    /// Never finish converting `file_name` on `pipeline`.
    pub fn hang_on(self, file_name: &str, pipeline: Pipeline) -> Self {
        self.script(file_name, pipeline, Script::Hang)
    }

    /// Sleep this long before every conversion.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }

    fn script(self, file_name: &str, pipeline: Pipeline, script: Script) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert((file_name.to_string(), pipeline), script);
        }
        self
    }

    /// Consume one scripted outcome for the request.
    fn next_outcome(&self, request: &ConversionRequest) -> Option<Script> {
        let file_name = request
            .input_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut scripts = self.scripts.lock().ok()?;
        let entry = scripts.get_mut(&(file_name, request.pipeline))?;
        match entry {
            Script::Hang => Some(Script::Hang),
            Script::Fail(0) => None,
            Script::Fail(remaining) => {
                let current = *remaining;
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                Some(Script::Fail(current))
            }
        }
    }
}

#[async_trait]
impl ConversionEngine for ScriptedEngine {
    async fn convert(&self, request: &ConversionRequest) -> Result<ConversionOutput, EngineError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.next_outcome(request) {
            Some(Script::Hang) => std::future::pending().await,
            Some(Script::Fail(_)) => Err(EngineError::Rejected(format!(
                "scripted failure for {} on {}",
                request.input_path.display(),
                request.pipeline
            ))),
            None => {
                tokio::fs::create_dir_all(&request.output_dir).await?;
                let output_file = expected_output_path(&request.input_path, &request.output_dir);
                let body = format!(
                    "# {}\n\nConverted with the {} pipeline.\n",
                    request.input_path.display(),
                    request.pipeline
                );
                tokio::fs::write(&output_file, body).await?;
                Ok(ConversionOutput { output_file })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn request(dir: &TempDir, pipeline: Pipeline) -> ConversionRequest {
        ConversionRequest {
            job_id: "b:a.pdf:1".to_string(),
            input_path: PathBuf::from("/in/b/a.pdf"),
            output_dir: dir.path().join("out"),
            pipeline,
        }
    }

    #[tokio::test]
    async fn test_success_writes_markdown() {
        let dir = TempDir::new().unwrap();
        let engine = ScriptedEngine::new();
        let output = engine.convert(&request(&dir, Pipeline::Standard)).await.unwrap();
        assert_eq!(output.output_file, dir.path().join("out").join("a.md"));
        assert!(output.output_file.is_file());
        assert_eq!(engine.calls().lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fail_times_then_succeeds() {
        let dir = TempDir::new().unwrap();
        let engine = ScriptedEngine::new().fail_times("a.pdf", Pipeline::Vlm, 1);
        assert!(engine.convert(&request(&dir, Pipeline::Vlm)).await.is_err());
        assert!(engine.convert(&request(&dir, Pipeline::Vlm)).await.is_ok());
        assert!(engine.convert(&request(&dir, Pipeline::Standard)).await.is_ok());
    }

    #[tokio::test]
    async fn test_hang_never_completes() {
        let dir = TempDir::new().unwrap();
        let engine = ScriptedEngine::new().hang_on("a.pdf", Pipeline::Standard);
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            engine.convert(&request(&dir, Pipeline::Standard)),
        )
        .await;
        assert!(result.is_err());
    }
}
