//! Docling command-line engine
//!
//! Builds and runs `docling` conversions for both pipelines. The VLM
//! pipeline adds the model selection and, when configured, a local
//! artifacts directory.

use super::{ConversionEngine, ConversionOutput, ConversionRequest, EngineError};
use crate::config::{Config, Pipeline};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::debug;

/// Longest stderr excerpt carried into an error.
const STDERR_EXCERPT: usize = 2000;

/// Settings for running the docling CLI
#[derive(Debug, Clone, PartialEq)]
pub struct DoclingSettings {
    /// Executable name or path
    pub command: String,
    /// Appended to every invocation
    pub extra_args: Vec<String>,
    /// Model for the VLM pipeline
    pub vlm_model: String,
    /// Local model artifacts for the VLM pipeline
    pub artifacts_path: Option<PathBuf>,
    /// Zero disables the limit
    pub soft_time_limit: Duration,
}

impl DoclingSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            command: config.engine.command.clone(),
            extra_args: config.engine.extra_args.clone(),
            vlm_model: config.vlm_fallback.model.clone(),
            artifacts_path: config.vlm_fallback.artifacts_path.clone(),
            soft_time_limit: Duration::from_secs(config.celery.task_soft_time_limit),
        }
    }
}

/// Output file docling writes for `input`: `<output_dir>/<stem>.md`
pub fn expected_output_path(input: &Path, output_dir: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    output_dir.join(format!("{}.md", stem))
}

/// Build a docling command for one request
///
/// # Arguments
/// * `settings` - Command, model and extra arguments
/// * `request` - Input file, output directory and pipeline
///
/// # Returns
/// A configured Command ready for execution
pub fn build_docling_command(settings: &DoclingSettings, request: &ConversionRequest) -> Command {
    let mut cmd = Command::new(&settings.command);

    cmd.arg(&request.input_path);
    cmd.arg("--to").arg("md");
    cmd.arg("--output").arg(&request.output_dir);

    if request.pipeline == Pipeline::Vlm {
        cmd.arg("--pipeline").arg("vlm");
        cmd.arg("--vlm-model").arg(&settings.vlm_model);
        if let Some(artifacts) = &settings.artifacts_path {
            cmd.arg("--artifacts-path").arg(artifacts);
        }
    }

    cmd.args(&settings.extra_args);
    cmd
}

/// Runs the docling CLI as a child process
pub struct DoclingCommandEngine {
    settings: DoclingSettings,
}

impl DoclingCommandEngine {
    pub fn new(settings: DoclingSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &DoclingSettings {
        &self.settings
    }
}

#[async_trait]
impl ConversionEngine for DoclingCommandEngine {
    async fn convert(&self, request: &ConversionRequest) -> Result<ConversionOutput, EngineError> {
        tokio::fs::create_dir_all(&request.output_dir).await?;

        let mut cmd = tokio::process::Command::from(build_docling_command(&self.settings, request));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(job_id = %request.job_id, pipeline = %request.pipeline, "Starting docling");

        // Dropping the output future on timeout kills the child
        let output = if self.settings.soft_time_limit.is_zero() {
            cmd.output().await?
        } else {
            match tokio::time::timeout(self.settings.soft_time_limit, cmd.output()).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(EngineError::Timeout(self.settings.soft_time_limit.as_secs()))
                }
            }
        };

        if !output.status.success() {
            return match output.status.code() {
                Some(code) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
                    Err(EngineError::Failed {
                        code,
                        stderr: excerpt,
                    })
                }
                None => Err(EngineError::Terminated),
            };
        }

        let output_file = expected_output_path(&request.input_path, &request.output_dir);
        if !output_file.is_file() {
            return Err(EngineError::MissingOutput(output_file));
        }
        Ok(ConversionOutput { output_file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    /// Helper to check if args contain a flag with a specific value
    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn settings() -> DoclingSettings {
        DoclingSettings {
            command: "docling".to_string(),
            extra_args: vec![],
            vlm_model: "granite_vision".to_string(),
            artifacts_path: None,
            soft_time_limit: Duration::from_secs(30),
        }
    }

    fn request(pipeline: Pipeline) -> ConversionRequest {
        ConversionRequest {
            job_id: "b:doc.pdf:1".to_string(),
            input_path: PathBuf::from("/in/b/doc.pdf"),
            output_dir: PathBuf::from("/out/b"),
            pipeline,
        }
    }

    #[test]
    fn test_standard_command() {
        let cmd = build_docling_command(&settings(), &request(Pipeline::Standard));
        let args = get_command_args(&cmd);

        assert_eq!(cmd.get_program(), std::ffi::OsStr::new("docling"));
        assert_eq!(args[0], "/in/b/doc.pdf");
        assert!(has_flag_with_value(&args, "--to", "md"));
        assert!(has_flag_with_value(&args, "--output", "/out/b"));
        assert!(!args.iter().any(|a| a == "--pipeline"));
        assert!(!args.iter().any(|a| a == "--vlm-model"));
    }

    #[test]
    fn test_vlm_command_with_artifacts() {
        let mut s = settings();
        s.artifacts_path = Some(PathBuf::from("/models"));
        s.extra_args = vec!["--verbose".to_string()];
        let args = get_command_args(&build_docling_command(&s, &request(Pipeline::Vlm)));

        assert!(has_flag_with_value(&args, "--pipeline", "vlm"));
        assert!(has_flag_with_value(&args, "--vlm-model", "granite_vision"));
        assert!(has_flag_with_value(&args, "--artifacts-path", "/models"));
        assert_eq!(args.last().map(String::as_str), Some("--verbose"));
    }

    #[test]
    fn test_expected_output_path() {
        assert_eq!(
            expected_output_path(Path::new("/in/b/Annual Report.PDF"), Path::new("/out/b")),
            PathBuf::from("/out/b/Annual Report.md")
        );
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.vlm_fallback.model = "smoldocling".to_string();
        config.celery.task_soft_time_limit = 12;
        let s = DoclingSettings::from_config(&config);
        assert_eq!(s.command, "docling");
        assert_eq!(s.vlm_model, "smoldocling");
        assert_eq!(s.soft_time_limit, Duration::from_secs(12));
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let mut s = settings();
        s.command = "docling-binary-that-does-not-exist".to_string();
        let dir = tempfile::TempDir::new().unwrap();
        let mut req = request(Pipeline::Standard);
        req.output_dir = dir.path().join("out");

        let engine = DoclingCommandEngine::new(s);
        assert!(matches!(engine.convert(&req).await, Err(EngineError::Io(_))));
    }

    // **Property: Mode symmetry in command construction**
    //
    // *For any* input name, only the pipeline decides the vlm flags; input
    // and output arguments are identical for both pipelines.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_pipeline_only_adds_vlm_flags(name in "[a-zA-Z0-9_-]{1,20}") {
            let mut standard = request(Pipeline::Standard);
            standard.input_path = PathBuf::from(format!("/in/b/{}.pdf", name));
            let mut vlm = standard.clone();
            vlm.pipeline = Pipeline::Vlm;

            let s_args = get_command_args(&build_docling_command(&settings(), &standard));
            let v_args = get_command_args(&build_docling_command(&settings(), &vlm));

            prop_assert_eq!(&v_args[..s_args.len()], &s_args[..]);
            prop_assert_eq!(v_args.len(), s_args.len() + 4);
        }
    }
}
