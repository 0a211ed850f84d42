//! Conversion engines.

pub mod docling;

pub use docling::{build_docling_command, expected_output_path, DoclingCommandEngine, DoclingSettings};

use crate::config::Pipeline;
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

/// Error type for conversion operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Engine process exited with non-zero status
    #[error("engine failed with exit code {code}: {stderr}")]
    Failed { code: i32, stderr: String },

    /// Engine process was terminated by signal
    #[error("engine process was terminated by signal")]
    Terminated,

    /// Soft time limit reached; the process was killed
    #[error("conversion exceeded soft time limit of {0}s")]
    Timeout(u64),

    /// Engine reported success but the expected output is missing
    #[error("expected output not found: {0}")]
    MissingOutput(PathBuf),

    /// Scripted or otherwise deliberate refusal
    #[error("conversion rejected: {0}")]
    Rejected(String),

    /// IO error launching the engine or preparing directories
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One document to convert.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionRequest {
    pub job_id: String,
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub pipeline: Pipeline,
}

/// Result of a successful conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionOutput {
    pub output_file: PathBuf,
}

/// Converts one document with the requested pipeline.
#[async_trait]
pub trait ConversionEngine: Send + Sync {
    async fn convert(&self, request: &ConversionRequest) -> Result<ConversionOutput, EngineError>;
}
