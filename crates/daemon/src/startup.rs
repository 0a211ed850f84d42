//! Startup checks module for the Docling batch orchestrator
//!
//! Provides preflight checks to verify system requirements before starting the daemon:
//! - Conversion engine availability (`<command> --version`)
//! - Input, output and state directories exist or can be created

use crate::config::Config;
use std::fs;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Conversion engine not available: {0}")]
    EngineUnavailable(String),

    #[error("Cannot prepare directory {path}: {source}")]
    Directory {
        path: String,
        source: std::io::Error,
    },
}

/// Extract the first line of a `--version` output, trimmed.
///
/// Returns None when the output is blank.
pub fn parse_version_line(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Check if the conversion engine is available by running `<command> --version`
pub fn check_engine_available(command: &str) -> Result<String, StartupError> {
    let output = Command::new(command).arg("--version").output().map_err(|e| {
        StartupError::EngineUnavailable(format!(
            "{} --version failed; is docling installed and in PATH? Error: {}",
            command, e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::EngineUnavailable(format!(
            "{} --version exited with {}",
            command, output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_version_line(&stdout).unwrap_or_else(|| "unknown version".to_string()))
}

fn ensure_dir(path: &Path) -> Result<(), StartupError> {
    fs::create_dir_all(path).map_err(|source| StartupError::Directory {
        path: path.display().to_string(),
        source,
    })
}

/// Create the watch directory, output root and the lock file's parent.
pub fn prepare_directories(cfg: &Config) -> Result<(), StartupError> {
    ensure_dir(&cfg.daemon.watch_directory)?;
    ensure_dir(&cfg.daemon.output_base_dir)?;
    if let Some(parent) = cfg.daemon.lock_file.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    Ok(())
}

/// Run all startup checks in order
///
/// 1. Prepare directories
/// 2. Verify the conversion engine runs
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    prepare_directories(cfg)?;
    let version = check_engine_available(&cfg.engine.command)?;
    info!(engine = %cfg.engine.command, version = %version, "Conversion engine available");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_version_line_skips_leading_blank_lines(
            blanks in 0usize..4,
            version in "[a-zA-Z0-9 .]{1,30}",
        ) {
            prop_assume!(!version.trim().is_empty());
            let output = format!("{}{}\nmore detail\n", "\n".repeat(blanks), version);
            prop_assert_eq!(parse_version_line(&output), Some(version.trim().to_string()));
        }
    }

    #[test]
    fn test_parse_version_line_blank() {
        assert_eq!(parse_version_line(""), None);
        assert_eq!(parse_version_line("  \n\n"), None);
    }

    #[test]
    fn test_parse_docling_version_output() {
        let output = "Docling version: 2.15.1\nDocling Core version: 2.14.0\n";
        assert_eq!(
            parse_version_line(output),
            Some("Docling version: 2.15.1".to_string())
        );
    }

    #[test]
    fn test_missing_engine_is_reported() {
        let result = check_engine_available("docling-binary-that-does-not-exist");
        assert!(matches!(result, Err(StartupError::EngineUnavailable(_))));
    }

    #[test]
    fn test_prepare_directories_creates_all() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.daemon.watch_directory = dir.path().join("in");
        cfg.daemon.output_base_dir = dir.path().join("out");
        cfg.daemon.lock_file = dir.path().join("run").join("daemon.lock");

        prepare_directories(&cfg).unwrap();

        assert!(dir.path().join("in").is_dir());
        assert!(dir.path().join("out").is_dir());
        assert!(dir.path().join("run").is_dir());
    }
}
