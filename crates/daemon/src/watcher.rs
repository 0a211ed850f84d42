//! Directory watcher: discovers new batch directories.
//!
//! Each immediate, non-hidden subdirectory of the watch root is a candidate
//! batch. A directory with at least one eligible document is claimed in the
//! ledger together with its batch and file records; a claimed directory is
//! never looked at again.

use crate::config::{Config, Pipeline};
use crate::jobs::Job;
use crate::ledger::ProcessedLedger;
use crate::registry::{Batch, BatchRegistry, FileRecord, RegistryError};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Checks if a file name ends with one of `extensions` (case-insensitive).
///
/// Extensions are given with their leading dot, e.g. `.pdf`.
pub fn is_eligible_file(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            extensions.iter().any(|e| e.to_lowercase() == ext_lower)
        })
        .unwrap_or(false)
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Immediate non-hidden subdirectories of `root`, sorted by name.
pub fn candidate_directories(root: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .filter(|e| e.file_name().to_str().map(|n| !is_hidden(n)).unwrap_or(false))
        .map(|e| e.into_path())
        .collect();
    dirs.sort();
    dirs
}

/// Eligible documents directly inside `dir`, sorted by file name.
///
/// Hidden files and subdirectories are ignored; batches are flat.
pub fn eligible_files(dir: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_str().map(|n| !is_hidden(n)).unwrap_or(false))
        .filter(|e| is_eligible_file(e.path(), extensions))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// A batch created by a scan, ready for dispatch.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub batch: Batch,
    pub files: Vec<FileRecord>,
}

pub struct DirectoryWatcher {
    watch_directory: PathBuf,
    output_base_dir: PathBuf,
    extensions: Vec<String>,
    primary_mode: Pipeline,
    registry: Arc<BatchRegistry>,
    ledger: ProcessedLedger,
}

impl DirectoryWatcher {
    pub fn new(config: &Config, registry: Arc<BatchRegistry>) -> Self {
        let ledger = ProcessedLedger::new(registry.store().clone());
        Self {
            watch_directory: config.daemon.watch_directory.clone(),
            output_base_dir: config.daemon.output_base_dir.clone(),
            extensions: config.daemon.file_extensions.clone(),
            primary_mode: config.vlm_fallback.primary_mode,
            registry,
            ledger,
        }
    }

    pub fn watch_directory(&self) -> &Path {
        &self.watch_directory
    }

    /// One pass over the watch root.
    ///
    /// Returns the batches this pass created. Errors on a single directory
    /// are logged and the directory is retried next pass; a store error
    /// aborts the pass.
    pub fn scan_once(&self) -> Result<Vec<NewBatch>, RegistryError> {
        if let Err(e) = fs::create_dir_all(&self.watch_directory) {
            warn!(dir = %self.watch_directory.display(), error = %e, "Cannot create watch directory");
            return Ok(Vec::new());
        }

        let mut created = Vec::new();
        for dir in candidate_directories(&self.watch_directory) {
            let dir = match dir.canonicalize() {
                Ok(abs) => abs,
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "Skipping unreadable directory");
                    continue;
                }
            };
            if self.ledger.is_claimed(&dir)? {
                continue;
            }
            if let Some(new_batch) = self.try_claim(&dir)? {
                created.push(new_batch);
            }
        }
        Ok(created)
    }

    fn try_claim(&self, dir: &Path) -> Result<Option<NewBatch>, RegistryError> {
        let files = eligible_files(dir, &self.extensions);
        if files.is_empty() {
            debug!(dir = %dir.display(), "No eligible documents yet");
            return Ok(None);
        }

        let batch_id = match dir.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => return Ok(None),
        };
        let output_dir = self.output_base_dir.join(&batch_id);
        if let Err(e) = fs::create_dir_all(&output_dir) {
            warn!(dir = %output_dir.display(), error = %e, "Cannot create output directory; will retry");
            return Ok(None);
        }

        let batch = Batch::new(
            &batch_id,
            dir.to_path_buf(),
            output_dir.clone(),
            files.len() as u64,
            self.primary_mode,
        );
        let records: Vec<FileRecord> = files
            .iter()
            .filter_map(|path| {
                let name = path.file_name()?.to_string_lossy().into_owned();
                Some(FileRecord::from_job(&Job::primary(
                    &batch_id,
                    &name,
                    path.clone(),
                    output_dir.clone(),
                    self.primary_mode,
                )))
            })
            .collect();

        if !self.registry.claim_batch(&batch, &records)? {
            debug!(dir = %dir.display(), "Directory claimed by another watcher");
            return Ok(None);
        }

        info!(
            batch_id = %batch_id,
            dir = %dir.display(),
            files = records.len(),
            primary_mode = %self.primary_mode,
            "Claimed new batch"
        );
        Ok(Some(NewBatch {
            batch,
            files: records,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobState;
    use crate::store::MemoryKvStore;
    use proptest::prelude::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn pdf() -> Vec<String> {
        vec![".pdf".to_string()]
    }

    fn watcher(root: &TempDir, mode: Pipeline) -> (DirectoryWatcher, Arc<BatchRegistry>) {
        let mut config = Config::default();
        config.daemon.watch_directory = root.path().join("in");
        config.daemon.output_base_dir = root.path().join("out");
        config.vlm_fallback.primary_mode = mode;
        let registry = Arc::new(BatchRegistry::new(Arc::new(MemoryKvStore::new())));
        (DirectoryWatcher::new(&config, registry.clone()), registry)
    }

    fn make_batch_dir(root: &TempDir, name: &str, files: &[&str]) -> PathBuf {
        let dir = root.path().join("in").join(name);
        fs::create_dir_all(&dir).unwrap();
        for f in files {
            File::create(dir.join(f)).unwrap();
        }
        dir
    }

    #[test]
    fn test_is_eligible_file() {
        assert!(is_eligible_file(Path::new("/in/a/report.pdf"), &pdf()));
        assert!(is_eligible_file(Path::new("/in/a/report.PDF"), &pdf()));
        assert!(!is_eligible_file(Path::new("/in/a/report.docx"), &pdf()));
        assert!(!is_eligible_file(Path::new("/in/a/report"), &pdf()));
    }

    #[test]
    fn test_eligible_files_are_flat_and_sorted() {
        let root = TempDir::new().unwrap();
        let dir = make_batch_dir(&root, "b", &["c.pdf", "a.pdf", "notes.txt", ".hidden.pdf"]);
        fs::create_dir_all(dir.join("nested")).unwrap();
        File::create(dir.join("nested").join("deep.pdf")).unwrap();

        let names: Vec<String> = eligible_files(&dir, &pdf())
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.pdf", "c.pdf"]);
    }

    #[test]
    fn test_scan_claims_batch_once() {
        let root = TempDir::new().unwrap();
        make_batch_dir(&root, "batch-1", &["a.pdf", "b.pdf"]);
        let (watcher, registry) = watcher(&root, Pipeline::Standard);

        let created = watcher.scan_once().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].batch.batch_id, "batch-1");
        assert_eq!(created[0].batch.total, 2);
        assert!(created[0].files.iter().all(|f| f.state == JobState::Queued && f.attempt_count == 1));
        assert!(root.path().join("out").join("batch-1").is_dir());

        // Files added after the claim do not change the batch
        File::create(root.path().join("in").join("batch-1").join("c.pdf")).unwrap();
        assert!(watcher.scan_once().unwrap().is_empty());
        assert_eq!(registry.get("batch-1").unwrap().unwrap().total, 2);
    }

    #[test]
    fn test_empty_directory_is_not_claimed() {
        let root = TempDir::new().unwrap();
        make_batch_dir(&root, "pending", &["readme.txt"]);
        let (watcher, registry) = watcher(&root, Pipeline::Standard);

        assert!(watcher.scan_once().unwrap().is_empty());
        assert!(registry.list().unwrap().is_empty());

        File::create(root.path().join("in").join("pending").join("doc.pdf")).unwrap();
        assert_eq!(watcher.scan_once().unwrap().len(), 1);
    }

    #[test]
    fn test_hidden_directories_and_stray_files_are_ignored() {
        let root = TempDir::new().unwrap();
        make_batch_dir(&root, ".staging", &["a.pdf"]);
        File::create(root.path().join("in").join("loose.pdf")).unwrap();
        let (watcher, _) = watcher(&root, Pipeline::Standard);
        assert!(watcher.scan_once().unwrap().is_empty());
    }

    #[test]
    fn test_primary_mode_is_snapshotted() {
        let root = TempDir::new().unwrap();
        make_batch_dir(&root, "v", &["a.pdf"]);
        let (watcher, _) = watcher(&root, Pipeline::Vlm);
        let created = watcher.scan_once().unwrap();
        assert_eq!(created[0].batch.primary_mode, Pipeline::Vlm);
        assert_eq!(created[0].files[0].pipeline, Pipeline::Vlm);
    }

    #[test]
    fn test_two_watchers_claim_at_most_once() {
        let root = TempDir::new().unwrap();
        make_batch_dir(&root, "shared", &["a.pdf"]);
        let (first, registry) = watcher(&root, Pipeline::Standard);
        let second = DirectoryWatcher {
            watch_directory: first.watch_directory.clone(),
            output_base_dir: first.output_base_dir.clone(),
            extensions: pdf(),
            primary_mode: Pipeline::Vlm,
            registry: registry.clone(),
            ledger: ProcessedLedger::new(registry.store().clone()),
        };

        let a = first.scan_once().unwrap();
        let b = second.scan_once().unwrap();
        assert_eq!(a.len() + b.len(), 1);
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    // **Property: Extension filtering**
    //
    // *For any* file name, eligibility depends only on the extension,
    // compared case-insensitively against the configured list.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_extension_filtering(
            basename in "[a-zA-Z0-9_-]{1,20}",
            ext in prop_oneof![
                Just("pdf"), Just("PDF"), Just("Pdf"),
                Just("docx"), Just("txt"), Just("png"), Just("pdfx"),
            ],
        ) {
            let path = PathBuf::from(format!("/in/b/{}.{}", basename, ext));
            let expected = ext.eq_ignore_ascii_case("pdf");
            prop_assert_eq!(is_eligible_file(&path, &pdf()), expected);
        }
    }
}
