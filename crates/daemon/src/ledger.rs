//! Processed-directory ledger.
//!
//! Durable set of absolute directory paths that have been claimed as
//! batches. Claims themselves are written by [`BatchRegistry::claim_batch`]
//! together with the batch record; this module covers reads and the
//! operator reset paths.
//!
//! [`BatchRegistry::claim_batch`]: crate::registry::BatchRegistry::claim_batch

use crate::registry::{BatchRegistry, RegistryError, LEDGER_KEY};
use crate::store::KvStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub struct ProcessedLedger {
    store: Arc<dyn KvStore>,
}

impl ProcessedLedger {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn is_claimed(&self, dir: &Path) -> Result<bool, RegistryError> {
        Ok(self.store.sismember(LEDGER_KEY, &dir.to_string_lossy())?)
    }

    /// Every claimed directory, sorted.
    pub fn claimed(&self) -> Result<Vec<PathBuf>, RegistryError> {
        Ok(self
            .store
            .smembers(LEDGER_KEY)?
            .into_iter()
            .map(PathBuf::from)
            .collect())
    }

    /// Release one claim and drop the batch records created with it, so the
    /// directory is picked up again on the next scan.
    ///
    /// Returns whether the directory had been claimed.
    pub fn clear_claim(&self, dir: &Path, registry: &BatchRegistry) -> Result<bool, RegistryError> {
        let released = self.store.srem(LEDGER_KEY, &dir.to_string_lossy())?;
        if let Some(batch_id) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) {
            let removed = registry.remove_batch(&batch_id)?;
            info!(dir = %dir.display(), batch_id = %batch_id, removed, "Cleared directory claim");
        }
        Ok(released)
    }

    /// Forget every claim. Batch records stay readable.
    pub fn reset(&self) -> Result<usize, RegistryError> {
        let cleared = self.store.sclear(LEDGER_KEY)?;
        info!(cleared, "Reset processed-directory ledger");
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Pipeline;
    use crate::jobs::Job;
    use crate::registry::{Batch, FileRecord};
    use crate::store::MemoryKvStore;

    fn setup() -> (ProcessedLedger, BatchRegistry) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        (
            ProcessedLedger::new(store.clone()),
            BatchRegistry::new(store),
        )
    }

    fn claim(registry: &BatchRegistry, id: &str) {
        let batch = Batch::new(
            id,
            PathBuf::from(format!("/in/{}", id)),
            PathBuf::from(format!("/out/{}", id)),
            0,
            Pipeline::Standard,
        );
        assert!(registry.claim_batch(&batch, &[]).unwrap());
    }

    #[test]
    fn test_claimed_directories_are_listed() {
        let (ledger, registry) = setup();
        claim(&registry, "b");
        claim(&registry, "a");
        assert!(ledger.is_claimed(Path::new("/in/a")).unwrap());
        assert!(!ledger.is_claimed(Path::new("/in/c")).unwrap());
        assert_eq!(
            ledger.claimed().unwrap(),
            vec![PathBuf::from("/in/a"), PathBuf::from("/in/b")]
        );
    }

    #[test]
    fn test_clear_claim_removes_batch() {
        let (ledger, registry) = setup();
        claim(&registry, "a");
        assert!(ledger.clear_claim(Path::new("/in/a"), &registry).unwrap());
        assert!(!ledger.is_claimed(Path::new("/in/a")).unwrap());
        assert!(registry.get("a").unwrap().is_none());
        assert!(!ledger.clear_claim(Path::new("/in/a"), &registry).unwrap());
    }

    #[test]
    fn test_reclaim_after_reset_drops_removed_files() {
        let (ledger, registry) = setup();
        let record = |name: &str| {
            FileRecord::from_job(&Job::primary(
                "a",
                name,
                PathBuf::from("/in/a").join(name),
                PathBuf::from("/out/a"),
                Pipeline::Standard,
            ))
        };
        let batch = |total| Batch::new("a", PathBuf::from("/in/a"), PathBuf::from("/out/a"), total, Pipeline::Standard);

        let first = vec![record("1.pdf"), record("2.pdf"), record("3.pdf")];
        assert!(registry.claim_batch(&batch(3), &first).unwrap());
        ledger.reset().unwrap();

        // Only one file is left in the directory when it is claimed again
        assert!(registry.claim_batch(&batch(1), &[record("2.pdf")]).unwrap());
        let files = registry.files("a").unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name, "2.pdf");
        assert_eq!(registry.get("a").unwrap().unwrap().total, 1);
    }

    #[test]
    fn test_reset_keeps_batch_records() {
        let (ledger, registry) = setup();
        claim(&registry, "a");
        claim(&registry, "b");
        assert_eq!(ledger.reset().unwrap(), 2);
        assert!(ledger.claimed().unwrap().is_empty());
        assert_eq!(registry.list().unwrap().len(), 2);
    }
}
