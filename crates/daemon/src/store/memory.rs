//! Process-local store for tests and `memory://` deployments.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{evaluate, AtomicUpdate, FieldMap, KvError, KvStore, UpdateOutcome};

#[derive(Default)]
struct MemoryState {
    hashes: BTreeMap<String, FieldMap>,
    sets: HashMap<String, BTreeSet<String>>,
}

/// In-memory [`KvStore`]. One mutex serialises every operation.
#[derive(Default)]
pub struct MemoryKvStore {
    state: Mutex<MemoryState>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, KvError> {
        self.state.lock().map_err(|_| KvError::Poisoned)
    }
}

impl KvStore for MemoryKvStore {
    fn hget_all(&self, key: &str) -> Result<Option<FieldMap>, KvError> {
        Ok(self.lock()?.hashes.get(key).cloned())
    }

    fn hset_all(&self, key: &str, fields: &FieldMap) -> Result<(), KvError> {
        let mut state = self.lock()?;
        let record = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            record.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.lock()?.hashes.remove(key).is_some())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        Ok(self
            .lock()?
            .hashes
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn sadd(&self, set: &str, member: &str) -> Result<bool, KvError> {
        Ok(self
            .lock()?
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    fn srem(&self, set: &str, member: &str) -> Result<bool, KvError> {
        Ok(self
            .lock()?
            .sets
            .get_mut(set)
            .map(|s| s.remove(member))
            .unwrap_or(false))
    }

    fn sismember(&self, set: &str, member: &str) -> Result<bool, KvError> {
        Ok(self
            .lock()?
            .sets
            .get(set)
            .map(|s| s.contains(member))
            .unwrap_or(false))
    }

    fn smembers(&self, set: &str) -> Result<Vec<String>, KvError> {
        Ok(self
            .lock()?
            .sets
            .get(set)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn sclear(&self, set: &str) -> Result<usize, KvError> {
        Ok(self.lock()?.sets.remove(set).map(|s| s.len()).unwrap_or(0))
    }

    fn claim(
        &self,
        set: &str,
        member: &str,
        replace_prefix: Option<&str>,
        records: &[(String, FieldMap)],
    ) -> Result<bool, KvError> {
        let mut state = self.lock()?;
        let members = state.sets.entry(set.to_string()).or_default();
        if !members.insert(member.to_string()) {
            return Ok(false);
        }
        if let Some(prefix) = replace_prefix {
            state.hashes.retain(|key, _| !key.starts_with(prefix));
        }
        for (key, fields) in records {
            state.hashes.insert(key.clone(), fields.clone());
        }
        Ok(true)
    }

    fn apply(&self, update: &AtomicUpdate) -> Result<UpdateOutcome, KvError> {
        let mut state = self.lock()?;
        let mut view: BTreeMap<String, FieldMap> = update
            .touched_keys()
            .into_iter()
            .filter_map(|k| state.hashes.get(&k).cloned().map(|m| (k, m)))
            .collect();

        if let Some(failed) = evaluate(update, &mut view)? {
            return Ok(failed);
        }

        for (key, fields) in &view {
            state.hashes.insert(key.clone(), fields.clone());
        }
        Ok(UpdateOutcome::Applied(view))
    }
}
