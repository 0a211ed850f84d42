//! Key-value store abstraction backing the batch registry and the ledger.
//!
//! The data model mirrors a small subset of Redis: flat hashes of string
//! fields and sets of string members. Everything that must change together
//! goes through [`KvStore::apply`] or [`KvStore::claim`], which run as a
//! single transaction in every implementation.

mod memory;
mod sqlite;

pub use memory::MemoryKvStore;
pub use sqlite::SqliteKvStore;

use crate::config::Config;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Field map of a single hash record.
pub type FieldMap = BTreeMap<String, String>;

/// Error type for store operations
#[derive(Debug, Error)]
pub enum KvError {
    /// The backend is locked by another writer; safe to retry.
    #[error("store busy: {0}")]
    Busy(String),

    /// Any other backend failure.
    #[error("store error: {0}")]
    Backend(String),

    /// An increment targeted a record that does not exist.
    #[error("record not found: {0}")]
    MissingKey(String),

    /// An increment would take a counter below zero or above its ceiling.
    #[error("counter {key}.{field} out of bounds: {value}")]
    OutOfBounds {
        key: String,
        field: String,
        value: i64,
    },

    /// A counter field holds a non-numeric value.
    #[error("corrupt value in {key}.{field}: {value:?}")]
    Corrupt {
        key: String,
        field: String,
        value: String,
    },

    /// Store URL not understood.
    #[error("unsupported store url: {0}")]
    UnsupportedUrl(String),

    #[error("store lock poisoned")]
    Poisoned,
}

impl KvError {
    /// Whether the operation may succeed if simply retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, KvError::Busy(_))
    }
}

impl From<rusqlite::Error> for KvError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                KvError::Busy(e.to_string())
            }
            _ => KvError::Backend(e.to_string()),
        }
    }
}

/// Precondition on a single field. `expected = None` means the field must be absent.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldGuard {
    pub key: String,
    pub field: String,
    pub expected: Option<String>,
}

/// Signed change to a numeric field. The result must stay >= 0.
#[derive(Debug, Clone, PartialEq)]
pub struct Increment {
    pub key: String,
    pub field: String,
    pub delta: i64,
}

/// Upper bound on the sum of several numeric fields of one record,
/// given by another field of the same record.
#[derive(Debug, Clone, PartialEq)]
pub struct SumLimit {
    pub key: String,
    pub fields: Vec<String>,
    pub ceiling_field: String,
}

/// Plain field write.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSet {
    pub key: String,
    pub field: String,
    pub value: String,
    /// Leave an existing value untouched.
    pub only_if_absent: bool,
}

/// A group of guards, increments and writes applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AtomicUpdate {
    pub guards: Vec<FieldGuard>,
    pub increments: Vec<Increment>,
    pub limits: Vec<SumLimit>,
    pub sets: Vec<FieldSet>,
}

impl AtomicUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(mut self, key: &str, field: &str, expected: Option<&str>) -> Self {
        self.guards.push(FieldGuard {
            key: key.to_string(),
            field: field.to_string(),
            expected: expected.map(str::to_string),
        });
        self
    }

    pub fn increment(mut self, key: &str, field: &str, delta: i64) -> Self {
        if delta != 0 {
            self.increments.push(Increment {
                key: key.to_string(),
                field: field.to_string(),
                delta,
            });
        }
        self
    }

    pub fn limit_sum(mut self, key: &str, fields: &[&str], ceiling_field: &str) -> Self {
        self.limits.push(SumLimit {
            key: key.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            ceiling_field: ceiling_field.to_string(),
        });
        self
    }

    pub fn set(mut self, key: &str, field: &str, value: impl Into<String>) -> Self {
        self.sets.push(FieldSet {
            key: key.to_string(),
            field: field.to_string(),
            value: value.into(),
            only_if_absent: false,
        });
        self
    }

    pub fn set_if_absent(mut self, key: &str, field: &str, value: impl Into<String>) -> Self {
        self.sets.push(FieldSet {
            key: key.to_string(),
            field: field.to_string(),
            value: value.into(),
            only_if_absent: true,
        });
        self
    }

    /// Every key read or written by this update, deduplicated.
    pub fn touched_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .guards
            .iter()
            .map(|g| g.key.clone())
            .chain(self.increments.iter().map(|i| i.key.clone()))
            .chain(self.limits.iter().map(|l| l.key.clone()))
            .chain(self.sets.iter().map(|s| s.key.clone()))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

/// Result of [`KvStore::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Everything was written. Holds the post-update state of each touched key.
    Applied(BTreeMap<String, FieldMap>),
    /// A guard did not hold; nothing was written.
    GuardFailed {
        key: String,
        field: String,
        actual: Option<String>,
    },
}

/// Key-value store used by the registry and ledger.
pub trait KvStore: Send + Sync {
    /// Read every field of a hash. `None` if the key does not exist.
    fn hget_all(&self, key: &str) -> Result<Option<FieldMap>, KvError>;

    /// Merge fields into a hash, creating it if needed.
    fn hset_all(&self, key: &str, fields: &FieldMap) -> Result<(), KvError>;

    /// Remove a hash. Returns whether it existed.
    fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// All hash keys starting with `prefix`, sorted.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    /// Add a member to a set. Returns false if it was already present.
    fn sadd(&self, set: &str, member: &str) -> Result<bool, KvError>;

    /// Remove a member from a set. Returns whether it was present.
    fn srem(&self, set: &str, member: &str) -> Result<bool, KvError>;

    fn sismember(&self, set: &str, member: &str) -> Result<bool, KvError>;

    /// All members of a set, sorted.
    fn smembers(&self, set: &str) -> Result<Vec<String>, KvError>;

    /// Remove every member of a set. Returns how many were removed.
    fn sclear(&self, set: &str) -> Result<usize, KvError>;

    /// Insert `member` into `set` and write `records` (replacing any existing
    /// fields of those keys) in one transaction, only if `member` was not
    /// already present. Returns false, writing nothing, if it was.
    ///
    /// With `replace_prefix`, every hash whose key starts with it is removed
    /// in the same transaction before `records` are written.
    fn claim(
        &self,
        set: &str,
        member: &str,
        replace_prefix: Option<&str>,
        records: &[(String, FieldMap)],
    ) -> Result<bool, KvError>;

    /// Apply guards, increments and writes atomically.
    fn apply(&self, update: &AtomicUpdate) -> Result<UpdateOutcome, KvError>;
}

/// Evaluate an update against an in-memory view of the touched records.
///
/// `view` holds the current contents of every existing touched key and is
/// modified in place. Shared by every backend so the semantics cannot drift.
pub(crate) fn evaluate(
    update: &AtomicUpdate,
    view: &mut BTreeMap<String, FieldMap>,
) -> Result<Option<UpdateOutcome>, KvError> {
    for guard in &update.guards {
        let actual = view.get(&guard.key).and_then(|m| m.get(&guard.field)).cloned();
        if actual != guard.expected {
            return Ok(Some(UpdateOutcome::GuardFailed {
                key: guard.key.clone(),
                field: guard.field.clone(),
                actual,
            }));
        }
    }

    for inc in &update.increments {
        let record = view
            .get_mut(&inc.key)
            .ok_or_else(|| KvError::MissingKey(inc.key.clone()))?;
        let current = read_counter(record, &inc.key, &inc.field)?;
        let value = current + inc.delta;
        if value < 0 {
            return Err(KvError::OutOfBounds {
                key: inc.key.clone(),
                field: inc.field.clone(),
                value,
            });
        }
        record.insert(inc.field.clone(), value.to_string());
    }

    // Limits are checked after all increments so paired moves are judged on the final state
    for limit in &update.limits {
        let record = view
            .get(&limit.key)
            .ok_or_else(|| KvError::MissingKey(limit.key.clone()))?;
        let mut sum = 0;
        for field in &limit.fields {
            sum += read_counter(record, &limit.key, field)?;
        }
        let ceiling = read_counter(record, &limit.key, &limit.ceiling_field)?;
        if sum > ceiling {
            return Err(KvError::OutOfBounds {
                key: limit.key.clone(),
                field: limit.fields.join("+"),
                value: sum,
            });
        }
    }

    for set in &update.sets {
        let record = view.entry(set.key.clone()).or_default();
        if set.only_if_absent && record.contains_key(&set.field) {
            continue;
        }
        record.insert(set.field.clone(), set.value.clone());
    }

    Ok(None)
}

fn read_counter(record: &FieldMap, key: &str, field: &str) -> Result<i64, KvError> {
    match record.get(field) {
        None => Ok(0),
        Some(raw) => raw.parse::<i64>().map_err(|_| KvError::Corrupt {
            key: key.to_string(),
            field: field.to_string(),
            value: raw.clone(),
        }),
    }
}

/// Open the store named by `redis.url`.
pub fn open_store(config: &Config) -> Result<Arc<dyn KvStore>, KvError> {
    let url = config.redis.url.as_str();
    if url.starts_with("memory://") {
        return Ok(Arc::new(MemoryKvStore::new()));
    }
    match config.store_path() {
        Some(path) => {
            let timeout = Duration::from_millis(config.store.busy_timeout_ms);
            Ok(Arc::new(SqliteKvStore::open(&path, timeout)?))
        }
        None => Err(KvError::UnsupportedUrl(url.to_string())),
    }
}
