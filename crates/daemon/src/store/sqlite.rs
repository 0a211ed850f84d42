//! SQLite-backed store shared by the daemon and the CLI.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use super::{evaluate, AtomicUpdate, FieldMap, KvError, KvStore, UpdateOutcome};

/// SQLite-backed [`KvStore`].
///
/// Write transactions are opened `IMMEDIATE` so concurrent processes
/// serialise on the database lock instead of failing at commit.
pub struct SqliteKvStore {
    conn: Mutex<Connection>,
}

impl SqliteKvStore {
    /// Open (or create) the database file, creating parent directories as needed.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, KvError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| KvError::Backend(format!("{}: {}", parent.display(), e)))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        // journal_mode returns the resulting mode as a row
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self, KvError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), KvError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_hash (
                key TEXT NOT NULL,
                field TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (key, field)
            );

            CREATE TABLE IF NOT EXISTS kv_set (
                name TEXT NOT NULL,
                member TEXT NOT NULL,
                PRIMARY KEY (name, member)
            );
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, KvError> {
        self.conn.lock().map_err(|_| KvError::Poisoned)
    }

    fn read_hash(conn: &Connection, key: &str) -> Result<Option<FieldMap>, KvError> {
        let mut stmt = conn.prepare_cached("SELECT field, value FROM kv_hash WHERE key = ?1")?;
        let rows = stmt.query_map(params![key], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut fields = FieldMap::new();
        for row in rows {
            let (field, value) = row?;
            fields.insert(field, value);
        }
        Ok(if fields.is_empty() { None } else { Some(fields) })
    }

    fn write_fields(tx: &Transaction<'_>, key: &str, fields: &FieldMap) -> Result<(), KvError> {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO kv_hash (key, field, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
        )?;
        for (field, value) in fields {
            stmt.execute(params![key, field, value])?;
        }
        Ok(())
    }
}

impl KvStore for SqliteKvStore {
    fn hget_all(&self, key: &str) -> Result<Option<FieldMap>, KvError> {
        let conn = self.lock()?;
        Self::read_hash(&conn, key)
    }

    fn hset_all(&self, key: &str, fields: &FieldMap) -> Result<(), KvError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Self::write_fields(&tx, key, fields)?;
        tx.commit()?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, KvError> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM kv_hash WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT key FROM kv_hash WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let keys = stmt
            .query_map(params![prefix], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn sadd(&self, set: &str, member: &str) -> Result<bool, KvError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO kv_set (name, member) VALUES (?1, ?2)",
            params![set, member],
        )?;
        Ok(inserted > 0)
    }

    fn srem(&self, set: &str, member: &str) -> Result<bool, KvError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM kv_set WHERE name = ?1 AND member = ?2",
            params![set, member],
        )?;
        Ok(removed > 0)
    }

    fn sismember(&self, set: &str, member: &str) -> Result<bool, KvError> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM kv_set WHERE name = ?1 AND member = ?2",
                params![set, member],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn smembers(&self, set: &str) -> Result<Vec<String>, KvError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare_cached("SELECT member FROM kv_set WHERE name = ?1 ORDER BY member")?;
        let members = stmt
            .query_map(params![set], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(members)
    }

    fn sclear(&self, set: &str) -> Result<usize, KvError> {
        let conn = self.lock()?;
        Ok(conn.execute("DELETE FROM kv_set WHERE name = ?1", params![set])?)
    }

    fn claim(
        &self,
        set: &str,
        member: &str,
        replace_prefix: Option<&str>,
        records: &[(String, FieldMap)],
    ) -> Result<bool, KvError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO kv_set (name, member) VALUES (?1, ?2)",
            params![set, member],
        )?;
        if inserted == 0 {
            // Dropping the transaction rolls back
            return Ok(false);
        }

        if let Some(prefix) = replace_prefix {
            tx.execute(
                "DELETE FROM kv_hash WHERE substr(key, 1, length(?1)) = ?1",
                params![prefix],
            )?;
        }
        for (key, fields) in records {
            tx.execute("DELETE FROM kv_hash WHERE key = ?1", params![key])?;
            Self::write_fields(&tx, key, fields)?;
        }
        tx.commit()?;
        Ok(true)
    }

    fn apply(&self, update: &AtomicUpdate) -> Result<UpdateOutcome, KvError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut view = BTreeMap::new();
        for key in update.touched_keys() {
            if let Some(fields) = Self::read_hash(&tx, &key)? {
                view.insert(key, fields);
            }
        }

        if let Some(failed) = evaluate(update, &mut view)? {
            return Ok(failed);
        }

        for (key, fields) in &view {
            Self::write_fields(&tx, key, fields)?;
        }
        tx.commit()?;
        Ok(UpdateOutcome::Applied(view))
    }
}
