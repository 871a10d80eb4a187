//! Shared redb database handle for every control-plane table.
//!
//! redb allows a single `Database` per file per process, so the subscription,
//! task, sync-detail and lock tables all live in one file behind one handle.
//! Each table stores JSON-encoded values under string keys.
//!
//! redb serializes write transactions. Every read-modify-write below runs in
//! a single write transaction, which is what makes the upsert/union
//! operations atomic without client-side locking.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{db_err, Result};

/// Key: record id (or composite index key). Value: JSON bytes.
pub(crate) type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Cheaply cloneable handle to the control-plane database.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Open or create the redb database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path).map_err(db_err)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Create `table` if it doesn't already exist, so later read
    /// transactions can open it unconditionally.
    pub(crate) fn ensure_table(&self, table: JsonTable) -> Result<()> {
        let wt = self.db.begin_write().map_err(db_err)?;
        wt.open_table(table).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }
}

// ---------------------------------------------------------------------------
// JSON value helpers
// ---------------------------------------------------------------------------

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub(crate) fn read_json<T, Tbl>(table: &Tbl, key: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
    Tbl: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(db_err)? {
        Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
        None => Ok(None),
    }
}

pub(crate) fn read_key<Tbl>(table: &Tbl, key: &str) -> Result<Option<String>>
where
    Tbl: ReadableTable<&'static str, &'static [u8]>,
{
    let value = table.get(key).map_err(db_err)?;
    Ok(value.map(|g| String::from_utf8_lossy(g.value()).into_owned()))
}

/// Decode every value in `table`, in key order.
pub(crate) fn scan_json<T, Tbl>(table: &Tbl) -> Result<Vec<T>>
where
    T: DeserializeOwned,
    Tbl: ReadableTable<&'static str, &'static [u8]>,
{
    let mut result = Vec::new();
    for entry in table.iter().map_err(db_err)? {
        let (_, v) = entry.map_err(db_err)?;
        result.push(serde_json::from_slice(v.value())?);
    }
    Ok(result)
}

/// Composite index key. `\u{1f}` (unit separator) never appears in ids.
pub(crate) fn index_key(parts: &[&str]) -> String {
    parts.join("\u{1f}")
}
