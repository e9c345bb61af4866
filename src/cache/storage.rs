//! Key-value storage trait and its SQLite and in-memory implementations.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Trait for storage backends.
///
/// Values live in named collections and are addressed by string key.
/// `list_all` returns values in first-insertion order; overwriting an
/// existing key keeps its position.
pub trait Storage: Send + Sync {
  /// Get a single value by key.
  fn get<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>>;

  /// Insert or overwrite a value.
  fn put<T: Serialize>(&self, collection: &str, key: &str, value: &T) -> Result<()>;

  /// Delete a value. Returns whether anything was removed.
  fn delete(&self, collection: &str, key: &str) -> Result<bool>;

  /// All values of a collection in insertion order.
  fn list_all<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>>;

  /// Remove every value whose collection name starts with `prefix`.
  fn clear(&self, prefix: &str) -> Result<()>;
}

/// SQLite-based storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open or create the store at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("tracksync").join("store.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    // journal_mode returns the new mode as a row
    conn
      .query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
      .map_err(|e| eyre!("Failed to enable WAL: {}", e))?;
    // Writes must reach disk before they return
    conn
      .pragma_update(None, "synchronous", "FULL")
      .map_err(|e| eyre!("Failed to set synchronous mode: {}", e))?;

    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for the store.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    collection TEXT NOT NULL,
    key TEXT NOT NULL,
    data BLOB NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (collection, key)
);

CREATE INDEX IF NOT EXISTS idx_kv_store_collection ON kv_store(collection);
"#;

impl Storage for SqliteStorage {
  fn get<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>> {
    let conn = self.lock()?;

    let data: Option<Vec<u8>> = conn
      .query_row(
        "SELECT data FROM kv_store WHERE collection = ? AND key = ?",
        params![collection, key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}/{}: {}", collection, key, e))?;

    match data {
      Some(data) => {
        let value = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize {}/{}: {}", collection, key, e))?;
        Ok(Some(value))
      }
      None => Ok(None),
    }
  }

  fn put<T: Serialize>(&self, collection: &str, key: &str, value: &T) -> Result<()> {
    let data =
      serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize {}/{}: {}", collection, key, e))?;
    let conn = self.lock()?;

    // ON CONFLICT keeps the rowid, so insertion order survives overwrites
    conn
      .execute(
        "INSERT INTO kv_store (collection, key, data, written_at)
         VALUES (?, ?, ?, datetime('now'))
         ON CONFLICT (collection, key) DO UPDATE
         SET data = excluded.data, written_at = excluded.written_at",
        params![collection, key, data],
      )
      .map_err(|e| eyre!("Failed to write {}/{}: {}", collection, key, e))?;

    Ok(())
  }

  fn delete(&self, collection: &str, key: &str) -> Result<bool> {
    let conn = self.lock()?;

    let removed = conn
      .execute(
        "DELETE FROM kv_store WHERE collection = ? AND key = ?",
        params![collection, key],
      )
      .map_err(|e| eyre!("Failed to delete {}/{}: {}", collection, key, e))?;

    Ok(removed > 0)
  }

  fn list_all<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT key, data FROM kv_store WHERE collection = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare listing of {}: {}", collection, e))?;

    let rows: Vec<(String, Vec<u8>)> = stmt
      .query_map(params![collection], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to list {}: {}", collection, e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read rows of {}: {}", collection, e))?;

    rows
      .into_iter()
      .map(|(key, data)| {
        serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize {}/{}: {}", collection, key, e))
      })
      .collect()
  }

  fn clear(&self, prefix: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "DELETE FROM kv_store WHERE substr(collection, 1, length(?1)) = ?1",
        params![prefix],
      )
      .map_err(|e| eyre!("Failed to clear {}: {}", prefix, e))?;

    Ok(())
  }
}

/// Storage kept entirely in memory. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStorage {
  collections: Mutex<HashMap<String, Vec<(String, Vec<u8>)>>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<(String, Vec<u8>)>>>> {
    self
      .collections
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl Storage for MemoryStorage {
  fn get<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>> {
    let collections = self.lock()?;

    let data = collections
      .get(collection)
      .and_then(|rows| rows.iter().find(|(k, _)| k == key))
      .map(|(_, data)| data);

    match data {
      Some(data) => Ok(Some(
        serde_json::from_slice(data).map_err(|e| eyre!("Failed to deserialize {}/{}: {}", collection, key, e))?,
      )),
      None => Ok(None),
    }
  }

  fn put<T: Serialize>(&self, collection: &str, key: &str, value: &T) -> Result<()> {
    let data =
      serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize {}/{}: {}", collection, key, e))?;
    let mut collections = self.lock()?;
    let rows = collections.entry(collection.to_string()).or_default();

    match rows.iter_mut().find(|(k, _)| k == key) {
      Some(row) => row.1 = data,
      None => rows.push((key.to_string(), data)),
    }

    Ok(())
  }

  fn delete(&self, collection: &str, key: &str) -> Result<bool> {
    let mut collections = self.lock()?;

    let Some(rows) = collections.get_mut(collection) else {
      return Ok(false);
    };
    let before = rows.len();
    rows.retain(|(k, _)| k != key);

    Ok(rows.len() != before)
  }

  fn list_all<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
    let collections = self.lock()?;

    collections
      .get(collection)
      .map(|rows| {
        rows
          .iter()
          .map(|(key, data)| {
            serde_json::from_slice(data)
              .map_err(|e| eyre!("Failed to deserialize {}/{}: {}", collection, key, e))
          })
          .collect()
      })
      .unwrap_or_else(|| Ok(Vec::new()))
  }

  fn clear(&self, prefix: &str) -> Result<()> {
    let mut collections = self.lock()?;
    collections.retain(|name, _| !name.starts_with(prefix));
    Ok(())
  }
}

/// Memory storage whose writes fail for collections under a prefix.
#[cfg(test)]
pub(crate) struct FailingStorage {
  inner: MemoryStorage,
  failing_prefix: &'static str,
}

#[cfg(test)]
impl FailingStorage {
  pub(crate) fn new(failing_prefix: &'static str) -> Self {
    Self {
      inner: MemoryStorage::new(),
      failing_prefix,
    }
  }
}

#[cfg(test)]
impl Storage for FailingStorage {
  fn get<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>> {
    self.inner.get(collection, key)
  }

  fn put<T: Serialize>(&self, collection: &str, key: &str, value: &T) -> Result<()> {
    if collection.starts_with(self.failing_prefix) {
      return Err(eyre!("Failed to write {}/{}: disk I/O error", collection, key));
    }
    self.inner.put(collection, key, value)
  }

  fn delete(&self, collection: &str, key: &str) -> Result<bool> {
    self.inner.delete(collection, key)
  }

  fn list_all<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
    self.inner.list_all(collection)
  }

  fn clear(&self, prefix: &str) -> Result<()> {
    self.inner.clear(prefix)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn exercise_ordering<S: Storage>(storage: &S) {
    storage.put("c", "b", &1u32).unwrap();
    storage.put("c", "a", &2u32).unwrap();
    storage.put("c", "b", &3u32).unwrap();

    let all: Vec<u32> = storage.list_all("c").unwrap();
    assert_eq!(all, vec![3, 2]);
  }

  #[test]
  fn test_overwrite_keeps_insertion_order() {
    exercise_ordering(&MemoryStorage::new());

    let dir = tempfile::tempdir().unwrap();
    exercise_ordering(&SqliteStorage::open_at(&dir.path().join("store.db")).unwrap());
  }

  #[test]
  fn test_get_delete_and_missing() {
    let storage = MemoryStorage::new();
    storage.put("c", "k", &"v").unwrap();

    assert_eq!(storage.get::<String>("c", "k").unwrap().as_deref(), Some("v"));
    assert!(storage.delete("c", "k").unwrap());
    assert!(!storage.delete("c", "k").unwrap());
    assert_eq!(storage.get::<String>("c", "k").unwrap(), None);
    assert!(storage.list_all::<String>("other").unwrap().is_empty());
  }

  #[test]
  fn test_clear_by_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SqliteStorage::open_at(&dir.path().join("store.db")).unwrap();
    storage.put("records:task", "t1", &1u32).unwrap();
    storage.put("records:habit", "h1", &2u32).unwrap();
    storage.put("queue", "q1", &3u32).unwrap();

    storage.clear("records:").unwrap();

    assert!(storage.list_all::<u32>("records:task").unwrap().is_empty());
    assert!(storage.list_all::<u32>("records:habit").unwrap().is_empty());
    assert_eq!(storage.list_all::<u32>("queue").unwrap(), vec![3]);
  }

  #[test]
  fn test_sqlite_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");

    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      storage.put("queue", "q1", &"pending").unwrap();
    }

    let storage = SqliteStorage::open_at(&path).unwrap();
    assert_eq!(
      storage.get::<String>("queue", "q1").unwrap().as_deref(),
      Some("pending")
    );
  }
}
