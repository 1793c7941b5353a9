//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Report, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{CachedEntry, EntryMeta, GenerationMarker};
use crate::error::StorageError;
use crate::worker::types::{RequestIdentity, StoredResponse};

/// Trait for cache storage backends.
///
/// Every write replaces a whole entry; there is no partial update.
pub trait CacheStorage: Send + Sync {
  /// Create a store if it does not exist yet.
  fn create_store(&self, name: &str) -> Result<()>;

  /// Whether a store with exactly this name exists.
  fn has_store(&self, name: &str) -> Result<bool>;

  /// All store names, sorted.
  fn store_names(&self) -> Result<Vec<String>>;

  /// Delete a store and all of its entries. Returns whether it existed.
  fn delete_store(&self, name: &str) -> Result<bool>;

  /// Insert or overwrite the entry for an identity.
  fn put_entry(
    &self,
    store: &str,
    identity: &RequestIdentity,
    response: &StoredResponse,
  ) -> Result<()>;

  /// Write several entries into one store atomically: either all of them
  /// land (creating the store if needed) or none do.
  fn put_entries(
    &self,
    store: &str,
    entries: &[(RequestIdentity, StoredResponse)],
  ) -> Result<()>;

  /// Look up a single entry.
  fn get_entry(&self, store: &str, identity: &RequestIdentity) -> Result<Option<CachedEntry>>;

  /// Remove a single entry. Returns whether it existed.
  fn delete_entry(&self, store: &str, identity: &RequestIdentity) -> Result<bool>;

  /// Entry metadata ordered from oldest to newest write.
  fn entries(&self, store: &str) -> Result<Vec<EntryMeta>>;

  /// Number of entries in a store.
  fn entry_count(&self, store: &str) -> Result<usize>;

  /// Record how far the generation owning `shell_store` got.
  fn set_marker(&self, shell_store: &str, marker: GenerationMarker) -> Result<()>;

  /// The recorded marker; `None` if that generation never finished installing.
  fn marker(&self, shell_store: &str) -> Result<Option<GenerationMarker>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  /// Upper bound on the total stored body bytes
  quota_bytes: Option<u64>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// A private database that disappears with the process.
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
      quota_bytes: None,
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Limit the total number of body bytes the backend will hold.
  pub fn with_quota(mut self, quota_bytes: u64) -> Self {
    self.quota_bytes = Some(quota_bytes);
    self
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offline-cache").join("cache.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|_| Report::new(StorageError::LockPoisoned))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn used_bytes(conn: &Connection, excluding: Option<(&str, &str)>) -> Result<u64> {
    let used: i64 = match excluding {
      Some((store, hash)) => conn.query_row(
        "SELECT COALESCE(SUM(length(body)), 0) FROM cache_entries
         WHERE NOT (store = ?1 AND identity_hash = ?2)",
        params![store, hash],
        |row| row.get(0),
      ),
      None => conn.query_row(
        "SELECT COALESCE(SUM(length(body)), 0) FROM cache_entries",
        [],
        |row| row.get(0),
      ),
    }
    .map_err(|e| eyre!("Failed to compute cache usage: {}", e))?;

    Ok(used.max(0) as u64)
  }

  /// Quota check, store creation and row write, all inside the caller's
  /// transaction.
  fn insert_entry(
    &self,
    conn: &Connection,
    store: &str,
    identity: &RequestIdentity,
    response: &StoredResponse,
  ) -> Result<()> {
    let hash = identity.digest();
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    if let Some(quota) = self.quota_bytes {
      let used = Self::used_bytes(conn, Some((store, &hash)))?;
      let requested = response.body.len() as u64;
      if used + requested > quota {
        return Err(Report::new(StorageError::QuotaExceeded {
          quota,
          used,
          requested,
        }));
      }
    }

    let now = now_string();
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_stores (name, created_at) VALUES (?, ?)",
        params![store, now],
      )
      .map_err(|e| eyre!("Failed to create store {}: {}", store, e))?;

    let seq: i64 = conn
      .query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM cache_entries",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to allocate entry sequence: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries
           (store, identity_hash, method, url, status, headers, body, cached_at, seq)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          store,
          hash,
          identity.method,
          identity.url,
          response.status,
          headers,
          response.body,
          now,
          seq
        ],
      )
      .map_err(|e| eyre!("Failed to store entry {}: {}", identity, e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named stores; names compare case-sensitively (BINARY collation)
CREATE TABLE IF NOT EXISTS cache_stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- One row per (store, request identity)
CREATE TABLE IF NOT EXISTS cache_entries (
    store TEXT NOT NULL,
    identity_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    seq INTEGER NOT NULL,
    PRIMARY KEY (store, identity_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_seq ON cache_entries(store, seq);

-- Lifecycle progress per generation, keyed by its shell store
CREATE TABLE IF NOT EXISTS cache_generations (
    shell_store TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

impl CacheStorage for SqliteStorage {
  fn create_store(&self, name: &str) -> Result<()> {
    let conn = self.conn()?;

    if let Some(quota) = self.quota_bytes {
      let exists: bool = conn
        .query_row(
          "SELECT EXISTS(SELECT 1 FROM cache_stores WHERE name = ?)",
          params![name],
          |row| row.get(0),
        )
        .map_err(|e| eyre!("Failed to look up store {}: {}", name, e))?;
      let used = Self::used_bytes(&conn, None)?;
      if !exists && used >= quota {
        return Err(Report::new(StorageError::QuotaExceeded {
          quota,
          used,
          requested: 0,
        }));
      }
    }

    conn
      .execute(
        "INSERT OR IGNORE INTO cache_stores (name, created_at) VALUES (?, ?)",
        params![name, now_string()],
      )
      .map_err(|e| eyre!("Failed to create store {}: {}", name, e))?;

    Ok(())
  }

  fn has_store(&self, name: &str) -> Result<bool> {
    let conn = self.conn()?;
    conn
      .query_row(
        "SELECT EXISTS(SELECT 1 FROM cache_stores WHERE name = ?)",
        params![name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to look up store {}: {}", name, e))
  }

  fn store_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read store name: {}", e))?;

    Ok(names)
  }

  fn delete_store(&self, name: &str) -> Result<bool> {
    let conn = self.conn()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE store = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of store {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM cache_stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete store {}: {}", name, e))?;
    tx.execute(
      "DELETE FROM cache_generations WHERE shell_store = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to clear marker of store {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put_entry(
    &self,
    store: &str,
    identity: &RequestIdentity,
    response: &StoredResponse,
  ) -> Result<()> {
    let conn = self.conn()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    self.insert_entry(&tx, store, identity, response)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn put_entries(
    &self,
    store: &str,
    entries: &[(RequestIdentity, StoredResponse)],
  ) -> Result<()> {
    let conn = self.conn()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_stores (name, created_at) VALUES (?, ?)",
      params![store, now_string()],
    )
    .map_err(|e| eyre!("Failed to create store {}: {}", store, e))?;

    // An early return drops the transaction, rolling every insert back
    for (identity, response) in entries {
      self.insert_entry(&tx, store, identity, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get_entry(&self, store: &str, identity: &RequestIdentity) -> Result<Option<CachedEntry>> {
    let conn = self.conn()?;

    let row: Option<(u16, String, Vec<u8>, String, i64)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at, seq FROM cache_entries
         WHERE store = ? AND identity_hash = ?",
        params![store, identity.digest()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", identity, e))?;

    match row {
      Some((status, headers, body, cached_at, seq)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", identity, e))?;
        Ok(Some(CachedEntry {
          response: StoredResponse {
            status,
            headers,
            body,
          },
          cached_at: parse_datetime(&cached_at)?,
          seq,
        }))
      }
      None => Ok(None),
    }
  }

  fn delete_entry(&self, store: &str, identity: &RequestIdentity) -> Result<bool> {
    let conn = self.conn()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE store = ? AND identity_hash = ?",
        params![store, identity.digest()],
      )
      .map_err(|e| eyre!("Failed to delete {}: {}", identity, e))?;
    Ok(removed > 0)
  }

  fn entries(&self, store: &str) -> Result<Vec<EntryMeta>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT method, url, cached_at, seq FROM cache_entries
         WHERE store = ?
         ORDER BY seq",
      )
      .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

    let rows = stmt
      .query_map(params![store], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, i64>(3)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    rows
      .into_iter()
      .map(|(method, url, cached_at, seq)| {
        Ok(EntryMeta {
          identity: RequestIdentity { method, url },
          cached_at: parse_datetime(&cached_at)?,
          seq,
        })
      })
      .collect()
  }

  fn entry_count(&self, store: &str) -> Result<usize> {
    let conn = self.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE store = ?",
        params![store],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries: {}", e))?;
    Ok(count.max(0) as usize)
  }

  fn set_marker(&self, shell_store: &str, marker: GenerationMarker) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO cache_generations (shell_store, state, updated_at)
         VALUES (?, ?, ?)",
        params![shell_store, marker.as_str(), now_string()],
      )
      .map_err(|e| eyre!("Failed to record {} for {}: {}", marker, shell_store, e))?;
    Ok(())
  }

  fn marker(&self, shell_store: &str) -> Result<Option<GenerationMarker>> {
    let conn = self.conn()?;
    let state: Option<String> = conn
      .query_row(
        "SELECT state FROM cache_generations WHERE shell_store = ?",
        params![shell_store],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read marker for {}: {}", shell_store, e))?;

    state.map(|s| s.parse()).transpose()
  }
}

fn now_string() -> String {
  Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored RFC 3339 timestamp.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
