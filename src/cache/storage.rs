//! In-memory and SQLite cache storage backends.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, StatusCode};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use url::Url;

use super::traits::{CacheStorage, CachedResponse, RequestKey};
use crate::net::{Response, ResponseType};

/// Storage that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStorage {
  stores: Mutex<Vec<MemoryStore>>,
}

struct MemoryStore {
  name: String,
  entries: Vec<(RequestKey, CachedResponse)>,
}

impl MemoryStore {
  fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      entries: Vec::new(),
    }
  }

  fn insert(&mut self, key: RequestKey, response: Response) {
    let entry = CachedResponse {
      response,
      cached_at: Utc::now(),
    };
    match self.entries.iter_mut().find(|(k, _)| *k == key) {
      Some(existing) => existing.1 = entry,
      None => self.entries.push((key, entry)),
    }
  }
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, Vec<MemoryStore>>> {
    self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

fn store_mut<'a>(stores: &'a mut Vec<MemoryStore>, name: &str) -> &'a mut MemoryStore {
  match stores.iter().position(|s| s.name == name) {
    Some(index) => &mut stores[index],
    None => {
      stores.push(MemoryStore::new(name));
      let last = stores.len() - 1;
      &mut stores[last]
    }
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, name: &str) -> Result<()> {
    let mut stores = self.lock()?;
    store_mut(&mut stores, name);
    Ok(())
  }

  fn has(&self, name: &str) -> Result<bool> {
    Ok(self.lock()?.iter().any(|s| s.name == name))
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.iter().map(|s| s.name.clone()).collect())
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut stores = self.lock()?;
    let before = stores.len();
    stores.retain(|s| s.name != name);
    Ok(stores.len() != before)
  }

  fn match_entry(&self, name: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let stores = self.lock()?;
    Ok(
      stores
        .iter()
        .find(|s| s.name == name)
        .and_then(|s| s.entries.iter().find(|(k, _)| k == key))
        .map(|(_, cached)| cached.duplicate()),
    )
  }

  fn put(&self, name: &str, key: &RequestKey, response: Response) -> Result<()> {
    let mut stores = self.lock()?;
    store_mut(&mut stores, name).insert(key.clone(), response);
    Ok(())
  }

  fn put_existing(&self, name: &str, key: &RequestKey, response: Response) -> Result<bool> {
    let mut stores = self.lock()?;
    match stores.iter_mut().find(|s| s.name == name) {
      Some(store) => {
        store.insert(key.clone(), response);
        Ok(true)
      }
      None => Ok(false),
    }
  }

  fn put_all(&self, name: &str, entries: Vec<(RequestKey, Response)>) -> Result<()> {
    // One lock for the whole batch, nothing can observe a partial store
    let mut stores = self.lock()?;
    let store = store_mut(&mut stores, name);
    for (key, response) in entries {
      store.insert(key, response);
    }
    Ok(())
  }

  fn entries(&self, name: &str) -> Result<Vec<RequestKey>> {
    let stores = self.lock()?;
    Ok(
      stores
        .iter()
        .find(|s| s.name == name)
        .map(|s| s.entries.iter().map(|(k, _)| k.clone()).collect())
        .unwrap_or_default(),
    )
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the cache database at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open or create the cache database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
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

    Ok(data_dir.join("shellcache").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per versioned store
CREATE TABLE IF NOT EXISTS cache_stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses, keyed by the hashed request identity
CREATE TABLE IF NOT EXISTS cache_entries (
    store TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    response_type TEXT NOT NULL,
    response_url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store, entry_key),
    FOREIGN KEY (store) REFERENCES cache_stores(name) ON DELETE CASCADE
);
"#;

fn insert_store(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to create cache store {}: {}", name, e))?;
  Ok(())
}

fn insert_entry(conn: &Connection, name: &str, key: &RequestKey, response: &Response) -> Result<()> {
  let headers = serde_json::to_string(response.headers())
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (store, entry_key, method, url, status, response_type, response_url, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        name,
        key.cache_hash(),
        key.method().as_str(),
        key.url().as_str(),
        response.status().as_u16(),
        response.response_type().as_str(),
        response.url().as_str(),
        headers,
        &response.body()[..],
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {}: {}", key, e))?;

  Ok(())
}

/// Columns of a stored entry before conversion.
struct EntryRow {
  status: u16,
  response_type: String,
  response_url: String,
  headers: String,
  body: Vec<u8>,
  cached_at: String,
}

impl EntryRow {
  fn into_cached(self) -> Result<CachedResponse> {
    let status =
      StatusCode::from_u16(self.status).map_err(|e| eyre!("Invalid stored status: {}", e))?;
    let response_type = ResponseType::parse(&self.response_type)
      .ok_or_else(|| eyre!("Invalid stored response type '{}'", self.response_type))?;
    let url = Url::parse(&self.response_url)
      .map_err(|e| eyre!("Invalid stored url '{}': {}", self.response_url, e))?;
    let headers: Vec<(String, String)> = serde_json::from_str(&self.headers)
      .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;

    Ok(CachedResponse {
      response: Response::new(status, response_type, url, self.body).with_headers(headers),
      cached_at: parse_datetime(&self.cached_at)?,
    })
  }
}

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    insert_store(&conn, name)
  }

  fn has(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM cache_stores WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache store {}: {}", name, e))?;

    Ok(found.is_some())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache store name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE store = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM cache_stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache store {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn match_entry(&self, name: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT status, response_type, response_url, headers, body, cached_at
         FROM cache_entries WHERE store = ? AND entry_key = ?",
        params![name, key.cache_hash()],
        |row| {
          Ok(EntryRow {
            status: row.get(0)?,
            response_type: row.get(1)?,
            response_url: row.get(2)?,
            headers: row.get(3)?,
            body: row.get(4)?,
            cached_at: row.get(5)?,
          })
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    row.map(EntryRow::into_cached).transpose()
  }

  fn put(&self, name: &str, key: &RequestKey, response: Response) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    insert_store(&tx, name)?;
    insert_entry(&tx, name, key, &response)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn put_existing(&self, name: &str, key: &RequestKey, response: Response) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let exists: Option<i64> = tx
      .query_row(
        "SELECT 1 FROM cache_stores WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache store {}: {}", name, e))?;
    if exists.is_none() {
      return Ok(false);
    }

    insert_entry(&tx, name, key, &response)?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(true)
  }

  fn put_all(&self, name: &str, entries: Vec<(RequestKey, Response)>) -> Result<()> {
    let mut conn = self.lock()?;
    // Dropping the transaction on an early return rolls everything back
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    insert_store(&tx, name)?;
    for (key, response) in &entries {
      insert_entry(&tx, name, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn entries(&self, name: &str) -> Result<Vec<RequestKey>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT method, url FROM cache_entries WHERE store = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![name], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
      })
      .map_err(|e| eyre!("Failed to list entries of {}: {}", name, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    rows
      .into_iter()
      .map(|(method, url)| {
        let method = Method::from_bytes(method.as_bytes())
          .map_err(|e| eyre!("Invalid stored method '{}': {}", method, e))?;
        let url = Url::parse(&url).map_err(|e| eyre!("Invalid stored url '{}': {}", url, e))?;
        Ok(RequestKey::new(method, &url))
      })
      .collect()
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
