//! Cache storage trait with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use super::traits::CacheEntry;
use crate::http::Response;

/// Trait for cache storage backends.
///
/// Every call is atomic with respect to other calls on the same backend:
/// a reader never observes a half-applied insert, eviction or tier deletion.
pub trait CacheStorage: Send + Sync {
  /// Create the tier if needed and record its capacity.
  fn ensure_tier(&self, tier: &str, capacity: usize) -> Result<()>;

  /// Get a single entry.
  fn get(&self, tier: &str, key: &str) -> Result<Option<CacheEntry>>;

  /// Insert or replace an entry, evicting the oldest entries first if the
  /// tier is full. Returns the evicted keys.
  fn put(&self, tier: &str, key: &str, response: &Response) -> Result<Vec<String>>;

  /// Keys of a tier in insertion order.
  fn keys(&self, tier: &str) -> Result<Vec<String>>;

  /// Remove one entry. Returns whether it existed.
  fn delete(&self, tier: &str, key: &str) -> Result<bool>;

  /// Remove a whole tier. Returns whether it existed.
  fn delete_tier(&self, tier: &str) -> Result<bool>;

  /// Names of all tiers, sorted.
  fn tier_names(&self) -> Result<Vec<String>>;
}

/// Number of oldest entries to drop so that one more insert fits.
fn overflow(count: usize, capacity: usize) -> usize {
  (count + 1).saturating_sub(capacity)
}

// ============================================================================
// In-memory storage
// ============================================================================

struct MemoryTier {
  capacity: usize,
  entries: VecDeque<CacheEntry>,
}

/// Volatile storage, used when persistence is disabled and in tests.
#[derive(Default)]
pub struct MemoryStorage {
  tiers: Mutex<BTreeMap<String, MemoryTier>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, MemoryTier>>> {
    self.tiers.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn ensure_tier(&self, tier: &str, capacity: usize) -> Result<()> {
    let mut tiers = self.lock()?;
    tiers
      .entry(tier.to_string())
      .and_modify(|t| t.capacity = capacity)
      .or_insert_with(|| MemoryTier {
        capacity,
        entries: VecDeque::new(),
      });
    Ok(())
  }

  fn get(&self, tier: &str, key: &str) -> Result<Option<CacheEntry>> {
    let tiers = self.lock()?;
    Ok(
      tiers
        .get(tier)
        .and_then(|t| t.entries.iter().find(|e| e.key == key))
        .cloned(),
    )
  }

  fn put(&self, tier: &str, key: &str, response: &Response) -> Result<Vec<String>> {
    let mut tiers = self.lock()?;
    let t = tiers
      .get_mut(tier)
      .ok_or_else(|| eyre!("Cache tier {} is not open", tier))?;

    if let Some(existing) = t.entries.iter_mut().find(|e| e.key == key) {
      existing.response = response.clone();
      return Ok(Vec::new());
    }

    let excess = overflow(t.entries.len(), t.capacity);
    let evicted = t.entries.drain(..excess).map(|e| e.key).collect();

    t.entries.push_back(CacheEntry {
      key: key.to_string(),
      response: response.clone(),
      inserted_at: Utc::now(),
    });

    Ok(evicted)
  }

  fn keys(&self, tier: &str) -> Result<Vec<String>> {
    let tiers = self.lock()?;
    Ok(
      tiers
        .get(tier)
        .map(|t| t.entries.iter().map(|e| e.key.clone()).collect())
        .unwrap_or_default(),
    )
  }

  fn delete(&self, tier: &str, key: &str) -> Result<bool> {
    let mut tiers = self.lock()?;
    let Some(t) = tiers.get_mut(tier) else {
      return Ok(false);
    };
    let before = t.entries.len();
    t.entries.retain(|e| e.key != key);
    Ok(t.entries.len() != before)
  }

  fn delete_tier(&self, tier: &str) -> Result<bool> {
    Ok(self.lock()?.remove(tier).is_some())
  }

  fn tier_names(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.keys().cloned().collect())
  }
}

// ============================================================================
// SQLite storage
// ============================================================================

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_tiers (
    name TEXT PRIMARY KEY,
    capacity INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

-- seq preserves insertion order within a tier; replacing an entry keeps it
CREATE TABLE IF NOT EXISTS cache_entries (
    tier TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    seq INTEGER NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    inserted_at TEXT NOT NULL,
    PRIMARY KEY (tier, entry_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_seq ON cache_entries(tier, seq);
"#;

impl CacheStorage for SqliteStorage {
  fn ensure_tier(&self, tier: &str, capacity: usize) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT INTO cache_tiers (name, capacity, created_at) VALUES (?, ?, ?)
         ON CONFLICT(name) DO UPDATE SET capacity = excluded.capacity",
        params![tier, capacity as i64, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to open cache tier {}: {}", tier, e))?;

    Ok(())
  }

  fn get(&self, tier: &str, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, inserted_at FROM cache_entries
         WHERE tier = ? AND entry_key = ?",
        params![tier, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((status, headers, body, inserted_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;
        Ok(Some(CacheEntry {
          key: key.to_string(),
          response: Response {
            status,
            headers,
            body,
          },
          inserted_at: parse_datetime(&inserted_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, tier: &str, key: &str, response: &Response) -> Result<Vec<String>> {
    let mut conn = self.lock()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let capacity: i64 = tx
      .query_row(
        "SELECT capacity FROM cache_tiers WHERE name = ?",
        params![tier],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read tier capacity: {}", e))?
      .ok_or_else(|| eyre!("Cache tier {} is not open", tier))?;

    let replaced = tx
      .execute(
        "UPDATE cache_entries SET status = ?, headers = ?, body = ?
         WHERE tier = ? AND entry_key = ?",
        params![response.status, headers, response.body, tier, key],
      )
      .map_err(|e| eyre!("Failed to replace cache entry: {}", e))?;

    let mut evicted = Vec::new();
    if replaced == 0 {
      let count: i64 = tx
        .query_row(
          "SELECT COUNT(*) FROM cache_entries WHERE tier = ?",
          params![tier],
          |row| row.get(0),
        )
        .map_err(|e| eyre!("Failed to count cache entries: {}", e))?;

      let excess = overflow(count as usize, capacity as usize);
      if excess > 0 {
        evicted = {
          let mut stmt = tx
            .prepare("SELECT entry_key FROM cache_entries WHERE tier = ? ORDER BY seq LIMIT ?")
            .map_err(|e| eyre!("Failed to prepare eviction query: {}", e))?;
          let keys = stmt
            .query_map(params![tier, excess as i64], |row| row.get(0))
            .map_err(|e| eyre!("Failed to select entries to evict: {}", e))?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(|e| eyre!("Failed to read evicted key: {}", e))?;
          keys
        };

        for old in &evicted {
          tx.execute(
            "DELETE FROM cache_entries WHERE tier = ? AND entry_key = ?",
            params![tier, old],
          )
          .map_err(|e| eyre!("Failed to evict cache entry: {}", e))?;
        }
      }

      tx.execute(
        "INSERT INTO cache_entries (tier, entry_key, seq, status, headers, body, inserted_at)
         VALUES (?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM cache_entries WHERE tier = ?), ?, ?, ?, ?)",
        params![
          tier,
          key,
          tier,
          response.status,
          headers,
          response.body,
          Utc::now().to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(evicted)
  }

  fn keys(&self, tier: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT entry_key FROM cache_entries WHERE tier = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![tier], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query cache keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache key: {}", e))?;

    Ok(keys)
  }

  fn delete(&self, tier: &str, key: &str) -> Result<bool> {
    let conn = self.lock()?;

    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE tier = ? AND entry_key = ?",
        params![tier, key],
      )
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;

    Ok(removed > 0)
  }

  fn delete_tier(&self, tier: &str) -> Result<bool> {
    let mut conn = self.lock()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    tx.execute("DELETE FROM cache_entries WHERE tier = ?", params![tier])
      .map_err(|e| eyre!("Failed to delete tier entries: {}", e))?;
    let removed = tx
      .execute("DELETE FROM cache_tiers WHERE name = ?", params![tier])
      .map_err(|e| eyre!("Failed to delete tier: {}", e))?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn tier_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_tiers ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query cache tiers: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read tier name: {}", e))?;

    Ok(names)
  }
}

/// Parse a stored RFC 3339 timestamp.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
