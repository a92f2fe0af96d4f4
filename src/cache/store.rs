//! Shared handle over a cache storage backend.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;

use super::storage::{CacheStorage, MemoryStorage};
use super::traits::CacheEntry;
use crate::http::Response;

/// Tiered cache, cheap to clone and shared by every component that reads or
/// writes cached responses.
#[derive(Clone)]
pub struct CacheStore {
  storage: Arc<dyn CacheStorage>,
}

impl CacheStore {
  pub fn new(storage: impl CacheStorage + 'static) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  /// Volatile store backed by [`MemoryStorage`].
  pub fn in_memory() -> Self {
    Self::new(MemoryStorage::new())
  }

  /// Open (creating if needed) the tier `name` bounded to `capacity` entries.
  pub fn open(&self, name: &str, capacity: usize) -> Result<TierHandle> {
    if capacity == 0 {
      return Err(eyre!("Cache tier {} needs a positive capacity", name));
    }
    self.storage.ensure_tier(name, capacity)?;

    Ok(TierHandle {
      name: name.to_string(),
      capacity,
      storage: Arc::clone(&self.storage),
    })
  }

  pub fn get(&self, tier: &str, key: &str) -> Result<Option<CacheEntry>> {
    self.storage.get(tier, key)
  }

  /// Insert into an open tier, evicting its oldest entries to stay within
  /// capacity. Returns the evicted keys.
  pub fn put(&self, tier: &str, key: &str, response: &Response) -> Result<Vec<String>> {
    self.storage.put(tier, key, response)
  }

  pub fn keys(&self, tier: &str) -> Result<Vec<String>> {
    self.storage.keys(tier)
  }

  pub fn delete(&self, tier: &str, key: &str) -> Result<bool> {
    self.storage.delete(tier, key)
  }

  pub fn delete_tier(&self, tier: &str) -> Result<bool> {
    self.storage.delete_tier(tier)
  }

  pub fn list_tier_names(&self) -> Result<Vec<String>> {
    self.storage.tier_names()
  }

  /// Look `key` up in every tier, in tier-name order.
  pub fn lookup_any(&self, key: &str) -> Result<Option<CacheEntry>> {
    for tier in self.storage.tier_names()? {
      if let Some(entry) = self.storage.get(&tier, key)? {
        return Ok(Some(entry));
      }
    }
    Ok(None)
  }
}

/// An open tier.
#[derive(Clone)]
pub struct TierHandle {
  name: String,
  capacity: usize,
  storage: Arc<dyn CacheStorage>,
}

impl TierHandle {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    self.storage.get(&self.name, key)
  }

  pub fn put(&self, key: &str, response: &Response) -> Result<Vec<String>> {
    self.storage.put(&self.name, key, response)
  }

  pub fn keys(&self) -> Result<Vec<String>> {
    self.storage.keys(&self.name)
  }

  pub fn delete(&self, key: &str) -> Result<bool> {
    self.storage.delete(&self.name, key)
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.keys()?.len())
  }
}

impl std::fmt::Debug for TierHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TierHandle")
      .field("name", &self.name)
      .field("capacity", &self.capacity)
      .finish_non_exhaustive()
  }
}
