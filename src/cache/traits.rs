//! Core types shared by cache storage and the strategies built on it.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::http::Response;

/// A stored response, owned by exactly one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  /// Normalized request key
  pub key: String,
  pub response: Response,
  /// When the key first entered the tier. Replacing the response keeps it.
  pub inserted_at: DateTime<Utc>,
}

/// Result of running a strategy, including where the response came from.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: ResponseSource,
}

impl Served {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
    }
  }

  pub fn from_cache(entry: CacheEntry) -> Self {
    Self {
      response: entry.response,
      source: ResponseSource::Cache,
    }
  }

  pub fn fallback(entry: CacheEntry) -> Self {
    Self {
      response: entry.response,
      source: ResponseSource::Fallback,
    }
  }

  pub fn synthetic(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Synthetic,
    }
  }

  pub fn queued(id: &str) -> Self {
    Self {
      response: Response::queued(id),
      source: ResponseSource::Queued,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseSource {
  /// Straight from the network
  Network,
  /// Entry of the strategy's tier
  Cache,
  /// The offline fallback document
  Fallback,
  /// Fabricated by the engine (503/404)
  Synthetic,
  /// Mutation accepted into the offline queue
  Queued,
}
