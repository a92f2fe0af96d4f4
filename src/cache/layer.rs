//! Cache layer that orchestrates caching strategies with network fetching.

use std::time::Duration;
use tracing::{debug, warn};

use super::store::{CacheStore, TierHandle};
use super::traits::{CacheEntry, Served};
use crate::error::TransportError;
use crate::http::{Request, RequestMode, Response};
use crate::transport::{send_bounded, SharedTransport};

/// Runs caching strategies against the cache store and the network.
///
/// No strategy returns an error: every failure path ends in a cached entry,
/// the offline document, or a synthetic response.
#[derive(Clone)]
pub struct CacheLayer {
  store: CacheStore,
  transport: SharedTransport,
  /// Upper bound for every network call
  timeout: Duration,
  /// Cache key of the offline fallback document
  offline_document: String,
}

impl CacheLayer {
  pub fn new(
    store: CacheStore,
    transport: SharedTransport,
    timeout: Duration,
    offline_document: impl Into<String>,
  ) -> Self {
    Self {
      store,
      transport,
      timeout,
      offline_document: offline_document.into(),
    }
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  /// Bounded network call with no caching involved.
  pub async fn fetch(&self, request: &Request) -> Result<Response, TransportError> {
    send_bounded(self.transport.as_ref(), request, self.timeout).await
  }

  /// Cache-first: serve from `tier` without touching the network on a hit.
  /// Network failure on a miss yields a synthetic 503.
  pub async fn cache_first(&self, tier: &TierHandle, request: &Request) -> Served {
    self
      .cache_first_or(tier, request, Response::unavailable())
      .await
  }

  /// Cache-first for capacity-bounded tiers. A network failure on a miss
  /// yields a synthetic 404 so a missing image never blocks a page.
  pub async fn cache_first_with_capacity(&self, tier: &TierHandle, request: &Request) -> Served {
    self.cache_first_or(tier, request, Response::not_found()).await
  }

  async fn cache_first_or(&self, tier: &TierHandle, request: &Request, on_failure: Response) -> Served {
    let key = request.cache_key();
    if let Some(entry) = lookup(tier, &key) {
      return Served::from_cache(entry);
    }

    match self.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          write(tier, request, &response);
        }
        Served::from_network(response)
      }
      Err(e) => {
        debug!("cache-first miss for {} and network failed: {}", key, e);
        Served::synthetic(on_failure)
      }
    }
  }

  /// Network-first: the network wins; the tier is consulted only when the
  /// network fails. Navigation requests fall back to the offline document.
  pub async fn network_first(&self, tier: &TierHandle, request: &Request) -> Served {
    let is_navigation = request.mode == RequestMode::Navigate;
    self.network_first_or(tier, request, is_navigation).await
  }

  /// Network-first for page loads: the offline document is always the last
  /// resort before a synthetic 503.
  pub async fn network_first_with_offline_fallback(
    &self,
    tier: &TierHandle,
    request: &Request,
  ) -> Served {
    self.network_first_or(tier, request, true).await
  }

  async fn network_first_or(&self, tier: &TierHandle, request: &Request, offline_fallback: bool) -> Served {
    let error = match self.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          write(tier, request, &response);
        }
        return Served::from_network(response);
      }
      Err(e) => e,
    };

    let key = request.cache_key();
    debug!("network-first falling back to cache for {}: {}", key, error);

    if let Some(entry) = lookup(tier, &key) {
      return Served::from_cache(entry);
    }

    if offline_fallback {
      if let Some(document) = self.offline_document() {
        return Served::fallback(document);
      }
    }

    Served::synthetic(Response::unavailable())
  }

  /// Stale-while-revalidate: a cached entry is returned at once while a
  /// detached task refreshes it; a miss waits for the network.
  pub async fn stale_while_revalidate(&self, tier: &TierHandle, request: &Request) -> Served {
    let key = request.cache_key();

    if let Some(entry) = lookup(tier, &key) {
      self.spawn_refresh(tier.clone(), request.clone());
      return Served::from_cache(entry);
    }

    match self.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          write(tier, request, &response);
        }
        Served::from_network(response)
      }
      Err(e) => {
        debug!("stale-while-revalidate miss for {} and network failed: {}", key, e);
        Served::synthetic(Response::unavailable())
      }
    }
  }

  /// Background refresh. Its outcome only affects the tier; failures are
  /// logged and dropped.
  fn spawn_refresh(&self, tier: TierHandle, request: Request) {
    let layer = self.clone();
    tokio::spawn(async move {
      match layer.fetch(&request).await {
        Ok(response) if response.is_success() => write(&tier, &request, &response),
        Ok(response) => debug!(
          "background refresh of {} returned {}, keeping cached copy",
          request.url, response.status
        ),
        Err(e) => warn!("background refresh of {} failed: {}", request.url, e),
      }
    });
  }

  fn offline_document(&self) -> Option<CacheEntry> {
    match self.store.lookup_any(&self.offline_document) {
      Ok(entry) => entry,
      Err(e) => {
        warn!("offline document lookup failed: {}", e);
        None
      }
    }
  }
}

/// Tier lookup where a storage error counts as a miss.
fn lookup(tier: &TierHandle, key: &str) -> Option<CacheEntry> {
  match tier.get(key) {
    Ok(entry) => entry,
    Err(e) => {
      warn!("cache read from {} failed, treating as miss: {}", tier.name(), e);
      None
    }
  }
}

/// Store a response unless the request is a mutation. Storage errors are
/// logged and dropped.
fn write(tier: &TierHandle, request: &Request, response: &Response) {
  if request.is_mutation() {
    return;
  }
  match tier.put(&request.cache_key(), response) {
    Ok(evicted) => {
      for key in evicted {
        debug!("evicted {} from {}", key, tier.name());
      }
    }
    Err(e) => warn!("cache write to {} failed: {}", tier.name(), e),
  }
}
