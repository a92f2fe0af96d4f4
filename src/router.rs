//! Routes every intercepted request to the caching strategy of its class.

use color_eyre::Result;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::{CacheLayer, Served, TierHandle};
use crate::classify::{classify, ResourceClass};
use crate::config::TierSet;
use crate::http::{Request, Response};
use crate::queue::{endpoint_matches, NewMutation, SharedQueue};

/// Caching strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  CacheFirst,
  CacheFirstWithCapacity,
  NetworkFirst,
  NetworkFirstWithOfflineFallback,
  StaleWhileRevalidate,
}

/// Which tier of the current generation a strategy works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierKind {
  Static,
  Dynamic,
  Image,
}

/// The dispatch table: resource class to strategy and tier.
pub fn strategy_for(class: ResourceClass) -> (Strategy, TierKind) {
  match class {
    ResourceClass::StaticAsset => (Strategy::CacheFirst, TierKind::Static),
    ResourceClass::Image => (Strategy::CacheFirstWithCapacity, TierKind::Image),
    ResourceClass::ApiCall => (Strategy::NetworkFirst, TierKind::Dynamic),
    ResourceClass::Navigation => (Strategy::NetworkFirstWithOfflineFallback, TierKind::Dynamic),
    ResourceClass::Other => (Strategy::StaleWhileRevalidate, TierKind::Dynamic),
  }
}

/// Classifies requests and runs the matching strategy.
pub struct StrategyRouter {
  layer: CacheLayer,
  static_tier: TierHandle,
  dynamic_tier: TierHandle,
  image_tier: TierHandle,
  api_prefix: String,
  queue: SharedQueue,
  /// Endpoint paths whose failed mutations are queued for replay
  sync_endpoints: Vec<String>,
}

impl StrategyRouter {
  pub fn new(
    layer: CacheLayer,
    tiers: &TierSet,
    api_prefix: impl Into<String>,
    queue: SharedQueue,
    sync_endpoints: Vec<String>,
  ) -> Result<Self> {
    let store = layer.store().clone();
    Ok(Self {
      static_tier: store.open(&tiers.static_assets.name, tiers.static_assets.capacity)?,
      dynamic_tier: store.open(&tiers.dynamic.name, tiers.dynamic.capacity)?,
      image_tier: store.open(&tiers.image.name, tiers.image.capacity)?,
      layer,
      api_prefix: api_prefix.into(),
      queue,
      sync_endpoints,
    })
  }

  pub fn classify(&self, request: &Request) -> ResourceClass {
    classify(request, &self.api_prefix)
  }

  fn tier(&self, kind: TierKind) -> &TierHandle {
    match kind {
      TierKind::Static => &self.static_tier,
      TierKind::Dynamic => &self.dynamic_tier,
      TierKind::Image => &self.image_tier,
    }
  }

  /// Resolve an intercepted request. Never fails.
  pub async fn handle(&self, request: &Request) -> Response {
    self.route(request).await.response
  }

  /// Like [`handle`](Self::handle), keeping track of where the response came from.
  pub async fn route(&self, request: &Request) -> Served {
    let class = self.classify(request);
    let (strategy, kind) = strategy_for(class);
    let tier = self.tier(kind);

    let served = if class == ResourceClass::ApiCall && request.is_mutation() {
      self.mutate(tier, request).await
    } else {
      match strategy {
        Strategy::CacheFirst => self.layer.cache_first(tier, request).await,
        Strategy::CacheFirstWithCapacity => self.layer.cache_first_with_capacity(tier, request).await,
        Strategy::NetworkFirst => self.layer.network_first(tier, request).await,
        Strategy::NetworkFirstWithOfflineFallback => {
          self
            .layer
            .network_first_with_offline_fallback(tier, request)
            .await
        }
        Strategy::StaleWhileRevalidate => self.layer.stale_while_revalidate(tier, request).await,
      }
    };

    debug!(
      "{} {} [{:?} via {:?}] -> {} from {:?}",
      request.method, request.url, class, strategy, served.response.status, served.source
    );
    served
  }

  /// Mutations go to the network; if that fails and the endpoint is replayable
  /// the request is queued instead of lost.
  async fn mutate(&self, tier: &TierHandle, request: &Request) -> Served {
    if !self.is_sync_endpoint(request) {
      return self.layer.network_first(tier, request).await;
    }

    match self.layer.fetch(request).await {
      Ok(response) => Served::from_network(response),
      Err(e) => {
        debug!("mutation {} {} failed, queueing: {}", request.method, request.url, e);
        match self.queue.enqueue(NewMutation::from_request(request)) {
          Ok(pending) => Served::queued(&pending.id),
          Err(e) => {
            warn!("could not queue mutation for {}: {}", request.url, e);
            Served::synthetic(Response::unavailable())
          }
        }
      }
    }
  }

  fn is_sync_endpoint(&self, request: &Request) -> bool {
    self
      .sync_endpoints
      .iter()
      .any(|endpoint| endpoint_matches(&request.url, endpoint))
  }

  /// Straight to the network, bypassing every tier. Used before activation.
  pub async fn pass_through(&self, request: &Request) -> Served {
    match self.layer.fetch(request).await {
      Ok(response) => Served::from_network(response),
      Err(e) => {
        debug!("pass-through {} failed: {}", request.url, e);
        Served::synthetic(Response::unavailable())
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStore, ResponseSource};
  use crate::config::Config;
  use crate::db::Database;
  use crate::queue::OfflineMutationQueue;
  use crate::testing::FakeTransport;
  use reqwest::Method;
  use std::sync::Arc;
  use std::time::Duration;
  use url::Url;

  struct Fixture {
    router: StrategyRouter,
    transport: Arc<FakeTransport>,
    store: CacheStore,
    queue: SharedQueue,
    config: Config,
  }

  impl Fixture {
    fn url(&self, path: &str) -> Url {
      self.config.resolve(path).unwrap()
    }
  }

  fn fixture() -> Fixture {
    let config = Config::default();
    let transport = Arc::new(FakeTransport::new());
    let store = CacheStore::in_memory();
    let layer = CacheLayer::new(
      store.clone(),
      transport.clone(),
      Duration::from_secs(1),
      config.resolve(&config.offline_document).unwrap().to_string(),
    );
    let queue: SharedQueue = Arc::new(OfflineMutationQueue::new(
      Database::open_in_memory().unwrap(),
      transport.clone(),
      Duration::from_secs(1),
    ));
    let router = StrategyRouter::new(
      layer,
      &config.tier_set(),
      &config.api_prefix,
      queue.clone(),
      config.sync.values().cloned().collect(),
    )
    .unwrap();
    Fixture {
      router,
      transport,
      store,
      queue,
      config,
    }
  }

  #[test]
  fn test_dispatch_table() {
    assert_eq!(
      strategy_for(ResourceClass::StaticAsset),
      (Strategy::CacheFirst, TierKind::Static)
    );
    assert_eq!(
      strategy_for(ResourceClass::Image),
      (Strategy::CacheFirstWithCapacity, TierKind::Image)
    );
    assert_eq!(
      strategy_for(ResourceClass::ApiCall),
      (Strategy::NetworkFirst, TierKind::Dynamic)
    );
    assert_eq!(
      strategy_for(ResourceClass::Navigation),
      (Strategy::NetworkFirstWithOfflineFallback, TierKind::Dynamic)
    );
    assert_eq!(
      strategy_for(ResourceClass::Other),
      (Strategy::StaleWhileRevalidate, TierKind::Dynamic)
    );
  }

  #[tokio::test]
  async fn test_static_hit_makes_no_network_call() {
    let f = fixture();
    let request = Request::get(f.url("/assets/app.js"));
    f.store
      .put("static-v2", &request.cache_key(), &Response::ok("cached"))
      .unwrap();

    let response = f.router.handle(&request).await;
    assert_eq!(response.body_text(), "cached");
    assert_eq!(f.transport.call_count(), 0);
  }

  #[tokio::test]
  async fn test_static_miss_stores_one_entry() {
    let f = fixture();
    let request = Request::get(f.url("/assets/app.js"));
    f.transport.respond(request.url.as_str(), Response::ok("js"));

    f.router.handle(&request).await;
    assert_eq!(f.store.keys("static-v2").unwrap(), vec![request.cache_key()]);
  }

  #[tokio::test]
  async fn test_images_go_to_image_tier() {
    let f = fixture();
    let request = Request::get(f.url("/img/chart.PNG"));
    f.transport.respond(request.url.as_str(), Response::ok("png"));

    f.router.handle(&request).await;
    assert_eq!(f.store.keys("image-v2").unwrap(), vec![request.cache_key()]);
    assert!(f.store.keys("dynamic-v2").unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_api_offline_without_cache_is_503() {
    let f = fixture();
    let response = f.router.handle(&Request::get(f.url("/api/companies/1"))).await;
    assert_eq!(response.status, 503);
  }

  #[tokio::test]
  async fn test_navigation_offline_serves_offline_document() {
    let f = fixture();
    f.store.open("static-v2", 50).unwrap();
    f.store
      .put("static-v2", f.url("/offline.html").as_str(), &Response::ok("<h1>Hors ligne</h1>"))
      .unwrap();

    let served = f.router.route(&Request::navigate(f.url("/reports"))).await;
    assert_eq!(served.source, ResponseSource::Fallback);
    assert_eq!(served.response.body_text(), "<h1>Hors ligne</h1>");
  }

  #[tokio::test]
  async fn test_failed_emissions_post_is_queued() {
    let f = fixture();
    let request = Request::new(Method::POST, f.url("/api/emissions"))
      .with_header("Content-Type", "application/json")
      .with_body(r#"{"scope":1,"value":12}"#);

    let served = f.router.route(&request).await;

    assert_eq!(served.source, ResponseSource::Queued);
    assert_eq!(served.response.status, 202);
    let pending = f.queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload, br#"{"scope":1,"value":12}"#.to_vec());
    assert_eq!(pending[0].content_type.as_deref(), Some("application/json"));
    assert!(f.store.keys("dynamic-v2").unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_failed_mutation_elsewhere_is_not_queued() {
    let f = fixture();
    let request = Request::new(Method::POST, f.url("/api/reports")).with_body("{}");

    let response = f.router.handle(&request).await;
    assert_eq!(response.status, 503);
    assert!(f.queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_successful_mutation_passes_through() {
    let f = fixture();
    let request = Request::new(Method::PUT, f.url("/api/emissions/4")).with_body("{}");
    f.transport.respond(request.url.as_str(), Response::new(200, "updated"));

    let response = f.router.handle(&request).await;
    assert_eq!(response.body_text(), "updated");
    assert!(f.queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_pass_through_skips_cache() {
    let f = fixture();
    let request = Request::get(f.url("/assets/app.js"));
    f.store
      .put("static-v2", &request.cache_key(), &Response::ok("cached"))
      .unwrap();

    let served = f.router.pass_through(&request).await;
    assert_eq!(served.response.status, 503);
    assert_eq!(f.transport.call_count(), 1);
  }
}
