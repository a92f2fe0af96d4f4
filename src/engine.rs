//! The engine: every platform event kind mapped to its handler.

use color_eyre::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheLayer, CacheStore, Served, SqliteStorage};
use crate::config::Config;
use crate::control::{ControlChannel, ControlCommand};
use crate::db::Database;
use crate::http::Request;
use crate::lifecycle::{LifecycleController, LifecycleState, Precache};
use crate::notify::{self, NavigationIntent, NotificationPayload};
use crate::queue::{
  endpoint_matches, NewMutation, OfflineMutationQueue, PendingMutation, ReplayReport, SharedQueue,
};
use crate::router::StrategyRouter;
use crate::transport::{HttpTransport, SharedTransport};

/// Events delivered by the hosting platform.
#[derive(Debug, Clone)]
pub enum EngineEvent {
  Install,
  Activate,
  /// Clients of the previous generation have all detached
  ClientsReleased,
  Fetch(Request),
  /// Raw push payload, if any
  Push(Option<Vec<u8>>),
  NotificationClick {
    action: Option<String>,
    notification: NotificationPayload,
  },
  /// Connectivity restored for the mutation class `tag`
  Sync { tag: String },
  /// Control message from the hosting application
  Message(serde_json::Value),
  /// The hosting application stores a mutation for later replay
  Enqueue(NewMutation),
}

impl EngineEvent {
  /// Events that change lifecycle state and must be handled in arrival order.
  pub fn is_ordered(&self) -> bool {
    matches!(
      self,
      Self::Install | Self::Activate | Self::ClientsReleased | Self::Message(_)
    )
  }
}

/// What handling an event produced.
#[derive(Debug, Clone)]
pub enum Outcome {
  Lifecycle(LifecycleState),
  Activated { deleted: Vec<String> },
  Response(Served),
  Notification(NotificationPayload),
  Navigation(NavigationIntent),
  Replayed(ReplayReport),
  Control(Option<ControlCommand>),
  Queued(PendingMutation),
  /// Recognized event with nothing to do
  Ignored,
  /// Handling failed; the engine keeps running
  Failed(String),
}

pub struct Engine {
  router: StrategyRouter,
  lifecycle: LifecycleController,
  queue: SharedQueue,
  /// Replay tag -> endpoint path
  sync: BTreeMap<String, String>,
  origin: url::Url,
}

impl Engine {
  /// Wire the components together over the given storage and transport.
  pub fn new(config: &Config, store: CacheStore, db: Database, transport: SharedTransport) -> Result<Self> {
    let offline_document = config.resolve(&config.offline_document)?;
    let layer = CacheLayer::new(
      store,
      Arc::clone(&transport),
      config.network_timeout(),
      offline_document.to_string(),
    );

    let queue: SharedQueue = Arc::new(OfflineMutationQueue::new(
      db,
      transport,
      config.network_timeout(),
    ));

    let tiers = config.tier_set();
    let precache = Precache {
      assets: resolve_all(config, &config.precache.assets)?,
      routes: resolve_all(config, &config.precache.routes)?,
    };

    let router = StrategyRouter::new(
      layer.clone(),
      &tiers,
      &config.api_prefix,
      Arc::clone(&queue),
      config.sync.values().cloned().collect(),
    )?;
    let lifecycle = LifecycleController::new(layer, tiers, precache, config.skip_waiting);

    Ok(Self {
      router,
      lifecycle,
      queue,
      sync: config.sync.clone(),
      origin: config.origin.clone(),
    })
  }

  /// Build the engine with on-disk storage (unless disabled) and the HTTP transport.
  pub fn open(config: &Config) -> Result<Self> {
    let data_dir = config.data_dir()?;
    let store = if config.persist {
      CacheStore::new(SqliteStorage::open(&data_dir.join("cache.db"))?)
    } else {
      CacheStore::in_memory()
    };
    let db = Database::open(&data_dir.join("queue.db"))?;
    let transport: SharedTransport = Arc::new(HttpTransport::new()?);

    info!(
      "engine ready: generation {}, data in {}",
      config.generation,
      data_dir.display()
    );
    Self::new(config, store, db, transport)
  }

  pub fn lifecycle(&self) -> &LifecycleController {
    &self.lifecycle
  }

  pub fn queue(&self) -> &OfflineMutationQueue {
    &self.queue
  }

  pub fn origin(&self) -> &url::Url {
    &self.origin
  }

  /// Handle one event.
  pub async fn dispatch(&self, event: EngineEvent) -> Outcome {
    match event {
      EngineEvent::Install => self.on_install().await,
      EngineEvent::Activate => self.on_activate().await,
      EngineEvent::ClientsReleased => self.on_clients_released().await,
      EngineEvent::Fetch(request) => self.on_fetch(&request).await,
      EngineEvent::Push(raw) => Outcome::Notification(notify::on_push(raw.as_deref())),
      EngineEvent::NotificationClick {
        action,
        notification,
      } => Outcome::Navigation(notify::on_notification_interaction(
        action.as_deref(),
        &notification,
      )),
      EngineEvent::Sync { tag } => self.on_sync(&tag).await,
      EngineEvent::Message(message) => self.on_message(&message).await,
      EngineEvent::Enqueue(mutation) => self.on_enqueue(mutation),
    }
  }

  async fn on_install(&self) -> Outcome {
    match self.lifecycle.install().await {
      Ok(()) => Outcome::Lifecycle(self.lifecycle.state()),
      Err(e) => failed("install", e),
    }
  }

  async fn on_activate(&self) -> Outcome {
    match self.lifecycle.activate().await {
      Ok(deleted) => Outcome::Activated { deleted },
      Err(e) => failed("activate", e),
    }
  }

  async fn on_clients_released(&self) -> Outcome {
    match self.lifecycle.clients_released().await {
      Ok(()) => Outcome::Lifecycle(self.lifecycle.state()),
      Err(e) => failed("activate", e),
    }
  }

  async fn on_fetch(&self, request: &Request) -> Outcome {
    let served = if self.lifecycle.is_active() {
      self.router.route(request).await
    } else {
      self.router.pass_through(request).await
    };
    Outcome::Response(served)
  }

  async fn on_sync(&self, tag: &str) -> Outcome {
    match self.replay_tag(tag).await {
      Ok(Some(report)) => Outcome::Replayed(report),
      Ok(None) => Outcome::Ignored,
      Err(e) => failed("replay", e),
    }
  }

  /// Replay the queued mutations addressed to the endpoint registered for
  /// `tag`. `None` when no endpoint is registered.
  pub async fn replay_tag(&self, tag: &str) -> Result<Option<ReplayReport>> {
    let Some(endpoint) = self.sync.get(tag) else {
      debug!("no replay registered for sync tag {}", tag);
      return Ok(None);
    };

    let report = self
      .queue
      .replay_matching(|m| endpoint_matches(&m.endpoint, endpoint))
      .await?;
    Ok(Some(report))
  }

  /// Replay the whole queue regardless of endpoint.
  pub async fn replay_all(&self) -> Result<ReplayReport> {
    self.queue.replay_all().await
  }

  async fn on_message(&self, message: &serde_json::Value) -> Outcome {
    match ControlChannel::new(&self.lifecycle).handle(message).await {
      Ok(command) => Outcome::Control(command),
      Err(e) => failed("control", e),
    }
  }

  fn on_enqueue(&self, mutation: NewMutation) -> Outcome {
    match self.queue.enqueue(mutation) {
      Ok(pending) => Outcome::Queued(pending),
      Err(e) => failed("enqueue", e),
    }
  }
}

fn resolve_all(config: &Config, paths: &[String]) -> Result<Vec<url::Url>> {
  paths.iter().map(|p| config.resolve(p)).collect()
}

fn failed(what: &str, error: color_eyre::Report) -> Outcome {
  warn!("{} failed: {:#}", what, error);
  Outcome::Failed(format!("{}: {}", what, error))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ResponseSource;
  use crate::http::Response;
  use crate::testing::FakeTransport;
  use reqwest::Method;
  use serde_json::json;

  struct Fixture {
    engine: Engine,
    transport: Arc<FakeTransport>,
    store: CacheStore,
    config: Config,
  }

  fn fixture() -> Fixture {
    let config = Config::default();
    let transport = Arc::new(FakeTransport::new());
    for path in config.precache.assets.iter().chain(&config.precache.routes) {
      let url = config.resolve(path).unwrap();
      transport.respond(url.as_str(), Response::ok(format!("precached {}", path)));
    }
    let store = CacheStore::in_memory();
    let engine = Engine::new(
      &config,
      store.clone(),
      Database::open_in_memory().unwrap(),
      transport.clone(),
    )
    .unwrap();
    Fixture {
      engine,
      transport,
      store,
      config,
    }
  }

  #[tokio::test]
  async fn test_skip_waiting_message_activates() {
    let f = fixture();
    assert!(matches!(
      f.engine.dispatch(EngineEvent::Install).await,
      Outcome::Lifecycle(LifecycleState::Waiting)
    ));
    let mut states = f.engine.lifecycle().subscribe();

    let outcome = f
      .engine
      .dispatch(EngineEvent::Message(json!({ "type": "SKIP_WAITING" })))
      .await;

    assert!(matches!(outcome, Outcome::Control(Some(ControlCommand::SkipWaiting))));
    assert_eq!(f.engine.lifecycle().state(), LifecycleState::Active);
    assert!(states.has_changed().unwrap());
  }

  #[tokio::test]
  async fn test_unknown_message_is_ignored() {
    let f = fixture();
    f.engine.dispatch(EngineEvent::Install).await;

    let outcome = f.engine.dispatch(EngineEvent::Message(json!({ "type": "PING" }))).await;
    assert!(matches!(outcome, Outcome::Control(None)));
    assert_eq!(f.engine.lifecycle().state(), LifecycleState::Waiting);
  }

  #[tokio::test]
  async fn test_activation_cleans_previous_generation() {
    let f = fixture();
    f.store.open("static-v1", 50).unwrap();
    f.store.open("dynamic-v1", 100).unwrap();
    f.engine.dispatch(EngineEvent::Install).await;

    let outcome = f.engine.dispatch(EngineEvent::Activate).await;
    let Outcome::Activated { mut deleted } = outcome else {
      panic!("expected activation, got {:?}", outcome);
    };
    deleted.sort();
    assert_eq!(deleted, vec!["dynamic-v1", "static-v1"]);
  }

  #[tokio::test]
  async fn test_fetch_is_served_from_precache_once_active() {
    let f = fixture();
    f.engine.dispatch(EngineEvent::Install).await;
    f.engine.dispatch(EngineEvent::Activate).await;
    f.transport.set_offline(true);

    let request = Request::get(f.config.resolve("/icon-192x192.png").unwrap());
    let Outcome::Response(served) = f.engine.dispatch(EngineEvent::Fetch(request)).await else {
      panic!("expected a response");
    };
    // Pre-cached into the static tier, but images are looked up in the image tier
    assert_eq!(served.response.status, 404);

    let nav = Request::navigate(f.config.resolve("/dashboard").unwrap());
    let Outcome::Response(served) = f.engine.dispatch(EngineEvent::Fetch(nav)).await else {
      panic!("expected a response");
    };
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.body_text(), "precached /dashboard");

    let unknown = Request::navigate(f.config.resolve("/settings").unwrap());
    let Outcome::Response(served) = f.engine.dispatch(EngineEvent::Fetch(unknown)).await else {
      panic!("expected a response");
    };
    assert_eq!(served.source, ResponseSource::Fallback);
    assert_eq!(served.response.body_text(), "precached /offline.html");
  }

  #[tokio::test]
  async fn test_fetch_before_activation_passes_through() {
    let f = fixture();
    let request = Request::get(f.config.resolve("/manifest.json").unwrap());

    let Outcome::Response(served) = f.engine.dispatch(EngineEvent::Fetch(request)).await else {
      panic!("expected a response");
    };
    assert_eq!(served.source, ResponseSource::Network);
    assert!(f.store.keys("dynamic-v2").unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_sync_replays_queued_emissions() {
    let f = fixture();
    f.engine.dispatch(EngineEvent::Install).await;
    f.engine.dispatch(EngineEvent::Activate).await;
    let endpoint = f.config.resolve("/api/emissions").unwrap();

    // Offline submission is captured
    let post = Request::new(Method::POST, endpoint.clone()).with_body(r#"{"value":3}"#);
    let Outcome::Response(served) = f.engine.dispatch(EngineEvent::Fetch(post)).await else {
      panic!("expected a response");
    };
    assert_eq!(served.source, ResponseSource::Queued);
    assert_eq!(f.engine.queue().len().unwrap(), 1);

    // Connectivity returns
    f.transport.respond(endpoint.as_str(), Response::new(201, ""));
    let outcome = f
      .engine
      .dispatch(EngineEvent::Sync {
        tag: "emissions-sync".to_string(),
      })
      .await;

    let Outcome::Replayed(report) = outcome else {
      panic!("expected a replay report, got {:?}", outcome);
    };
    assert_eq!(report.succeeded.len(), 1);
    assert!(report.remaining.is_empty());
    assert!(f.engine.queue().is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_unknown_sync_tag_is_ignored() {
    let f = fixture();
    let outcome = f
      .engine
      .dispatch(EngineEvent::Sync {
        tag: "reports-sync".to_string(),
      })
      .await;
    assert!(matches!(outcome, Outcome::Ignored));
  }

  #[tokio::test]
  async fn test_enqueue_event() {
    let f = fixture();
    let mutation = NewMutation::json(
      f.config.resolve("/api/emissions").unwrap(),
      &json!({ "scope": 2 }),
    )
    .with_id("draft-1");

    let outcome = f.engine.dispatch(EngineEvent::Enqueue(mutation)).await;
    assert!(matches!(outcome, Outcome::Queued(ref p) if p.id == "draft-1"));
  }

  #[tokio::test]
  async fn test_push_and_click() {
    let f = fixture();
    let Outcome::Notification(payload) = f.engine.dispatch(EngineEvent::Push(Some(b"{}".to_vec()))).await else {
      panic!("expected a notification");
    };
    assert_eq!(payload.title, "CarbonOS");

    let outcome = f
      .engine
      .dispatch(EngineEvent::NotificationClick {
        action: None,
        notification: payload,
      })
      .await;
    assert!(matches!(outcome, Outcome::Navigation(NavigationIntent::Focus { ref url }) if url == "/"));
  }

  #[tokio::test]
  async fn test_install_failure_is_reported_not_fatal() {
    let f = fixture();
    f.transport.set_offline(true);

    let outcome = f.engine.dispatch(EngineEvent::Install).await;
    assert!(matches!(outcome, Outcome::Failed(_)));
    assert_eq!(f.engine.lifecycle().state(), LifecycleState::Installing);
  }
}
