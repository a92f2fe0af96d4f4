//! Install / activate state machine and generation cleanup of cache tiers.
//!
//! `Installing → Waiting → Activating → Active`. Install pre-populates the
//! static and dynamic tiers; activation deletes every tier that does not
//! belong to the current generation.

use color_eyre::{eyre::eyre, Result};
use futures::future::{join_all, try_join};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};
use url::Url;

use crate::cache::{CacheLayer, TierHandle};
use crate::config::TierSet;
use crate::http::{Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
  Installing,
  Waiting,
  Activating,
  Active,
}

/// URLs pre-populated at install.
#[derive(Debug, Clone, Default)]
pub struct Precache {
  /// Go to the static tier
  pub assets: Vec<Url>,
  /// Go to the dynamic tier
  pub routes: Vec<Url>,
}

pub struct LifecycleController {
  layer: CacheLayer,
  tiers: TierSet,
  precache: Precache,
  /// Move on to activation as soon as install completes
  skip_waiting_on_install: bool,
  skip_requested: AtomicBool,
  state: watch::Sender<LifecycleState>,
  /// Serializes install and activation
  transition: Mutex<()>,
}

impl LifecycleController {
  pub fn new(layer: CacheLayer, tiers: TierSet, precache: Precache, skip_waiting: bool) -> Self {
    let (state, _) = watch::channel(LifecycleState::Installing);
    Self {
      layer,
      tiers,
      precache,
      skip_waiting_on_install: skip_waiting,
      skip_requested: AtomicBool::new(false),
      state,
      transition: Mutex::new(()),
    }
  }

  pub fn state(&self) -> LifecycleState {
    *self.state.borrow()
  }

  /// Observe state transitions.
  pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
    self.state.subscribe()
  }

  pub fn is_active(&self) -> bool {
    self.state() == LifecycleState::Active
  }

  fn set_state(&self, next: LifecycleState) {
    let previous = self.state.send_replace(next);
    if previous != next {
      info!("lifecycle {:?} -> {:?}", previous, next);
    }
  }

  /// Pre-populate the static and dynamic tiers, then move to `Waiting`
  /// (or straight on to activation if skip-waiting was requested).
  ///
  /// Each tier is filled all-or-nothing; on failure the controller stays in
  /// `Installing` and install can be retried.
  pub async fn install(&self) -> Result<()> {
    let _guard = self.transition.lock().await;

    if self.state() != LifecycleState::Installing {
      debug!("install ignored in state {:?}", self.state());
      return Ok(());
    }

    let store = self.layer.store();
    let static_tier = store.open(
      &self.tiers.static_assets.name,
      self.tiers.static_assets.capacity,
    )?;
    let dynamic_tier = store.open(&self.tiers.dynamic.name, self.tiers.dynamic.capacity)?;
    store.open(&self.tiers.image.name, self.tiers.image.capacity)?;

    try_join(
      self.precache_tier(&static_tier, &self.precache.assets),
      self.precache_tier(&dynamic_tier, &self.precache.routes),
    )
    .await?;

    self.set_state(LifecycleState::Waiting);

    if self.skip_waiting_on_install || self.skip_requested.swap(false, Ordering::SeqCst) {
      self.activate_locked().await?;
    }

    Ok(())
  }

  /// Fetch every URL, and only if all succeed, store them.
  async fn precache_tier(&self, tier: &TierHandle, urls: &[Url]) -> Result<()> {
    let requests: Vec<Request> = urls.iter().cloned().map(Request::get).collect();
    let results = join_all(requests.iter().map(|r| self.layer.fetch(r))).await;

    let mut responses: Vec<(&Request, Response)> = Vec::with_capacity(requests.len());
    for (request, result) in requests.iter().zip(results) {
      let response = result.map_err(|e| eyre!("Failed to pre-cache {}: {}", request.url, e))?;
      if !response.is_success() {
        return Err(eyre!(
          "Failed to pre-cache {}: status {}",
          request.url,
          response.status
        ));
      }
      responses.push((request, response));
    }

    for (request, response) in &responses {
      tier.put(&request.cache_key(), response)?;
    }
    debug!("pre-cached {} entries into {}", responses.len(), tier.name());

    Ok(())
  }

  /// Immediate-activation request. From `Waiting` this activates without
  /// waiting for clients to detach; during `Installing` it is remembered
  /// and honoured once install completes.
  pub async fn skip_waiting(&self) -> Result<()> {
    match self.state() {
      LifecycleState::Installing => {
        self.skip_requested.store(true, Ordering::SeqCst);
        // Install may have finished while we looked
        if self.state() == LifecycleState::Waiting {
          self.activate().await?;
        }
        Ok(())
      }
      LifecycleState::Waiting => self.activate().await.map(|_| ()),
      LifecycleState::Activating | LifecycleState::Active => Ok(()),
    }
  }

  /// Every client of the previous generation has detached.
  pub async fn clients_released(&self) -> Result<()> {
    if self.state() == LifecycleState::Waiting {
      self.activate().await?;
    }
    Ok(())
  }

  /// Delete stale tiers and start serving. Returns the deleted tier names.
  pub async fn activate(&self) -> Result<Vec<String>> {
    let _guard = self.transition.lock().await;
    self.activate_locked().await
  }

  async fn activate_locked(&self) -> Result<Vec<String>> {
    match self.state() {
      LifecycleState::Installing => {
        return Err(eyre!("Cannot activate before install completes"))
      }
      LifecycleState::Active => return Ok(Vec::new()),
      LifecycleState::Waiting | LifecycleState::Activating => {}
    }

    self.set_state(LifecycleState::Activating);
    let deleted = self.cleanup()?;
    self.set_state(LifecycleState::Active);

    Ok(deleted)
  }

  /// Delete every tier that is not part of the current generation.
  fn cleanup(&self) -> Result<Vec<String>> {
    let store = self.layer.store();
    let current = self.tiers.names();

    let mut deleted = Vec::new();
    for name in store.list_tier_names()? {
      if current.contains(&name.as_str()) {
        continue;
      }
      if store.delete_tier(&name)? {
        info!("deleted stale cache tier {}", name);
        deleted.push(name);
      }
    }

    Ok(deleted)
  }
}
