//! Durable FIFO queue of mutations that failed for lack of network, and the
//! protocol that replays them once connectivity returns.
//!
//! Delivery is at-least-once: an entry is removed only after its endpoint
//! acknowledges with a 2xx status. A failed entry stops the pass so later
//! entries are never delivered ahead of it.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;

use crate::db::Database;
use crate::http::Request;
use crate::transport::{send_bounded, SharedTransport};

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A mutation to put in the queue.
#[derive(Debug, Clone)]
pub struct NewMutation {
  /// Caller-supplied id; generated when absent
  pub id: Option<String>,
  pub endpoint: Url,
  pub method: Method,
  pub content_type: Option<String>,
  pub payload: Vec<u8>,
}

impl NewMutation {
  /// A JSON POST to `endpoint`, the shape of an emissions submission.
  pub fn json(endpoint: Url, payload: &serde_json::Value) -> Self {
    Self {
      id: None,
      endpoint,
      method: Method::POST,
      content_type: Some("application/json".to_string()),
      payload: payload.to_string().into_bytes(),
    }
  }

  /// Capture an intercepted request whose network call failed.
  pub fn from_request(request: &Request) -> Self {
    Self {
      id: None,
      endpoint: request.url.clone(),
      method: request.method.clone(),
      content_type: request.headers.get("content-type").cloned(),
      payload: request.body.clone().unwrap_or_default(),
    }
  }

  pub fn with_id(mut self, id: impl Into<String>) -> Self {
    self.id = Some(id.into());
    self
  }
}

/// A queued mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingMutation {
  pub id: String,
  pub endpoint: Url,
  #[serde(serialize_with = "serialize_method")]
  pub method: Method,
  pub content_type: Option<String>,
  #[serde(skip)]
  pub payload: Vec<u8>,
  pub enqueued_at: DateTime<Utc>,
  /// Failed replay attempts so far
  pub attempts: u32,
}

fn serialize_method<S: serde::Serializer>(method: &Method, s: S) -> Result<S::Ok, S::Error> {
  s.serialize_str(method.as_str())
}

impl PendingMutation {
  /// The request replayed for this entry: original endpoint, method and payload.
  pub fn to_request(&self) -> Request {
    let mut request =
      Request::new(self.method.clone(), self.endpoint.clone()).with_body(self.payload.clone());
    if let Some(content_type) = &self.content_type {
      request = request.with_header("content-type", content_type.as_str());
    }
    request
  }
}

/// Row as stored, before parsing URL, method and timestamp.
struct RawMutation {
  id: String,
  endpoint: String,
  method: String,
  content_type: Option<String>,
  payload: Vec<u8>,
  enqueued_at: String,
  attempts: u32,
}

impl RawMutation {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      endpoint: row.get(1)?,
      method: row.get(2)?,
      content_type: row.get(3)?,
      payload: row.get(4)?,
      enqueued_at: row.get(5)?,
      attempts: row.get(6)?,
    })
  }
}

impl TryFrom<RawMutation> for PendingMutation {
  type Error = color_eyre::Report;

  fn try_from(raw: RawMutation) -> Result<Self> {
    Ok(Self {
      endpoint: Url::parse(&raw.endpoint)
        .map_err(|e| eyre!("Invalid queued endpoint {}: {}", raw.endpoint, e))?,
      method: Method::from_bytes(raw.method.as_bytes())
        .map_err(|e| eyre!("Invalid queued method {}: {}", raw.method, e))?,
      enqueued_at: DateTime::parse_from_rfc3339(&raw.enqueued_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| eyre!("Failed to parse datetime '{}': {}", raw.enqueued_at, e))?,
      id: raw.id,
      content_type: raw.content_type,
      payload: raw.payload,
      attempts: raw.attempts,
    })
  }
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayReport {
  /// Delivered and removed, in delivery order
  pub succeeded: Vec<PendingMutation>,
  /// Still queued, in FIFO order
  pub remaining: Vec<PendingMutation>,
}

/// Durable, ordered queue of failed mutations.
pub struct OfflineMutationQueue {
  db: Database,
  transport: SharedTransport,
  timeout: Duration,
  /// Serializes replay passes so no entry is sent twice concurrently
  replay_lock: Mutex<()>,
}

const SELECT_COLUMNS: &str =
  "SELECT id, endpoint, method, content_type, payload, enqueued_at, attempts FROM pending_mutations";

impl OfflineMutationQueue {
  pub fn new(db: Database, transport: SharedTransport, timeout: Duration) -> Self {
    Self {
      db,
      transport,
      timeout,
      replay_lock: Mutex::new(()),
    }
  }

  /// Persist a mutation at the tail of the queue.
  ///
  /// Enqueueing an id that is already queued returns the existing entry.
  pub fn enqueue(&self, mutation: NewMutation) -> Result<PendingMutation> {
    let enqueued_at = Utc::now();
    let id = mutation
      .id
      .clone()
      .unwrap_or_else(|| generate_id(&mutation, enqueued_at));

    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO pending_mutations
         (id, endpoint, method, content_type, payload, enqueued_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          id,
          mutation.endpoint.as_str(),
          mutation.method.as_str(),
          mutation.content_type,
          mutation.payload,
          enqueued_at.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue mutation: {}", e))?;

    let raw = conn
      .query_row(
        &format!("{} WHERE id = ?", SELECT_COLUMNS),
        params![id],
        RawMutation::from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read queued mutation: {}", e))?
      .ok_or_else(|| eyre!("Queued mutation {} vanished", id))?;

    let pending = PendingMutation::try_from(raw)?;
    info!("queued {} {} as {}", pending.method, pending.endpoint, pending.id);
    Ok(pending)
  }

  /// All queued mutations in FIFO order.
  pub fn pending(&self) -> Result<Vec<PendingMutation>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare(&format!("{} ORDER BY seq", SELECT_COLUMNS))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let raws = stmt
      .query_map([], RawMutation::from_row)
      .map_err(|e| eyre!("Failed to query queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read queued mutation: {}", e))?;

    raws.into_iter().map(PendingMutation::try_from).collect()
  }

  pub fn len(&self) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM pending_mutations", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queue: {}", e))?;
    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Replay the whole queue.
  pub async fn replay_all(&self) -> Result<ReplayReport> {
    self.replay_matching(|_| true).await
  }

  /// Replay, in FIFO order, the entries selected by `filter`.
  ///
  /// Stops at the first entry that fails; it and everything after it stay
  /// queued for the next trigger.
  pub async fn replay_matching<F>(&self, filter: F) -> Result<ReplayReport>
  where
    F: Fn(&PendingMutation) -> bool,
  {
    let _pass = self.replay_lock.lock().await;

    let mut queue: Vec<PendingMutation> =
      self.pending()?.into_iter().filter(|m| filter(m)).collect();
    let mut report = ReplayReport::default();

    while !queue.is_empty() {
      let mutation = &queue[0];
      let request = mutation.to_request();

      let failure = match send_bounded(self.transport.as_ref(), &request, self.timeout).await {
        Ok(response) if response.is_success() => None,
        Ok(response) => Some(format!("endpoint answered {}", response.status)),
        Err(e) => Some(e.to_string()),
      };

      if let Some(reason) = failure {
        warn!(
          "replay of {} stopped at {}: {}; {} entries stay queued",
          mutation.endpoint,
          mutation.id,
          reason,
          queue.len()
        );
        self.record_failure(&mutation.id, &reason)?;
        queue[0].attempts += 1;
        break;
      }

      self.remove(&mutation.id)?;
      report.succeeded.push(queue.remove(0));
    }

    report.remaining = queue;
    info!(
      "replay pass finished: {} delivered, {} remaining",
      report.succeeded.len(),
      report.remaining.len()
    );
    Ok(report)
  }

  fn remove(&self, id: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute("DELETE FROM pending_mutations WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove delivered mutation {}: {}", id, e))?;
    Ok(())
  }

  fn record_failure(&self, id: &str, reason: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "UPDATE pending_mutations SET attempts = attempts + 1, last_error = ? WHERE id = ?",
        params![reason, id],
      )
      .map_err(|e| eyre!("Failed to record replay failure for {}: {}", id, e))?;
    Ok(())
  }
}

/// Whether `url` targets the endpoint path `endpoint` or a resource below it.
pub fn endpoint_matches(url: &Url, endpoint: &str) -> bool {
  let endpoint = endpoint.trim_end_matches('/');
  let path = url.path();
  path == endpoint
    || path
      .strip_prefix(endpoint)
      .is_some_and(|rest| rest.starts_with('/'))
}

/// Stable hex id from the mutation's content, its enqueue time and a
/// process-wide counter.
fn generate_id(mutation: &NewMutation, at: DateTime<Utc>) -> String {
  let mut hasher = Sha256::new();
  hasher.update(mutation.method.as_str().as_bytes());
  hasher.update(mutation.endpoint.as_str().as_bytes());
  hasher.update(&mutation.payload);
  hasher.update(at.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
  hasher.update(ID_COUNTER.fetch_add(1, Ordering::SeqCst).to_le_bytes());
  let digest = hex::encode(hasher.finalize());
  digest[..32].to_string()
}

/// Shared queue handle.
pub type SharedQueue = Arc<OfflineMutationQueue>;
