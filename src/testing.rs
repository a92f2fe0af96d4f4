//! Scripted transport used by unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use crate::error::TransportError;
use crate::http::{Request, Response};
use crate::transport::Transport;

#[derive(Clone)]
enum Reply {
  Respond(Response),
  Fail,
  Hold(Response, Arc<Semaphore>),
}

/// Keeps a held response pending until released.
pub struct Gate(Arc<Semaphore>);

impl Gate {
  pub fn release(&self) {
    self.0.add_permits(1);
  }
}

/// In-memory transport with per-URL scripted replies.
///
/// Replies queued for a URL are consumed in order; the last one repeats.
/// Unscripted URLs fail as unreachable.
#[derive(Default)]
pub struct FakeTransport {
  replies: Mutex<HashMap<String, VecDeque<Reply>>>,
  calls: Mutex<Vec<Request>>,
  offline: AtomicBool,
}

impl FakeTransport {
  pub fn new() -> Self {
    Self::default()
  }

  fn push(&self, url: &str, reply: Reply) {
    self
      .replies
      .lock()
      .unwrap()
      .entry(url.to_string())
      .or_default()
      .push_back(reply);
  }

  pub fn respond(&self, url: &str, response: Response) {
    self.push(url, Reply::Respond(response));
  }

  pub fn fail(&self, url: &str) {
    self.push(url, Reply::Fail);
  }

  /// Script a response that is only delivered once the gate is released.
  pub fn hold(&self, url: &str, response: Response) -> Gate {
    let semaphore = Arc::new(Semaphore::new(0));
    self.push(url, Reply::Hold(response, Arc::clone(&semaphore)));
    Gate(semaphore)
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn calls_to(&self, url: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url.as_str() == url)
      .count()
  }

  fn next_reply(&self, url: &str) -> Option<Reply> {
    let mut replies = self.replies.lock().unwrap();
    let queue = replies.get_mut(url)?;
    if queue.len() > 1 {
      queue.pop_front()
    } else {
      queue.front().cloned()
    }
  }
}

#[async_trait]
impl Transport for FakeTransport {
  async fn send(&self, request: &Request) -> Result<Response, TransportError> {
    self.calls.lock().unwrap().push(request.clone());
    let url = request.url.as_str();

    if self.offline.load(Ordering::SeqCst) {
      return Err(TransportError::unreachable(url, "offline"));
    }

    match self.next_reply(url) {
      Some(Reply::Respond(response)) => Ok(response),
      Some(Reply::Hold(response, gate)) => {
        let _permit = gate.acquire().await;
        Ok(response)
      }
      Some(Reply::Fail) | None => Err(TransportError::unreachable(url, "connection refused")),
    }
  }
}
