//! Request and response values that flow through the interception point.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// How the hosting application issued a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
  /// Top-level page load
  Navigate,
  #[default]
  SameOrigin,
  Cors,
  NoCors,
}

/// An intercepted outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  /// Declared `Accept` header, if any
  pub accept: Option<String>,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      mode: RequestMode::default(),
      accept: None,
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A page-load request for `url`.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      accept: Some("text/html".to_string()),
      ..Self::get(url)
    }
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
    self.accept = Some(accept.into());
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into().to_lowercase(), value.into());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Normalized cache key: the URL alone for GET, `"<METHOD> <URL>"` otherwise.
  pub fn cache_key(&self) -> String {
    if self.method == Method::GET {
      self.url.to_string()
    } else {
      format!("{} {}", self.method, self.url)
    }
  }

  /// Whether this request changes server state.
  pub fn is_mutation(&self) -> bool {
    matches!(
      self.method,
      Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
  }
}

/// A response, either received from the network or produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn ok(body: impl Into<Vec<u8>>) -> Self {
    Self::new(200, body)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into().to_lowercase(), value.into());
    self
  }

  /// Synthetic 503 with an empty body.
  pub fn unavailable() -> Self {
    Self::new(503, Vec::new())
  }

  /// Synthetic 404 with an empty body.
  pub fn not_found() -> Self {
    Self::new(404, Vec::new())
  }

  /// Synthetic 202 acknowledging that a mutation was queued for replay.
  pub fn queued(id: &str) -> Self {
    let body = serde_json::json!({ "queued": id }).to_string();
    Self::new(202, body).with_header("content-type", "application/json")
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}
