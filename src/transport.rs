//! Network transport used by strategies, install and replay.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TransportError;
use crate::http::{Request, Response};

/// Sends a request to the network.
///
/// An `Ok` response may carry any status; only the absence of a response is
/// an error.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: &Request) -> Result<Response, TransportError>;
}

pub type SharedTransport = Arc<dyn Transport>;

/// Send `request` through `transport`, giving up after `timeout`.
pub async fn send_bounded(
  transport: &dyn Transport,
  request: &Request,
  timeout: Duration,
) -> Result<Response, TransportError> {
  match tokio::time::timeout(timeout, transport.send(request)).await {
    Ok(result) => result,
    Err(_) => Err(TransportError::Timeout {
      url: request.url.to_string(),
      after: timeout,
    }),
  }
}

/// Transport backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("carbon-offline/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: &Request) -> Result<Response, TransportError> {
    let url = request.url.to_string();
    let mut builder = self.client.request(request.method.clone(), request.url.clone());

    if let Some(accept) = &request.accept {
      builder = builder.header(reqwest::header::ACCEPT, accept);
    }
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| TransportError::unreachable(&url, e.to_string()))?;

    let status = response.status().as_u16();
    let headers: BTreeMap<String, String> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| TransportError::unreachable(&url, format!("body interrupted: {}", e)))?;

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}
