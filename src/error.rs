//! Errors raised at the network boundary.

use std::time::Duration;

/// A network call that produced no response at all.
///
/// Strategies never surface this to the hosting application; it selects the
/// fallback path instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
  /// Connection refused, DNS failure, reset, and the like.
  #[error("network unreachable for {url}: {message}")]
  Unreachable { url: String, message: String },

  /// No response within the configured bound.
  #[error("no response from {url} within {after:?}")]
  Timeout { url: String, after: Duration },
}

impl TransportError {
  pub fn unreachable(url: impl Into<String>, message: impl Into<String>) -> Self {
    Self::Unreachable {
      url: url.into(),
      message: message.into(),
    }
  }
}
