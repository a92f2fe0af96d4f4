//! Commands the hosting application sends to the engine.

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::lifecycle::LifecycleController;

/// A recognized control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlCommand {
  /// Activate the waiting generation now
  #[serde(rename = "SKIP_WAITING")]
  SkipWaiting,
}

impl ControlCommand {
  /// Parse a control message. Anything unrecognized is `None`.
  pub fn parse(message: &serde_json::Value) -> Option<Self> {
    match Self::deserialize(message) {
      Ok(command) => Some(command),
      Err(e) => {
        debug!("ignoring control message {}: {}", message, e);
        None
      }
    }
  }
}

/// Routes control messages to the lifecycle controller.
pub struct ControlChannel<'a> {
  lifecycle: &'a LifecycleController,
}

impl<'a> ControlChannel<'a> {
  pub fn new(lifecycle: &'a LifecycleController) -> Self {
    Self { lifecycle }
  }

  /// Handle one message. Returns the command that was applied, if any.
  pub async fn handle(&self, message: &serde_json::Value) -> Result<Option<ControlCommand>> {
    let Some(command) = ControlCommand::parse(message) else {
      return Ok(None);
    };

    match command {
      ControlCommand::SkipWaiting => self.lifecycle.skip_waiting().await?,
    }

    Ok(Some(command))
  }
}
