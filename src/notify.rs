//! Push payload parsing and notification click handling.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// The action that opens the application.
pub const PRIMARY_ACTION: &str = "view";

/// A button shown on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

/// Opaque data carried by a notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationData {
  /// Where a click should take the user
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub url: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// A notification ready to display. Any field missing from the push payload
/// takes its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NotificationPayload {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  /// Notifications sharing a tag replace each other
  pub tag: String,
  pub require_interaction: bool,
  pub actions: Vec<NotificationAction>,
  pub data: NotificationData,
}

impl Default for NotificationPayload {
  fn default() -> Self {
    Self {
      title: "CarbonOS".to_string(),
      body: "Nouvelle notification".to_string(),
      icon: "/icon-192x192.png".to_string(),
      badge: "/badge-72x72.png".to_string(),
      tag: "carbonos-notification".to_string(),
      require_interaction: false,
      actions: vec![
        NotificationAction {
          action: PRIMARY_ACTION.to_string(),
          title: "Voir".to_string(),
        },
        NotificationAction {
          action: "dismiss".to_string(),
          title: "Ignorer".to_string(),
        },
      ],
      data: NotificationData::default(),
    }
  }
}

/// What the host should do after the user interacted with a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "intent", rename_all = "kebab-case")]
pub enum NavigationIntent {
  /// Bring the application to the foreground at `url`
  Focus { url: String },
  /// Close the notification without navigating
  Dismiss,
}

/// Parse a raw push payload. Each field present in the payload replaces its
/// default; a field of the wrong type keeps the default. Missing or malformed
/// payloads yield the defaults.
pub fn on_push(raw: Option<&[u8]>) -> NotificationPayload {
  let Some(raw) = raw.filter(|r| !r.is_empty()) else {
    return NotificationPayload::default();
  };

  match serde_json::from_slice::<Value>(raw) {
    Ok(Value::Object(fields)) => merge_over_defaults(fields),
    Ok(other) => {
      warn!("push payload is not an object, using defaults: {}", other);
      NotificationPayload::default()
    }
    Err(e) => {
      warn!("malformed push payload, using defaults: {}", e);
      NotificationPayload::default()
    }
  }
}

fn merge_over_defaults(fields: Map<String, Value>) -> NotificationPayload {
  let defaults = NotificationPayload::default();
  let Ok(Value::Object(mut merged)) = serde_json::to_value(&defaults) else {
    return defaults;
  };

  for (key, value) in fields {
    let previous = merged.insert(key.clone(), value);
    if let Err(e) = serde_json::from_value::<NotificationPayload>(Value::Object(merged.clone())) {
      warn!("ignoring push payload field {}: {}", key, e);
      match previous {
        Some(previous) => merged.insert(key, previous),
        None => merged.remove(&key),
      };
    }
  }

  serde_json::from_value(Value::Object(merged)).unwrap_or(defaults)
}

/// React to a click on a delivered notification. The primary action, or a
/// click on the notification body itself, opens the app.
pub fn on_notification_interaction(
  action: Option<&str>,
  payload: &NotificationPayload,
) -> NavigationIntent {
  match action {
    None | Some("") | Some(PRIMARY_ACTION) => NavigationIntent::Focus {
      url: payload.data.url.clone().unwrap_or_else(|| "/".to_string()),
    },
    Some(_) => NavigationIntent::Dismiss,
  }
}
