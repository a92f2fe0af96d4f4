//! Newline-delimited JSON protocol spoken with the hosting runtime.
//!
//! Each input line is one event object with a `type` field and an optional
//! `id`; each handled event produces one output line carrying the same `id`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::cache::ResponseSource;
use crate::control::ControlCommand;
use crate::engine::{EngineEvent, Outcome};
use crate::http::{Request, RequestMode};
use crate::lifecycle::LifecycleState;
use crate::notify::{NavigationIntent, NotificationPayload};
use crate::queue::{NewMutation, PendingMutation};

/// One input line, decoded.
#[derive(Debug)]
pub struct Inbound {
  /// Correlation id echoed on the outcome line
  pub id: Option<serde_json::Value>,
  pub event: Result<EngineEvent, String>,
}

/// Reads events from the runtime on a background task
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Inbound>,
}

impl EventHandler {
  /// Start reading lines from `input`. Relative URLs resolve against `origin`.
  pub fn new<R>(input: R, origin: Url) -> Self
  where
    R: AsyncRead + Unpin + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      let mut lines = BufReader::new(input).lines();
      loop {
        let line = match lines.next_line().await {
          Ok(Some(line)) => line,
          Ok(None) => break,
          Err(e) => {
            warn!("event input failed: {}", e);
            break;
          }
        };
        if line.trim().is_empty() {
          continue;
        }
        if tx.send(parse_line(&line, &origin)).is_err() {
          break;
        }
      }
      debug!("event input closed");
    });

    Self { rx }
  }

  /// Receive the next event. `None` once input is exhausted.
  pub async fn next(&mut self) -> Option<Inbound> {
    self.rx.recv().await
  }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum WireEvent {
  Install,
  Activate,
  ClientsReleased,
  Fetch {
    request: WireRequest,
  },
  Push {
    /// Text payload, or a JSON value taken as its serialization
    #[serde(default)]
    data: Option<serde_json::Value>,
  },
  #[serde(rename = "notificationclick")]
  NotificationClick {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    notification: NotificationPayload,
  },
  Sync {
    tag: String,
  },
  Message {
    data: serde_json::Value,
  },
  Enqueue {
    /// Caller-chosen mutation id, distinct from the correlation `id`
    #[serde(default)]
    mutation_id: Option<String>,
    endpoint: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    payload: serde_json::Value,
  },
}

#[derive(Debug, Deserialize)]
struct WireRequest {
  #[serde(default)]
  method: Option<String>,
  url: String,
  #[serde(default)]
  mode: RequestMode,
  #[serde(default)]
  accept: Option<String>,
  #[serde(default)]
  headers: BTreeMap<String, String>,
  #[serde(default)]
  body: Option<String>,
  #[serde(default)]
  body_encoding: BodyEncoding,
}

/// How a body travels inside a JSON line. Bodies that are not valid UTF-8
/// go as base64.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
  #[default]
  #[serde(rename = "utf-8")]
  Utf8,
  Base64,
}

impl BodyEncoding {
  fn is_utf8(&self) -> bool {
    *self == Self::Utf8
  }
}

fn encode_body(body: &[u8]) -> (String, BodyEncoding) {
  match std::str::from_utf8(body) {
    Ok(text) => (text.to_string(), BodyEncoding::Utf8),
    Err(_) => (BASE64.encode(body), BodyEncoding::Base64),
  }
}

fn decode_body(body: String, encoding: BodyEncoding) -> Result<Vec<u8>, String> {
  match encoding {
    BodyEncoding::Utf8 => Ok(body.into_bytes()),
    BodyEncoding::Base64 => BASE64
      .decode(body.as_bytes())
      .map_err(|e| format!("invalid base64 body: {}", e)),
  }
}

/// Decode one input line.
pub fn parse_line(line: &str, origin: &Url) -> Inbound {
  let value: serde_json::Value = match serde_json::from_str(line) {
    Ok(value) => value,
    Err(e) => {
      warn!("malformed event line: {}", e);
      return Inbound {
        id: None,
        event: Err(format!("malformed event: {}", e)),
      };
    }
  };

  let id = value.get("id").cloned();
  let event = WireEvent::deserialize(&value)
    .map_err(|e| format!("unrecognized event: {}", e))
    .and_then(|wire| into_engine_event(wire, origin));

  if let Err(e) = &event {
    warn!("rejected event line: {}", e);
  }
  Inbound { id, event }
}

fn into_engine_event(wire: WireEvent, origin: &Url) -> Result<EngineEvent, String> {
  let event = match wire {
    WireEvent::Install => EngineEvent::Install,
    WireEvent::Activate => EngineEvent::Activate,
    WireEvent::ClientsReleased => EngineEvent::ClientsReleased,
    WireEvent::Fetch { request } => EngineEvent::Fetch(request.into_request(origin)?),
    WireEvent::Push { data } => EngineEvent::Push(data.map(|d| match d {
      serde_json::Value::String(text) => text.into_bytes(),
      other => other.to_string().into_bytes(),
    })),
    WireEvent::NotificationClick {
      action,
      notification,
    } => EngineEvent::NotificationClick {
      action,
      notification,
    },
    WireEvent::Sync { tag } => EngineEvent::Sync { tag },
    WireEvent::Message { data } => EngineEvent::Message(data),
    WireEvent::Enqueue {
      mutation_id,
      endpoint,
      method,
      content_type,
      payload,
    } => {
      let mut mutation = NewMutation::json(resolve(origin, &endpoint)?, &payload);
      mutation.id = mutation_id;
      if let Some(method) = method {
        mutation.method = parse_method(&method)?;
      }
      if content_type.is_some() {
        mutation.content_type = content_type;
      }
      EngineEvent::Enqueue(mutation)
    }
  };
  Ok(event)
}

impl WireRequest {
  fn into_request(self, origin: &Url) -> Result<Request, String> {
    let method = match &self.method {
      Some(m) => parse_method(m)?,
      None => Method::GET,
    };
    let mut request = Request::new(method, resolve(origin, &self.url)?).with_mode(self.mode);
    if let Some(accept) = self.accept {
      request = request.with_accept(accept);
    }
    for (name, value) in self.headers {
      request = request.with_header(name, value);
    }
    if let Some(body) = self.body {
      request = request.with_body(decode_body(body, self.body_encoding)?);
    }
    Ok(request)
  }
}

fn resolve(origin: &Url, url: &str) -> Result<Url, String> {
  origin
    .join(url)
    .map_err(|e| format!("invalid url {}: {}", url, e))
}

fn parse_method(method: &str) -> Result<Method, String> {
  Method::from_bytes(method.to_ascii_uppercase().as_bytes())
    .map_err(|e| format!("invalid method {}: {}", method, e))
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum WireOutcome<'a> {
  Lifecycle {
    state: LifecycleState,
  },
  Activated {
    deleted: &'a [String],
  },
  Response {
    status: u16,
    headers: &'a BTreeMap<String, String>,
    body: String,
    #[serde(skip_serializing_if = "BodyEncoding::is_utf8")]
    body_encoding: BodyEncoding,
    source: ResponseSource,
  },
  Notification(&'a NotificationPayload),
  Navigation(&'a NavigationIntent),
  Replayed {
    succeeded: Vec<&'a str>,
    remaining: Vec<&'a str>,
  },
  Control {
    applied: Option<ControlCommand>,
  },
  Queued(&'a PendingMutation),
  Ignored,
  Error {
    message: &'a str,
  },
}

#[derive(Debug, Serialize)]
struct OutcomeLine<'a> {
  #[serde(skip_serializing_if = "Option::is_none")]
  id: Option<&'a serde_json::Value>,
  #[serde(flatten)]
  outcome: WireOutcome<'a>,
}

/// Encode an outcome as one output line (without the trailing newline).
pub fn render(id: Option<&serde_json::Value>, outcome: &Outcome) -> String {
  let outcome = match outcome {
    Outcome::Lifecycle(state) => WireOutcome::Lifecycle { state: *state },
    Outcome::Activated { deleted } => WireOutcome::Activated {
      deleted: deleted.as_slice(),
    },
    Outcome::Response(served) => {
      let (body, body_encoding) = encode_body(&served.response.body);
      WireOutcome::Response {
        status: served.response.status,
        headers: &served.response.headers,
        body,
        body_encoding,
        source: served.source,
      }
    }
    Outcome::Notification(payload) => WireOutcome::Notification(payload),
    Outcome::Navigation(intent) => WireOutcome::Navigation(intent),
    Outcome::Replayed(report) => WireOutcome::Replayed {
      succeeded: mutation_ids(&report.succeeded),
      remaining: mutation_ids(&report.remaining),
    },
    Outcome::Control(command) => WireOutcome::Control { applied: *command },
    Outcome::Queued(pending) => WireOutcome::Queued(pending),
    Outcome::Ignored => WireOutcome::Ignored,
    Outcome::Failed(message) => WireOutcome::Error {
      message: message.as_str(),
    },
  };

  let line = OutcomeLine { id, outcome };
  serde_json::to_string(&line).unwrap_or_else(|e| {
    warn!("could not encode outcome: {}", e);
    r#"{"type":"error","message":"unencodable outcome"}"#.to_string()
  })
}

fn mutation_ids(mutations: &[PendingMutation]) -> Vec<&str> {
  mutations.iter().map(|m| m.id.as_str()).collect()
}

/// Outcome line for an input line that could not be decoded.
pub fn render_rejected(id: Option<&serde_json::Value>, message: &str) -> String {
  render(id, &Outcome::Failed(message.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::Served;
  use crate::http::Response;
  use crate::queue::ReplayReport;
  use serde_json::{json, Value};

  fn origin() -> Url {
    Url::parse("http://localhost:5000").unwrap()
  }

  fn parse(line: &str) -> Inbound {
    parse_line(line, &origin())
  }

  fn decode(line: &str) -> Value {
    serde_json::from_str(line).unwrap()
  }

  #[test]
  fn test_lifecycle_events() {
    let inbound = parse(r#"{"type":"install","id":1}"#);
    assert_eq!(inbound.id, Some(json!(1)));
    assert!(matches!(inbound.event, Ok(EngineEvent::Install)));

    assert!(matches!(
      parse(r#"{"type":"clients-released"}"#).event,
      Ok(EngineEvent::ClientsReleased)
    ));
  }

  #[test]
  fn test_fetch_resolves_against_origin() {
    let inbound = parse(
      r#"{"type":"fetch","request":{"url":"/dashboard","mode":"navigate","accept":"text/html"}}"#,
    );
    let Ok(EngineEvent::Fetch(request)) = inbound.event else {
      panic!("expected fetch");
    };
    assert_eq!(request.url.as_str(), "http://localhost:5000/dashboard");
    assert_eq!(request.method, Method::GET);
    assert_eq!(request.mode, RequestMode::Navigate);
  }

  #[test]
  fn test_fetch_mutation_keeps_body_and_headers() {
    let inbound = parse(
      r#"{"type":"fetch","request":{"method":"post","url":"/api/emissions","headers":{"Content-Type":"application/json"},"body":"{\"value\":1}"}}"#,
    );
    let Ok(EngineEvent::Fetch(request)) = inbound.event else {
      panic!("expected fetch");
    };
    assert_eq!(request.method, Method::POST);
    assert_eq!(request.headers.get("content-type").map(String::as_str), Some("application/json"));
    assert_eq!(request.body.as_deref(), Some(br#"{"value":1}"#.as_slice()));
  }

  #[test]
  fn test_push_payload_forms() {
    let Ok(EngineEvent::Push(Some(raw))) = parse(r#"{"type":"push","data":"{\"title\":\"A\"}"}"#).event else {
      panic!("expected push");
    };
    assert_eq!(raw, br#"{"title":"A"}"#.to_vec());

    let Ok(EngineEvent::Push(Some(raw))) = parse(r#"{"type":"push","data":{"title":"B"}}"#).event else {
      panic!("expected push");
    };
    assert_eq!(raw, br#"{"title":"B"}"#.to_vec());

    assert!(matches!(parse(r#"{"type":"push"}"#).event, Ok(EngineEvent::Push(None))));
  }

  #[test]
  fn test_notification_click_defaults() {
    let Ok(EngineEvent::NotificationClick {
      action,
      notification,
    }) = parse(r#"{"type":"notificationclick","action":"dismiss"}"#).event
    else {
      panic!("expected click");
    };
    assert_eq!(action.as_deref(), Some("dismiss"));
    assert_eq!(notification, NotificationPayload::default());
  }

  #[test]
  fn test_enqueue_event() {
    let Ok(EngineEvent::Enqueue(mutation)) =
      parse(r#"{"type":"enqueue","mutation_id":"draft-1","endpoint":"/api/emissions","payload":{"value":4}}"#).event
    else {
      panic!("expected enqueue");
    };
    assert_eq!(mutation.id.as_deref(), Some("draft-1"));
    assert_eq!(mutation.endpoint.path(), "/api/emissions");
    assert_eq!(mutation.method, Method::POST);
    assert_eq!(mutation.payload, br#"{"value":4}"#.to_vec());
  }

  #[test]
  fn test_malformed_lines_are_rejected() {
    let inbound = parse("not json");
    assert!(inbound.id.is_none());
    assert!(inbound.event.is_err());

    let inbound = parse(r#"{"type":"teleport","id":"x"}"#);
    assert_eq!(inbound.id, Some(json!("x")));
    assert!(inbound.event.unwrap_err().starts_with("unrecognized event"));

    let inbound = parse(r#"{"type":"fetch","request":{"method":"GET","url":"http://[bad"}}"#);
    assert!(inbound.event.is_err());
  }

  #[test]
  fn test_render_response() {
    let served = Served::from_network(Response::ok("hello").with_header("Content-Type", "text/plain"));
    let line = decode(&render(Some(&json!(7)), &Outcome::Response(served)));
    assert_eq!(line["id"], json!(7));
    assert_eq!(line["type"], "response");
    assert_eq!(line["status"], 200);
    assert_eq!(line["body"], "hello");
    assert_eq!(line["source"], "network");
  }

  #[test]
  fn test_binary_response_body_is_base64() {
    let png = vec![137u8, 80, 78, 71, 255, 0, 254];
    let served = Served::from_network(Response::ok(png.clone()).with_header("Content-Type", "image/png"));
    let line = decode(&render(None, &Outcome::Response(served)));

    assert_eq!(line["body_encoding"], "base64");
    let body = line["body"].as_str().unwrap().to_string();
    assert_eq!(decode_body(body, BodyEncoding::Base64).unwrap(), png);
  }

  #[test]
  fn test_text_response_body_has_no_encoding_field() {
    let line = decode(&render(None, &Outcome::Response(Served::from_network(Response::ok("plain")))));
    assert!(line.get("body_encoding").is_none());
  }

  #[test]
  fn test_binary_request_body_round_trips() {
    let png = [137u8, 80, 78, 71, 255, 0, 254];
    let line = json!({
      "type": "fetch",
      "request": {
        "method": "PUT",
        "url": "/api/uploads/logo",
        "body": BASE64.encode(png),
        "body_encoding": "base64"
      }
    })
    .to_string();

    let Ok(EngineEvent::Fetch(request)) = parse(&line).event else {
      panic!("expected fetch");
    };
    assert_eq!(request.body.as_deref(), Some(png.as_slice()));

    let bad = r#"{"type":"fetch","request":{"url":"/x","body":"%%%","body_encoding":"base64"}}"#;
    assert!(parse(bad).event.is_err());
  }

  #[test]
  fn test_render_navigation_and_replay() {
    let line = decode(&render(
      None,
      &Outcome::Navigation(NavigationIntent::Focus {
        url: "/reports".to_string(),
      }),
    ));
    assert!(line.get("id").is_none());
    assert_eq!(line["type"], "navigation");
    assert_eq!(line["intent"], "focus");
    assert_eq!(line["url"], "/reports");

    let line = decode(&render(None, &Outcome::Replayed(ReplayReport::default())));
    assert_eq!(line["type"], "replayed");
    assert_eq!(line["succeeded"], json!([]));
  }

  #[test]
  fn test_render_rejected() {
    let line = decode(&render_rejected(Some(&json!("x")), "unrecognized event"));
    assert_eq!(line["type"], "error");
    assert_eq!(line["message"], "unrecognized event");
  }

  #[tokio::test]
  async fn test_handler_reads_lines_until_eof() {
    let input: &[u8] = b"{\"type\":\"install\"}\n\n{\"type\":\"sync\",\"tag\":\"emissions-sync\"}\n";
    let mut events = EventHandler::new(input, origin());

    assert!(matches!(events.next().await.unwrap().event, Ok(EngineEvent::Install)));
    assert!(matches!(
      events.next().await.unwrap().event,
      Ok(EngineEvent::Sync { ref tag }) if tag == "emissions-sync"
    ));
    assert!(events.next().await.is_none());
  }
}
