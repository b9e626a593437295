//! Controller change-event stream over WebSocket.
//!
//! Subscribing is a two-step RESTCONF dance: POST a data-change-event
//! subscription to obtain a stream name, then GET the stream resource whose
//! `Location` header carries the WebSocket URL. The receiver is a loop task;
//! parsed events flow to handlers through a typed channel and all reconnect
//! logic lives in the loop itself.

use crate::config::OdlConfig;
use crate::error::{Result, TransportError, WebSocketError};
use crate::transport::{Method, RestClient};

use futures_util::StreamExt;
use regex::Regex;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Operational datastore path for port state, the stream this daemon cares
/// about.
pub const NEUTRON_PORTS_PATH: &str = "neutron:neutron/neutron:ports";

const SUBSCRIBE_PATH: &str = "operations/sal-remote:create-data-change-event-subscription";

/// What the controller says happened to a piece of data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOperation {
    Created,
    Updated,
    Deleted,
}

impl EventOperation {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(EventOperation::Created),
            "updated" => Some(EventOperation::Updated),
            "deleted" => Some(EventOperation::Deleted),
            _ => None,
        }
    }
}

/// One parsed data-change event.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub operation: EventOperation,
    pub path: String,
    pub data: Value,
}

/// Messages handed to the event handler task.
#[derive(Debug)]
pub enum StreamMessage {
    /// The socket (re)connected; handlers may need a reconciliation sweep.
    Connected,
    Change(ChangeEvent),
}

/// Extract the value of a `[key='value']` segment from an instance path.
pub fn extract_field(path: &str, key: &str) -> Option<String> {
    let pattern = format!(r"\[{}='(.*?)'\]", regex::escape(key));
    let re = Regex::new(&pattern).ok()?;
    re.captures(path)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Parse one WebSocket frame into the events it carries. The container is
/// `notification → data-changed-notification → data-change-event`, where the
/// innermost value is either a single object or an array.
pub fn parse_events(payload: &str) -> Vec<ChangeEvent> {
    let Ok(root) = serde_json::from_str::<Value>(payload) else {
        tracing::debug!("discarding non-JSON stream frame");
        return Vec::new();
    };

    let Some(container) = root
        .get("notification")
        .and_then(|n| n.get("data-changed-notification"))
        .and_then(|n| n.get("data-change-event"))
    else {
        return Vec::new();
    };

    let raw_events: Vec<&Value> = match container {
        Value::Array(items) => items.iter().collect(),
        single => vec![single],
    };

    raw_events
        .into_iter()
        .filter_map(|raw| {
            let operation = raw
                .get("operation")
                .and_then(Value::as_str)
                .and_then(EventOperation::parse)?;
            let path = raw.get("path").and_then(Value::as_str)?.to_string();
            let data = raw.get("data").cloned().unwrap_or(Value::Null);
            Some(ChangeEvent {
                operation,
                path,
                data,
            })
        })
        .collect()
}

/// Rewrite the stream URL to TLS when the REST side is TLS.
fn align_scheme(stream_url: &str, base_is_tls: bool) -> String {
    if base_is_tls && stream_url.starts_with("ws://") {
        stream_url.replacen("ws://", "wss://", 1)
    } else {
        stream_url.to_string()
    }
}

/// RESTCONF root derived from the northbound base URL: same scheme and
/// authority, `/restconf` path.
pub fn restconf_base(url: &str) -> Result<String> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| TransportError::InvalidResponse(format!("bad controller url: {e}")))?;
    let authority = parsed
        .host_str()
        .ok_or_else(|| TransportError::InvalidResponse("controller url has no host".into()))?;
    let port = parsed
        .port()
        .map(|p| format!(":{p}"))
        .unwrap_or_default();
    Ok(format!("{}://{}{}/restconf", parsed.scheme(), authority, port))
}

/// Long-running receiver task for one controller stream.
pub struct WebSocketReceiver {
    client: RestClient,
    stream_path: String,
    poll_interval: Duration,
    base_is_tls: bool,
    events: mpsc::Sender<StreamMessage>,
}

impl WebSocketReceiver {
    pub fn new(
        config: &OdlConfig,
        stream_path: &str,
        events: mpsc::Sender<StreamMessage>,
    ) -> Result<Self> {
        let base = restconf_base(&config.url)?;
        let base_is_tls = base.starts_with("https://");
        Ok(Self {
            client: RestClient::with_base_url(config, base)?,
            stream_path: stream_path.to_string(),
            poll_interval: Duration::from_secs(config.restconf_poll_interval),
            base_is_tls,
            events,
        })
    }

    /// Run until the stop channel flips. A rejected subscription is fatal;
    /// everything else retries at the poll interval.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *stop.borrow() {
                tracing::info!("websocket receiver stopping");
                return Ok(());
            }

            match self.connect_once(&mut stop).await {
                Ok(()) => {}
                Err(WebSocketError::SubscriptionRejected(reason)) => {
                    tracing::error!(%reason, "change-event subscription rejected");
                    return Err(WebSocketError::SubscriptionRejected(reason).into());
                }
                Err(err) => {
                    tracing::warn!(error = %err, "stream unavailable, retrying");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = stop.changed() => {}
            }
        }
    }

    /// One subscribe-connect-read cycle. Returns when the socket closes.
    async fn connect_once(
        &self,
        stop: &mut watch::Receiver<bool>,
    ) -> std::result::Result<(), WebSocketError> {
        let ws_url = self.subscribe().await?;
        tracing::info!(%ws_url, "connecting to controller change stream");

        let (ws, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| WebSocketError::Socket(e.to_string()))?;
        let (_, mut read) = ws.split();

        if self.events.send(StreamMessage::Connected).await.is_err() {
            return Ok(());
        }

        loop {
            tokio::select! {
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(payload))) => {
                            for event in parse_events(&payload) {
                                if self.events.send(StreamMessage::Change(event)).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {}
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(WebSocketError::Socket("stream closed".into()));
                        }
                        Some(Err(e)) => {
                            return Err(WebSocketError::Socket(e.to_string()));
                        }
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Two-step subscription. Returns the WebSocket URL to connect to.
    async fn subscribe(&self) -> std::result::Result<String, WebSocketError> {
        let body = json!({
            "input": {
                "path": self.stream_path,
                "sal-remote-augment:datastore": "OPERATIONAL",
                "sal-remote-augment:scope": "SUBTREE",
                "sal-remote-augment:notification-output-type": "JSON",
            }
        });

        let response = self
            .client
            .request(Method::Post, SUBSCRIBE_PATH, Some(&body))
            .await
            .map_err(|e| WebSocketError::StreamUnavailable(e.to_string()))?;
        let stream_name = match response.status().as_u16() {
            200..=299 => {
                let output: Value = response
                    .json()
                    .await
                    .map_err(|e| WebSocketError::StreamUnavailable(e.to_string()))?;
                output
                    .get("output")
                    .and_then(|o| o.get("stream-name"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        WebSocketError::StreamUnavailable("subscription reply without stream-name".into())
                    })?
            }
            400 => {
                return Err(WebSocketError::SubscriptionRejected(format!(
                    "controller rejected path {}",
                    self.stream_path
                )))
            }
            status => {
                return Err(WebSocketError::StreamUnavailable(format!(
                    "subscription returned HTTP {status}"
                )))
            }
        };

        let stream_resource = format!("streams/stream/{stream_name}");
        let response = self
            .client
            .request(Method::Get, &stream_resource, None)
            .await
            .map_err(|e| WebSocketError::StreamUnavailable(e.to_string()))?;
        if response.status().as_u16() == 404 {
            return Err(WebSocketError::StreamUnavailable(format!(
                "stream {stream_name} not registered yet"
            )));
        }

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                WebSocketError::StreamUnavailable("stream reply without Location header".into())
            })?;

        Ok(align_scheme(location, self.base_is_tls))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_single_event() {
        let payload = r#"{
            "notification": {
                "xmlns": "urn:ietf:params:xml:ns:netconf:notification:1.0",
                "data-changed-notification": {
                    "data-change-event": {
                        "path": "/neutron:neutron/neutron:ports/neutron:port[neutron:uuid='d6e6335d-3df3-4b67-a7aa-4107e34c5f28']",
                        "operation": "updated",
                        "data": {"status": {"content": "ACTIVE"}}
                    }
                }
            }
        }"#;

        let events = parse_events(payload);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, EventOperation::Updated);
        assert_eq!(
            extract_field(&events[0].path, "neutron:uuid").as_deref(),
            Some("d6e6335d-3df3-4b67-a7aa-4107e34c5f28")
        );
    }

    #[test]
    fn parses_an_event_array() {
        let payload = r#"{
            "notification": {
                "data-changed-notification": {
                    "data-change-event": [
                        {"path": "p1", "operation": "created", "data": {}},
                        {"path": "p2", "operation": "deleted"}
                    ]
                }
            }
        }"#;

        let events = parse_events(payload);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].operation, EventOperation::Created);
        assert_eq!(events[1].operation, EventOperation::Deleted);
        assert!(events[1].data.is_null());
    }

    #[test]
    fn malformed_frames_yield_no_events() {
        assert!(parse_events("not json").is_empty());
        assert!(parse_events(r#"{"notification": {}}"#).is_empty());
        assert!(parse_events(
            r#"{"notification": {"data-changed-notification": {"data-change-event":
                {"path": "p", "operation": "invented"}}}}"#
        )
        .is_empty());
    }

    #[test]
    fn stream_url_is_rewritten_to_wss_under_tls() {
        assert_eq!(
            align_scheme("ws://ctl:8185/data-change-event-subscription/x", true),
            "wss://ctl:8185/data-change-event-subscription/x"
        );
        assert_eq!(
            align_scheme("ws://ctl:8185/x", false),
            "ws://ctl:8185/x"
        );
    }

    #[test]
    fn restconf_base_keeps_scheme_and_authority() {
        assert_eq!(
            restconf_base("http://ctl:8080/controller/nb/v2/neutron").expect("base"),
            "http://ctl:8080/restconf"
        );
        assert_eq!(
            restconf_base("https://ctl/neutron").expect("base"),
            "https://ctl/restconf"
        );
    }

    #[test]
    fn extract_field_handles_absent_keys() {
        let path = "/neutron:neutron/neutron:ports/neutron:port[neutron:uuid='P1']";
        assert_eq!(extract_field(path, "neutron:uuid").as_deref(), Some("P1"));
        assert_eq!(extract_field(path, "neutron:name"), None);
    }
}
