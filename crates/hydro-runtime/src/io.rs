//! Controller transports and wire messages.

#![allow(missing_docs)]

use std::future::Future;
use std::pin::Pin;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;
use tokio::sync::mpsc;

mod loopback;
mod network;
mod registry;
mod serial;

pub use loopback::LoopbackTransport;
pub use network::{encode_datagram, NetworkConfig, NetworkTransport};
pub use registry::{Connector, TransportRegistry};
pub use serial::{encode_line, SerialConfig, SerialTransport};

use crate::config::ControllerConfig;
use crate::error::CommandError;

/// Controller identifier as configured.
pub type ControllerId = SmolStr;

/// Boxed future returned by transport operations.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Sender half used by transports to publish inbound traffic and link state.
pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// One outbound command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Correlation id, assigned by the transport manager at enqueue time.
    pub id: u64,
    pub cmd: SmolStr,
    #[serde(flatten)]
    pub fields: IndexMap<SmolStr, Value>,
}

impl Packet {
    /// Build a packet with no fields; the id is assigned when enqueued.
    #[must_use]
    pub fn new(cmd: impl Into<SmolStr>) -> Self {
        Self {
            id: 0,
            cmd: cmd.into(),
            fields: IndexMap::new(),
        }
    }

    /// Append a field, preserving insertion order on the wire.
    #[must_use]
    pub fn with(mut self, key: impl Into<SmolStr>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Address a `<port>_<gpio>` pin.
    #[must_use]
    pub fn pin(self, port: u8, gpio: u8) -> Self {
        self.with("port", port).with("gpio", gpio)
    }

    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// True for keyword-only commands such as `ping` or `status`.
    #[must_use]
    pub fn is_bare(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// One correlated reply from a controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SmolStr>,
}

impl Response {
    #[must_use]
    pub fn ok(id: Option<u64>, data: Option<Value>) -> Self {
        Self {
            id,
            status: ResponseStatus::Ok,
            data,
            error: None,
        }
    }

    #[must_use]
    pub fn error(id: Option<u64>, message: impl Into<SmolStr>) -> Self {
        Self {
            id,
            status: ResponseStatus::Error,
            data: None,
            error: Some(message.into()),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self.status, ResponseStatus::Ok)
    }
}

/// Parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Structured reply carrying a status.
    Response(Response),
    /// Structured message without a status (sensor push, firmware event).
    Unsolicited(Value),
    /// Free text: boot banners, debug prints.
    Log(SmolStr),
}

/// Link notifications replacing message/error/close callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(InboundMessage),
    Error(SmolStr),
    Closed,
}

/// Everything a connector needs to open one controller link.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub controller: ControllerConfig,
    pub events: TransportEvents,
}

/// Byte/datagram connection to one controller.
pub trait Transport: Send + Sync {
    /// Canonical connection kind (`serial`, `network`, ...).
    fn kind(&self) -> &str;

    /// Write one packet; resolves once the medium accepted it.
    fn send<'a>(&'a self, packet: &'a Packet) -> TransportFuture<'a, Result<(), CommandError>>;

    /// Close the link and stop the reader.
    fn disconnect(&self) -> TransportFuture<'_, ()>;

    fn is_connected(&self) -> bool;
}

/// Classify one complete inbound frame.
#[must_use]
pub fn classify_frame(text: &str) -> InboundMessage {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(trimmed) {
            return classify_object(object);
        }
    }
    InboundMessage::Log(SmolStr::new(trimmed))
}

fn classify_object(object: serde_json::Map<String, Value>) -> InboundMessage {
    let Some(status) = object.get("status").and_then(parse_status) else {
        return InboundMessage::Unsolicited(Value::Object(object));
    };
    let id = object.get("id").and_then(parse_id);
    let error = object
        .get("error")
        .or_else(|| object.get("message"))
        .and_then(|value| match value {
            Value::String(text) => Some(SmolStr::new(text)),
            Value::Null => None,
            other => Some(SmolStr::new(other.to_string())),
        });
    let data = object.get("data").cloned().filter(|value| !value.is_null());
    InboundMessage::Response(Response {
        id,
        status,
        data,
        error,
    })
}

fn parse_status(value: &Value) -> Option<ResponseStatus> {
    let text = value.as_str()?;
    match text.trim().to_ascii_lowercase().as_str() {
        "ok" | "success" => Some(ResponseStatus::Ok),
        "error" | "err" | "fail" => Some(ResponseStatus::Error),
        _ => None,
    }
}

fn parse_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_objects_are_responses() {
        let msg = classify_frame(r#"{"id":12,"status":"ok","data":{"value":6.1}}"#);
        assert_eq!(
            msg,
            InboundMessage::Response(Response::ok(Some(12), Some(json!({"value": 6.1}))))
        );
    }

    #[test]
    fn string_ids_and_missing_ids_are_accepted() {
        let InboundMessage::Response(with_text_id) =
            classify_frame(r#"{"id":"9","status":"error","error":"busy"}"#)
        else {
            panic!("expected response");
        };
        assert_eq!(with_text_id.id, Some(9));
        assert_eq!(with_text_id.error.as_deref(), Some("busy"));

        let InboundMessage::Response(without_id) = classify_frame(r#"{"status":"ok"}"#) else {
            panic!("expected response");
        };
        assert_eq!(without_id.id, None);
    }

    #[test]
    fn objects_without_status_are_unsolicited() {
        let msg = classify_frame(r#"{"type":"sensor","pin":"2_34","value":512}"#);
        assert!(matches!(msg, InboundMessage::Unsolicited(_)));
    }

    #[test]
    fn banners_and_broken_json_are_logs() {
        assert_eq!(
            classify_frame("ets Jun  8 2016 00:22:57\r"),
            InboundMessage::Log("ets Jun  8 2016 00:22:57".into())
        );
        assert!(matches!(
            classify_frame(r#"{"status":"ok""#),
            InboundMessage::Log(_)
        ));
    }

    #[test]
    fn packet_fields_keep_insertion_order_in_json() {
        let mut packet = Packet::new("pwm_write").pin(1, 5).with("duty", 128);
        packet.id = 3;
        let text = serde_json::to_string(&packet).expect("serialize");
        assert_eq!(
            text,
            r#"{"id":3,"cmd":"pwm_write","port":1,"gpio":5,"duty":128}"#
        );
    }
}
