//! Wire messages exchanged between a client context and a service context.
//!
//! Every message is an [`Envelope`] carrying the address of the context it is
//! meant for. Payloads are opaque JSON values.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request name used to start a named observable on the service.
pub const OBSERVABLE_METHOD: &str = "observable";
/// Request name used by a subscriber to ask for cancellation.
pub const OBSERVABLE_CANCEL_METHOD: &str = "observablecancel";

/// Opaque address of an execution context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier correlating one producer with its subscriber.
///
/// Generated by the client that starts the stream and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind tag of a stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Write,
    Close,
    Abort,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Write => "write",
            EventKind::Close => "close",
            EventKind::Abort => "abort",
        }
    }

    /// Returns true for kinds that end the stream.
    pub fn is_terminal(self) -> bool {
        !matches!(self, EventKind::Write)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stream event body sent producer → subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservableEventMsg {
    pub id: StreamId,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub data: Value,
}

/// Body of a request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMsg {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

/// Outcome carried by a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyResult {
    Ok(Value),
    Err(Value),
}

impl From<Result<Value, Value>> for ReplyResult {
    fn from(result: Result<Value, Value>) -> Self {
        match result {
            Ok(value) => ReplyResult::Ok(value),
            Err(reason) => ReplyResult::Err(reason),
        }
    }
}

impl From<ReplyResult> for Result<Value, Value> {
    fn from(result: ReplyResult) -> Self {
        match result {
            ReplyResult::Ok(value) => Ok(value),
            ReplyResult::Err(reason) => Err(reason),
        }
    }
}

/// Body of a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMsg {
    pub id: u64,
    pub result: ReplyResult,
}

/// Payload of an [`OBSERVABLE_METHOD`] request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartObservableMsg {
    pub id: StreamId,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// Payload of an [`OBSERVABLE_CANCEL_METHOD`] request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelObservableMsg {
    pub id: StreamId,
    #[serde(default)]
    pub reason: Value,
}

/// Failure description produced by the library itself.
///
/// Failures raised by user cancel handlers travel verbatim instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub name: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Reads a library failure back out of a reply payload.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({ "name": self.name, "message": self.message })
    }
}

/// Top-level transport message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    ObservableEvent {
        recipient: Address,
        data: ObservableEventMsg,
    },
    Request {
        sender: Address,
        recipient: Address,
        data: RequestMsg,
    },
    Response {
        recipient: Address,
        data: ResponseMsg,
    },
}

impl Envelope {
    pub fn recipient(&self) -> &Address {
        match self {
            Envelope::ObservableEvent { recipient, .. }
            | Envelope::Request { recipient, .. }
            | Envelope::Response { recipient, .. } => recipient,
        }
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn observable_event_matches_wire_layout() {
        let envelope = Envelope::ObservableEvent {
            recipient: Address::new("client-1"),
            data: ObservableEventMsg {
                id: StreamId::new("client-1:7"),
                kind: EventKind::Write,
                data: json!("lorem"),
            },
        };

        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(
            value,
            json!({
                "type": "observableevent",
                "recipient": "client-1",
                "data": { "id": "client-1:7", "type": "write", "data": "lorem" }
            })
        );
    }

    #[test]
    fn close_without_payload_decodes_as_null() {
        let text = r#"{"type":"observableevent","recipient":"c","data":{"id":"s","type":"close"}}"#;
        let envelope = Envelope::from_text(text).expect("decode");
        match envelope {
            Envelope::ObservableEvent { data, .. } => {
                assert_eq!(data.kind, EventKind::Close);
                assert_eq!(data.data, Value::Null);
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn response_result_is_externally_tagged() {
        let envelope = Envelope::Response {
            recipient: Address::new("client-1"),
            data: ResponseMsg {
                id: 3,
                result: ReplyResult::Err(json!("nope")),
            },
        };
        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(value["type"], "response");
        assert_eq!(value["data"]["result"], json!({ "err": "nope" }));

        let decoded = Envelope::from_text(&envelope.to_text().expect("encode")).expect("decode");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn remote_error_reads_back_from_value() {
        let error = RemoteError::new("NotImplementedError", "nothing here");
        assert_eq!(RemoteError::from_value(&error.to_value()), Some(error));
        assert_eq!(RemoteError::from_value(&json!("plain")), None);
    }

    #[test]
    fn terminal_kinds() {
        assert!(!EventKind::Write.is_terminal());
        assert!(EventKind::Close.is_terminal());
        assert!(EventKind::Abort.is_terminal());
    }
}
