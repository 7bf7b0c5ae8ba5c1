//! DAP message envelopes.
//!
//! Only the envelope is interpreted (`seq`, `type`, `command`/`event`,
//! `request_seq`, `success`). Arguments and bodies stay raw JSON so they are
//! forwarded to and from the backend untouched.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Outgoing request envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub command: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub arguments: Value,
}

impl Request {
    pub fn new(seq: i64, command: impl Into<String>, arguments: Value) -> Self {
        Self {
            seq,
            r#type: "request",
            command: command.into(),
            arguments,
        }
    }
}

/// Request sent by the backend to the client (reverse request, e.g. `runInTerminal`).
#[derive(Debug, Clone, Deserialize)]
pub struct ReverseRequest {
    pub seq: i64,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Response envelope.
///
/// DAP allows responses without `body`, in this case body is `Value::Null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub seq: i64,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub body: Value,
}

impl Response {
    /// Turn unsuccessful response into [`Error::RequestFailed`].
    pub fn into_result(self) -> Result<Response> {
        if self.success {
            Ok(self)
        } else {
            Err(Error::RequestFailed {
                message: self.failure_message(),
                command: self.command,
            })
        }
    }

    /// Human readable failure reason, prefers `body.error.format` over `message`.
    pub fn failure_message(&self) -> String {
        self.body
            .pointer("/error/format")
            .and_then(Value::as_str)
            .or(self.message.as_deref())
            .unwrap_or("unknown error")
            .to_string()
    }
}

/// Outgoing response to a reverse request.
#[derive(Debug, Serialize)]
pub struct ReverseResponse {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub body: Value,
}

/// Event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: i64,
    pub event: String,
    #[serde(default)]
    pub body: Value,
}

impl Event {
    /// Thread id carried by the event body, if any.
    pub fn thread_id(&self) -> Option<i64> {
        self.body.get("threadId").and_then(Value::as_i64)
    }
}

/// Any message received from a backend.
#[derive(Debug, Clone)]
pub enum Message {
    Request(ReverseRequest),
    Response(Response),
    Event(Event),
}

impl Message {
    /// Classify a raw JSON message by its `type` field.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(ref obj) = value else {
            return Err(Error::Protocol(format!("message is not an object: {value}")));
        };
        if !obj.get("seq").is_some_and(Value::is_i64) {
            return Err(Error::Protocol("message without integer `seq`".to_string()));
        }

        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let parsed = match kind.as_str() {
            "request" => serde_json::from_value(value).map(Message::Request),
            "response" => serde_json::from_value(value).map(Message::Response),
            "event" => serde_json::from_value(value).map(Message::Event),
            other => {
                return Err(Error::Protocol(format!("unknown message type `{other}`")));
            }
        };
        parsed.map_err(|e| Error::Protocol(format!("malformed {kind}: {e}")))
    }
}

/// Merge `overrides` into an arguments object, `overrides` wins on conflicts.
pub fn merge_arguments(base: Value, overrides: &Value) -> Value {
    let mut base = match base {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => return other,
    };
    if let Value::Object(extra) = overrides {
        for (k, v) in extra {
            base.insert(k.clone(), v.clone());
        }
    }
    Value::Object(base)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_messages() {
        let msg = Message::from_value(json!({
            "seq": 3, "type": "response", "request_seq": 1, "success": true, "command": "initialize"
        }))
        .unwrap();
        let Message::Response(resp) = msg else {
            panic!("response expected");
        };
        assert_eq!(resp.request_seq, 1);
        assert!(resp.body.is_null());

        let msg = Message::from_value(json!({
            "seq": 4, "type": "event", "event": "stopped", "body": {"threadId": 7}
        }))
        .unwrap();
        let Message::Event(event) = msg else {
            panic!("event expected");
        };
        assert_eq!(event.thread_id(), Some(7));

        let msg = Message::from_value(json!({
            "seq": 5, "type": "request", "command": "runInTerminal", "arguments": {}
        }))
        .unwrap();
        assert!(matches!(msg, Message::Request(r) if r.command == "runInTerminal"));
    }

    #[test]
    fn test_malformed_messages() {
        let cases = [
            json!([1, 2]),
            json!({"type": "event", "event": "x"}),
            json!({"seq": 1, "type": "nope"}),
            json!({"seq": 1, "type": "response", "command": "x"}),
        ];
        for value in cases {
            assert!(matches!(Message::from_value(value), Err(Error::Protocol(_))));
        }
    }

    #[test]
    fn test_failure_message() {
        let resp: Response = serde_json::from_value(json!({
            "seq": 2, "request_seq": 1, "success": false, "command": "launch",
            "message": "generic", "body": {"error": {"format": "file not found"}}
        }))
        .unwrap();
        assert_eq!(resp.failure_message(), "file not found");
        assert!(matches!(
            resp.into_result(),
            Err(Error::RequestFailed { command, message }) if command == "launch" && message == "file not found"
        ));
    }

    #[test]
    fn test_merge_arguments() {
        let merged = merge_arguments(json!({"a": 1, "b": 2}), &json!({"b": 3, "c": 4}));
        assert_eq!(merged, json!({"a": 1, "b": 3, "c": 4}));
        assert_eq!(merge_arguments(Value::Null, &json!({"x": true})), json!({"x": true}));
    }
}
