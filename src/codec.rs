//! Payload encoding and decoding.
//!
//! The transport moves opaque bodies; a [`PayloadCodec`] interprets them as
//! requests, responses, and server-pushed notifications. [`JsonCodec`]
//! implements the JSON-RPC 2.0 shapes, including batch arrays.

use std::fmt;

use serde_json::{json, Value};

use crate::error::Error;
use crate::trace::debug;

/// Failure code carried by responses the engine synthesizes itself, for
/// example when retries are exhausted or the connection is lost.
pub const INTERNAL_FAILURE_CODE: i64 = 5022;

/// Correlation key derived from a request's `id` value.
///
/// The key is the canonical JSON serialization of the id, so the string
/// `"1"` (key `"\"1\""`) and the number `1` (key `"1"`) never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallId(String);

impl CallId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&Value> for CallId {
    fn from(v: &Value) -> Self {
        CallId(v.to_string())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An outbound remote procedure call.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: Value,
    pub method: String,
    pub params: Value,
}

impl Request {
    #[must_use]
    pub fn new(id: Value, method: impl Into<String>, params: Value) -> Self {
        Request {
            id,
            method: method.into(),
            params,
        }
    }

    #[must_use]
    pub fn call_id(&self) -> CallId {
        CallId::from(&self.id)
    }
}

/// Error code in a response: numeric per the protocol, or free text for
/// transport-level failures reported by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    Number(i64),
    Text(String),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Number(n) => write!(f, "{n}"),
            ErrorCode::Text(s) => f.write_str(s),
        }
    }
}

/// Error member of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

/// A response to a tracked request.
#[derive(Debug, Clone)]
pub struct Response {
    pub id: Value,
    pub result: Option<Value>,
    pub error: Option<RpcError>,
}

impl Response {
    /// Builds a synthetic failure response with [`INTERNAL_FAILURE_CODE`].
    #[must_use]
    pub fn failure(id: Value, message: impl Into<String>) -> Self {
        Response {
            id,
            result: None,
            error: Some(RpcError {
                code: ErrorCode::Number(INTERNAL_FAILURE_CODE),
                message: message.into(),
            }),
        }
    }

    #[must_use]
    pub fn call_id(&self) -> CallId {
        CallId::from(&self.id)
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A server-pushed message with no request id.
#[derive(Debug, Clone)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

/// One decoded inbound payload.
#[derive(Debug, Clone)]
pub enum Incoming {
    Response(Response),
    Notification(Notification),
}

/// Interprets payload bytes. Implementations must be cheap to share across
/// the dispatch and tracker threads.
pub trait PayloadCodec: Send + Sync {
    /// Decodes one body into responses and notifications. A batch payload
    /// yields multiple entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] when the body is not parseable at all;
    /// unrecognized entries inside an otherwise valid batch are skipped.
    fn decode(&self, body: &[u8]) -> Result<Vec<Incoming>, Error>;

    /// Encodes a request for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the request cannot be serialized.
    fn encode_request(&self, request: &Request) -> Result<Vec<u8>, Error>;
}

/// JSON-RPC 2.0 codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    fn decode_one(&self, v: &Value) -> Option<Incoming> {
        let obj = v.as_object()?;
        if let Some(id) = obj.get("id").filter(|id| !id.is_null()) {
            let error = obj.get("error").and_then(decode_error);
            if obj.contains_key("result") || error.is_some() {
                return Some(Incoming::Response(Response {
                    id: id.clone(),
                    result: obj.get("result").cloned(),
                    error,
                }));
            }
        }
        // No usable id: a notification if a method is present.
        let method = obj.get("method")?.as_str()?.to_owned();
        Some(Incoming::Notification(Notification {
            method,
            params: obj.get("params").cloned().unwrap_or(Value::Null),
        }))
    }
}

fn decode_error(v: &Value) -> Option<RpcError> {
    let obj = v.as_object()?;
    let code = match obj.get("code") {
        Some(Value::Number(n)) => ErrorCode::Number(n.as_i64()?),
        Some(Value::String(s)) => ErrorCode::Text(s.clone()),
        _ => return None,
    };
    let message = obj
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    Some(RpcError { code, message })
}

impl PayloadCodec for JsonCodec {
    fn decode(&self, body: &[u8]) -> Result<Vec<Incoming>, Error> {
        let value: Value = serde_json::from_slice(body)?;
        let entries = match value {
            Value::Array(items) => items,
            single => vec![single],
        };
        let mut out = Vec::with_capacity(entries.len());
        for entry in &entries {
            match self.decode_one(entry) {
                Some(incoming) => out.push(incoming),
                None => debug!("skipping unrecognized payload entry"),
            }
        }
        Ok(out)
    }

    fn encode_request(&self, request: &Request) -> Result<Vec<u8>, Error> {
        let value = json!({
            "jsonrpc": "2.0",
            "id": request.id,
            "method": request.method,
            "params": request.params,
        });
        Ok(serde_json::to_vec(&value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_id_distinguishes_string_and_number() {
        assert_ne!(CallId::from(&json!(1)), CallId::from(&json!("1")));
        assert_eq!(CallId::from(&json!("abc")).as_str(), "\"abc\"");
        assert_eq!(CallId::from(&json!(42)).as_str(), "42");
    }

    #[test]
    fn call_id_is_stable_between_request_and_response() {
        for id in [json!("a-1"), json!(7), json!(null), json!([1, "x"])] {
            let request = Request::new(id.clone(), "m", json!({}));
            let response = Response {
                id,
                result: Some(json!(true)),
                error: None,
            };
            assert_eq!(request.call_id(), response.call_id());
        }
    }

    #[test]
    fn decode_single_response() {
        let body = br#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#;
        let decoded = JsonCodec.decode(body).unwrap();
        assert_eq!(decoded.len(), 1);
        let Incoming::Response(r) = &decoded[0] else {
            panic!("expected response");
        };
        assert_eq!(r.id, json!(7));
        assert_eq!(r.result, Some(json!({"ok": true})));
        assert!(!r.is_error());
    }

    #[test]
    fn decode_error_response() {
        let body = br#"{"id":"x","error":{"code":-32601,"message":"no method"}}"#;
        let decoded = JsonCodec.decode(body).unwrap();
        let Incoming::Response(r) = &decoded[0] else {
            panic!("expected response");
        };
        let err = r.error.as_ref().unwrap();
        assert_eq!(err.code, ErrorCode::Number(-32601));
        assert_eq!(err.message, "no method");
    }

    #[test]
    fn decode_notification() {
        let body = br#"{"jsonrpc":"2.0","method":"VM_status","params":{"vm":"a"}}"#;
        let decoded = JsonCodec.decode(body).unwrap();
        let Incoming::Notification(n) = &decoded[0] else {
            panic!("expected notification");
        };
        assert_eq!(n.method, "VM_status");
        assert_eq!(n.params, json!({"vm": "a"}));
    }

    #[test]
    fn decode_batch_mixes_kinds() {
        let body = br#"[
            {"id":1,"result":null},
            {"method":"ping","params":[]},
            {"garbage":true}
        ]"#;
        let decoded = JsonCodec.decode(body).unwrap();
        assert_eq!(decoded.len(), 2);
        assert!(matches!(decoded[0], Incoming::Response(_)));
        assert!(matches!(decoded[1], Incoming::Notification(_)));
    }

    #[test]
    fn decode_rejects_non_json() {
        assert!(matches!(
            JsonCodec.decode(b"not json"),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn encode_request_shape() {
        let req = Request::new(json!("id-1"), "Host.ping", json!({}));
        let bytes = JsonCodec.encode_request(&req).unwrap();
        let v: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["id"], "id-1");
        assert_eq!(v["method"], "Host.ping");
    }

    #[test]
    fn synthetic_failure_uses_internal_code() {
        let r = Response::failure(Value::Null, "retries exhausted");
        let err = r.error.unwrap();
        assert_eq!(err.code, ErrorCode::Number(INTERNAL_FAILURE_CODE));
        assert_eq!(err.message, "retries exhausted");
    }
}
