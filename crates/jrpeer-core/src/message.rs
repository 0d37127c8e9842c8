//! Wire messages and the inbound classifier.
//!
//! Outbound traffic is built from typed values ([`Request`], [`Response`]).
//! Inbound traffic is parsed into untyped JSON first and then sorted by
//! [`classify`] into an [`Incoming`] variant, so a malformed entry never
//! poisons the rest of a batch.

use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{ErrorCode, ProtocolError};

pub const JSONRPC_VERSION: &str = "2.0";

/// A call id: an integer or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Accepts strings and integers in the `i64` range. An integral float
    /// such as `1.0` counts as the integer it spells. Fractional numbers,
    /// integers above `i64::MAX`, `null` and anything else yield `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| {
                    let f = n.as_f64()?;
                    let integral = f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64;
                    integral.then_some(f as i64)
                })
                .map(Self::Number),
            Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for RequestId {
    fn from(n: i32) -> Self {
        Self::Number(n.into())
    }
}

impl From<u32> for RequestId {
    fn from(n: u32) -> Self {
        Self::Number(n.into())
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// A call or notification, in either direction.
///
/// Outbound, this is the descriptor handed to [`Peer::request`](crate::Peer::request):
/// a request without an id is sent as a notification. Inbound, handlers receive
/// the validated message as it arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

impl Request {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params: None,
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    /// Serialize `params` into an owned JSON value.
    pub fn try_with_params<T: Serialize + ?Sized>(
        mut self,
        params: &T,
    ) -> Result<Self, serde_json::Error> {
        self.params = Some(serde_json::to_value(params)?);
        Ok(self)
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Deserialize `params` into `T`, mapping failure to `INVALID_PARAMS`.
    pub fn parse_params<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let params = self.params.clone().unwrap_or(Value::Null);
        serde_json::from_value(params)
            .map_err(|e| ProtocolError::new(ErrorCode::InvalidParams, e.to_string()))
    }
}

/// A response to a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Success {
        jsonrpc: String,
        result: Value,
        id: RequestId,
    },
    Failure {
        jsonrpc: String,
        error: ProtocolError,
        id: Option<RequestId>,
    },
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self::Success {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result,
            id,
        }
    }

    /// An error response. A missing id is sent as `"id": null`.
    pub fn failure(id: Option<RequestId>, error: ProtocolError) -> Self {
        Self::Failure {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            error,
            id,
        }
    }
}

/// One parsed inbound entry, sorted by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Has `method` and a non-null `id`.
    Request(Map<String, Value>),
    /// Has `method` and no `id` (or `"id": null`).
    Notification(Map<String, Value>),
    /// Has `result`.
    Success {
        id: Option<RequestId>,
        result: Value,
    },
    /// Has `error`.
    Failure {
        id: Option<RequestId>,
        error: ProtocolError,
    },
    /// Not an object, or an object with none of the keys above.
    Unrecognized(Value),
}

impl Incoming {
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Success { .. } | Self::Failure { .. })
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Notification(_))
    }
}

/// A whole inbound text message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Single(Incoming),
    Batch(Vec<Incoming>),
}

/// Sort one JSON value into an [`Incoming`] variant.
///
/// Keys are checked in the order `error`, `result`, `method`.
pub fn classify(value: Value) -> Incoming {
    let Value::Object(mut map) = value else {
        return Incoming::Unrecognized(value);
    };

    let id = map.get("id").and_then(RequestId::from_value);

    if let Some(raw) = map.remove("error") {
        let error = ProtocolError::from_json(&raw).unwrap_or_else(|_| {
            ProtocolError::new(ErrorCode::InternalError, "malformed error object")
                .with_data_value(raw)
        });
        return Incoming::Failure { id, error };
    }

    if let Some(result) = map.remove("result") {
        return Incoming::Success { id, result };
    }

    if map.contains_key("method") {
        let is_notification = map.get("id").is_none_or(Value::is_null);
        return if is_notification {
            Incoming::Notification(map)
        } else {
            Incoming::Request(map)
        };
    }

    Incoming::Unrecognized(Value::Object(map))
}

/// Parse and classify an inbound text message.
///
/// Arrays become [`Envelope::Batch`]; any other JSON value is classified on
/// its own.
pub fn parse_envelope(text: &str) -> Result<Envelope, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    Ok(match value {
        Value::Array(entries) => Envelope::Batch(entries.into_iter().map(classify).collect()),
        other => Envelope::Single(classify(other)),
    })
}

/// The id to answer with when rejecting an unrecognized payload.
///
/// Returns `None` when the payload carries no `id` key at all (nothing to
/// answer), `Some(None)` when the key exists but is not a valid id (answer
/// with `"id": null`).
pub(crate) fn discoverable_id(value: &Value) -> Option<Option<RequestId>> {
    let raw = value.as_object()?.get("id")?;
    Some(RequestId::from_value(raw))
}

/// Validate an inbound call or notification.
pub(crate) fn validate_call(map: Map<String, Value>) -> Result<Request, ProtocolError> {
    if map.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(ProtocolError::new(
            ErrorCode::InvalidRequest,
            "Only JSON-RPC 2.0 RPC calls are supported.",
        ));
    }

    let id = match map.get("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(
            RequestId::from_value(raw).ok_or_else(|| ProtocolError::from_code(ErrorCode::InvalidRequest))?,
        ),
    };

    let method = map
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::from_code(ErrorCode::InvalidRequest))?
        .to_owned();

    Ok(Request {
        jsonrpc: JSONRPC_VERSION.to_owned(),
        method,
        params: map.get("params").cloned(),
        id,
    })
}
