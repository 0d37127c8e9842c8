//! Error codes and error types.

use core::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{PeerState, RequestId};

/// JSON-RPC error codes.
///
/// The first five are the predefined codes of JSON-RPC 2.0. The rest live in
/// the implementation-defined server range and are emitted by the peer itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum ErrorCode {
    // Predefined by JSON-RPC 2.0
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,

    // Server range, peer-specific
    CallTimedOut = -32001,
    HandlerFailed = -32002,
    CallCanceled = -32003,
}

/// Codes reserved for implementation-defined server errors.
pub const SERVER_ERROR_RANGE: RangeInclusive<i64> = -32099..=-32000;

/// Code used by [`ProtocolError::default`].
pub const DEFAULT_ERROR_CODE: i64 = -32099;

impl ErrorCode {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            -32700 => Some(Self::ParseError),
            -32600 => Some(Self::InvalidRequest),
            -32601 => Some(Self::MethodNotFound),
            -32602 => Some(Self::InvalidParams),
            -32603 => Some(Self::InternalError),
            -32001 => Some(Self::CallTimedOut),
            -32002 => Some(Self::HandlerFailed),
            -32003 => Some(Self::CallCanceled),
            _ => None,
        }
    }

    pub const fn code(self) -> i64 {
        self as i64
    }
}

impl From<ErrorCode> for i64 {
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ParseError => write!(f, "parse error"),
            Self::InvalidRequest => write!(f, "invalid request"),
            Self::MethodNotFound => write!(f, "method not found"),
            Self::InvalidParams => write!(f, "invalid params"),
            Self::InternalError => write!(f, "internal error"),
            Self::CallTimedOut => write!(f, "call timed out"),
            Self::HandlerFailed => write!(f, "handler failed"),
            Self::CallCanceled => write!(f, "call canceled"),
        }
    }
}

/// The message a [`ProtocolError`] gets when none is supplied.
pub fn default_message(code: i64) -> &'static str {
    match code {
        -32700 => "Parse error",
        -32600 => "Invalid Request",
        -32601 => "Method not found",
        -32602 => "Invalid params",
        -32603 => "Internal error",
        c if SERVER_ERROR_RANGE.contains(&c) => "Server error",
        _ => "Unknown error",
    }
}

/// The error object exchanged on the wire when a call fails.
///
/// `data` is tri-state on the wire: absent, `null`, or a value. `None` means
/// absent; `Some(Value::Null)` is an explicit `null` and is serialized as
/// `"data": null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawProtocolError")]
pub struct ProtocolError {
    code: i64,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

#[derive(Deserialize)]
struct RawProtocolError {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default, deserialize_with = "deserialize_present")]
    data: Option<Value>,
}

// A present key always yields `Some`, even when its value is `null`.
fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl From<RawProtocolError> for ProtocolError {
    fn from(raw: RawProtocolError) -> Self {
        Self {
            code: raw.code,
            message: raw
                .message
                .unwrap_or_else(|| default_message(raw.code).to_owned()),
            data: raw.data,
        }
    }
}

impl ProtocolError {
    /// Create an error with an explicit message and no data.
    pub fn new(code: impl Into<i64>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Create an error whose message is derived from `code`.
    pub fn from_code(code: impl Into<i64>) -> Self {
        let code = code.into();
        Self::new(code, default_message(code))
    }

    /// Attach data, serializing it into an owned JSON value.
    pub fn with_data<T: Serialize + ?Sized>(mut self, data: &T) -> Result<Self, serde_json::Error> {
        self.data = Some(serde_json::to_value(data)?);
        Ok(self)
    }

    /// Attach an already-built JSON value as data.
    pub fn with_data_value(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn code(&self) -> i64 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn set_data(&mut self, data: Value) {
        self.data = Some(data);
    }

    pub fn clear_data(&mut self) {
        self.data = None;
    }

    /// Overwrite code, message and data with those of `other`.
    pub fn assign(&mut self, other: &ProtocolError) {
        self.clone_from(other);
    }

    /// The predefined code this error carries, if any.
    pub fn known_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_i64(self.code)
    }

    /// Encode as a JSON object. `data` is omitted when absent.
    pub fn to_json(&self) -> Value {
        let mut object = serde_json::Map::new();
        object.insert("code".into(), Value::from(self.code));
        object.insert("message".into(), Value::from(self.message.clone()));
        if let Some(data) = &self.data {
            object.insert("data".into(), data.clone());
        }
        Value::Object(object)
    }

    /// Decode from a JSON object. A literal `data` key sets data, even if `null`.
    pub fn from_json(value: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }

    pub(crate) fn timed_out(id: &RequestId, timeout_ms: u128) -> Self {
        Self::new(
            ErrorCode::CallTimedOut,
            format!("RPC call {id} timed out after {timeout_ms} ms"),
        )
    }

    pub(crate) fn canceled_by_close(id: &RequestId) -> Self {
        Self::new(
            ErrorCode::CallCanceled,
            format!("RPC call {id} has been canceled because the peer is being closed"),
        )
    }
}

impl Default for ProtocolError {
    fn default() -> Self {
        Self::from_code(DEFAULT_ERROR_CODE)
    }
}

impl From<ErrorCode> for ProtocolError {
    fn from(code: ErrorCode) -> Self {
        Self::from_code(code)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for ProtocolError {}

/// Transport-level errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport is not open")]
    NotOpen,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by [`Peer`](crate::Peer) operations and through
/// [`PeerEvent::ErrorOccurred`](crate::PeerEvent::ErrorOccurred).
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("the peer is already being opened")]
    AlreadyOpening,
    #[error("the peer is already opened")]
    AlreadyOpened,
    #[error("the peer is in corrupted state")]
    Corrupted,
    #[error("the peer is being closed")]
    BeingClosed,
    #[error("the peer is being opened")]
    OpenInProgress,
    #[error("the peer is already being closed")]
    AlreadyClosing,
    #[error("cannot send while the peer is {0}")]
    NotOpened(PeerState),
    #[error("invalid call at position {index}: {reason}")]
    InvalidCall { index: usize, reason: String },
    #[error("RPC call {0} is already pending")]
    DuplicateId(RequestId),
    #[error("too many pending RPC calls (max {max})")]
    TooManyPending { max: usize },
    #[error("a different handler is already registered for method '{0}'")]
    HandlerConflict(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("the connection has been closed ({code}): {reason}")]
    TransportClosed { code: u16, reason: String },
    #[error("serialize error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("handler for '{method}' failed: {source}")]
    Handler {
        method: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// What a handler returns when it cannot produce a result.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Forwarded to the caller verbatim.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Sent to the caller as [`ErrorCode::HandlerFailed`] carrying only the
    /// display message; the full error stays local.
    #[error("{0}")]
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn failed<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Failed(error.into())
    }

    /// The error object sent over the wire for this failure.
    pub fn to_protocol_error(&self) -> ProtocolError {
        match self {
            Self::Protocol(e) => e.clone(),
            Self::Failed(e) => ProtocolError::new(ErrorCode::HandlerFailed, e.to_string()),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Failed(Box::new(e))
    }
}

impl From<ErrorCode> for HandlerError {
    fn from(code: ErrorCode) -> Self {
        Self::Protocol(code.into())
    }
}
