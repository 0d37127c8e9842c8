//! The calculator handler set used by the scenarios and the demo.

use std::time::Duration;

use jrpeer_core::{ErrorCode, Peer, PeerError, ProtocolError, Request, RpcHandler, rpc_handler};
use serde_json::{Number, Value, json};

const NUMBERS_EXPECTED: &str = "'params' must be an array of numbers.";

/// `[a, b]` as two JSON numbers.
fn operands(request: &Request) -> Result<(Number, Number), ProtocolError> {
    let invalid = || ProtocolError::new(ErrorCode::InvalidParams, NUMBERS_EXPECTED);
    match request.params.as_ref() {
        Some(Value::Array(items)) => match items.as_slice() {
            [Value::Number(a), Value::Number(b)] => Ok((a.clone(), b.clone())),
            _ => Err(invalid()),
        },
        _ => Err(invalid()),
    }
}

/// Integer arithmetic when both sides are integers and it doesn't overflow,
/// floating point otherwise.
fn combine(
    (a, b): (Number, Number),
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Value {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        if let Some(n) = int_op(a, b) {
            return json!(n);
        }
    }
    let a = a.as_f64().unwrap_or(f64::NAN);
    let b = b.as_f64().unwrap_or(f64::NAN);
    Number::from_f64(float_op(a, b)).map_or(Value::Null, Value::Number)
}

pub fn add() -> RpcHandler {
    rpc_handler(|_cx, request| async move {
        let pair = operands(&request)?;
        Ok(combine(pair, i64::checked_add, |a, b| a + b))
    })
}

pub fn subtract() -> RpcHandler {
    rpc_handler(|_cx, request| async move {
        let pair = operands(&request)?;
        Ok(combine(pair, i64::checked_sub, |a, b| a - b))
    })
}

/// Returns its params unchanged, or `null` without params.
pub fn echo() -> RpcHandler {
    rpc_handler(|_cx, request| async move { Ok(request.params.unwrap_or(Value::Null)) })
}

/// `sleep([ms])`: waits, then returns `ms`.
pub fn sleep() -> RpcHandler {
    rpc_handler(|_cx, request| async move {
        let [ms]: [u64; 1] = request.parse_params()?;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!(ms))
    })
}

pub fn handlers() -> Vec<(&'static str, RpcHandler)> {
    vec![
        ("add", add()),
        ("subtract", subtract()),
        ("echo", echo()),
        ("sleep", sleep()),
    ]
}

/// Register every calculator method on `peer`.
pub fn install(peer: &Peer) -> Result<(), PeerError> {
    for (method, handler) in handlers() {
        peer.set_rpc_handler(method, handler)?;
    }
    Ok(())
}
