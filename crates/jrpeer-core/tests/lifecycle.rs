// Peer engine tests against a raw in-memory transport end.
//
// The far end is driven by hand so every test can assert on the exact
// messages that cross the wire.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use jrpeer_core::{
    Connect, ErrorCode, EventKind, HandlerError, Inbound, OpenTarget, Peer, PeerConfig, PeerError,
    PeerEvent, PeerState, ProtocolError, Request, RequestId, RequestOptions, RpcHandler,
    TRANSPORT_ERROR_REASON, Transport, TransportError, WaitError, listener, non_json_handler,
    non_protocol_handler, rpc_handler,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn test_peer() -> Peer {
    Peer::with_config(PeerConfig::default())
}

async fn open_raw(peer: &Peer) -> Transport {
    let (local, remote) = Transport::mem_pair();
    peer.open(OpenTarget::adopt(local)).await.unwrap();
    remote
}

async fn recv(remote: &Transport) -> Inbound {
    timeout(WAIT, remote.recv())
        .await
        .expect("timed out waiting for the peer")
        .unwrap()
}

async fn recv_json(remote: &Transport) -> Value {
    match recv(remote).await {
        Inbound::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text, got {other:?}"),
    }
}

async fn send_json(remote: &Transport, value: Value) {
    remote.send_text(value.to_string()).await.unwrap();
}

fn collect(peer: &Peer, kind: EventKind) -> mpsc::UnboundedReceiver<PeerEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    peer.subscribe(
        kind,
        listener(move |event| {
            let _ = tx.send(event.clone());
        }),
    );
    rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> PeerEvent {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .unwrap()
}

fn add() -> RpcHandler {
    rpc_handler(|_cx, req| async move {
        let [a, b]: [i64; 2] = req.parse_params()?;
        Ok(json!(a + b))
    })
}

fn sleepy(ms: u64) -> RpcHandler {
    rpc_handler(move |_cx, _req| async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!("done"))
    })
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

// ============================================================================
// Outbound
// ============================================================================

#[tokio::test]
async fn request_goes_out_and_resolves() {
    let peer = test_peer();
    let remote = open_raw(&peer).await;

    let caller = peer.clone();
    let call = tokio::spawn(async move {
        caller
            .request(
                Request::new("add").with_id("1").with_params(json!([1, 2])),
                RequestOptions::default(),
            )
            .await
    });

    assert_eq!(
        recv_json(&remote).await,
        json!({ "jsonrpc": "2.0", "method": "add", "params": [1, 2], "id": "1" })
    );
    send_json(&remote, json!({ "jsonrpc": "2.0", "result": 3, "id": "1" })).await;

    let outcome = call.await.unwrap().unwrap();
    assert_eq!(outcome.value(), Some(&json!(3)));
    assert!(peer.pending_invocation_ids().is_empty());
}

#[tokio::test]
async fn integral_float_response_id_is_routed() {
    let peer = test_peer();
    let remote = open_raw(&peer).await;

    let caller = peer.clone();
    let call = tokio::spawn(async move {
        caller
            .request(Request::new("add").with_id(1).with_params(json!([1, 2])), RequestOptions::default())
            .await
    });

    recv_json(&remote).await;
    send_json(&remote, json!({ "jsonrpc": "2.0", "result": 3, "id": 1.0 })).await;

    let outcome = timeout(WAIT, call).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome.value(), Some(&json!(3)));
    assert!(peer.pending_invocation_ids().is_empty());
}

#[tokio::test]
async fn batch_outcomes_follow_request_order() {
    let peer = test_peer();
    let remote = open_raw(&peer).await;

    let caller = peer.clone();
    let call = tokio::spawn(async move {
        caller
            .request_batch(
                vec![
                    Request::new("a").with_id(1),
                    Request::new("note"),
                    Request::new("b").with_id(2),
                ],
                RequestOptions::default(),
            )
            .await
    });

    let sent = recv_json(&remote).await;
    assert_eq!(sent.as_array().map(Vec::len), Some(3));

    // Answer out of order, one failure.
    send_json(
        &remote,
        json!([
            { "jsonrpc": "2.0", "error": { "code": -32601, "message": "Method not found" }, "id": 2 },
            { "jsonrpc": "2.0", "result": "a!", "id": 1 }
        ]),
    )
    .await;

    let outcomes = call.await.unwrap().unwrap();
    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[0].value(), Some(&json!("a!")));
    assert_eq!(outcomes[1].result, Ok(None));
    assert_eq!(outcomes[2].error().map(ProtocolError::code), Some(-32601));
}

#[tokio::test]
async fn notifications_settle_immediately() {
    let peer = test_peer();
    let remote = open_raw(&peer).await;

    peer.notify("tick", Some(json!({ "n": 1 }))).await.unwrap();
    assert_eq!(
        recv_json(&remote).await,
        json!({ "jsonrpc": "2.0", "method": "tick", "params": { "n": 1 } })
    );
    assert!(peer.pending_invocation_ids().is_empty());
}

#[tokio::test]
async fn request_times_out_and_forgets_the_id() {
    let peer = test_peer();
    let _remote = open_raw(&peer).await;

    let started = tokio::time::Instant::now();
    let outcome = peer
        .request(Request::new("x").with_id("t"), RequestOptions::timeout_ms(50))
        .await
        .unwrap();
    let error = outcome.error().unwrap();
    assert_eq!(error.code(), ErrorCode::CallTimedOut.code());
    assert_eq!(error.message(), "RPC call t timed out after 50 ms");
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(peer.pending_invocation_ids().is_empty());
}

#[tokio::test]
async fn invalid_calls_are_rejected_before_sending() {
    let peer = test_peer();

    let err = peer
        .request(Request::new("m").with_id(1), RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PeerError::NotOpened(PeerState::Idle)));

    let _remote = open_raw(&peer).await;
    let err = peer
        .request(Request::new("").with_id(1), RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PeerError::InvalidCall { index: 0, .. }));

    let err = peer
        .request_batch(
            vec![Request::new("a").with_id(1), Request::new("b").with_id(1)],
            RequestOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PeerError::DuplicateId(RequestId::Number(1))));
    assert!(peer.pending_invocation_ids().is_empty());
}

#[tokio::test]
async fn pending_ids_must_be_unique() {
    let peer = test_peer();
    let remote = open_raw(&peer).await;

    let caller = peer.clone();
    let first = tokio::spawn(async move {
        caller
            .request(Request::new("a").with_id("dup"), RequestOptions::default())
            .await
    });
    recv_json(&remote).await;

    let err = peer
        .request(Request::new("b").with_id("dup"), RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PeerError::DuplicateId(_)));

    send_json(&remote, json!({ "jsonrpc": "2.0", "result": 1, "id": "dup" })).await;
    assert_eq!(first.await.unwrap().unwrap().value(), Some(&json!(1)));
}

#[tokio::test]
async fn max_pending_is_enforced() {
    let peer = Peer::with_config(PeerConfig::default().with_max_pending(1));
    let remote = open_raw(&peer).await;

    let caller = peer.clone();
    let _first = tokio::spawn(async move {
        caller
            .request(Request::new("a").with_id(1), RequestOptions::default())
            .await
    });
    recv_json(&remote).await;

    let err = peer
        .request(Request::new("b").with_id(2), RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PeerError::TooManyPending { max: 1 }));
}

#[tokio::test]
async fn invocation_finished_is_emitted() {
    let peer = test_peer();
    let remote = open_raw(&peer).await;
    let mut finished = collect(&peer, EventKind::InvocationFinished);

    let caller = peer.clone();
    let call = tokio::spawn(async move {
        caller
            .request(Request::new("a").with_id(5), RequestOptions::default())
            .await
    });
    recv_json(&remote).await;
    send_json(&remote, json!({ "jsonrpc": "2.0", "result": null, "id": 5 })).await;
    call.await.unwrap().unwrap();

    let PeerEvent::InvocationFinished { results } = next_event(&mut finished).await else {
        panic!("wrong event");
    };
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].value(), Some(&Value::Null));
}

// ============================================================================
// Inbound
// ============================================================================

#[tokio::test]
async fn inbound_call_is_answered() {
    let peer = test_peer();
    peer.set_rpc_handler("add", add()).unwrap();
    let remote = open_raw(&peer).await;

    send_json(&remote, json!({ "jsonrpc": "2.0", "method": "add", "params": [2, 3], "id": 1 })).await;
    assert_eq!(
        recv_json(&remote).await,
        json!({ "jsonrpc": "2.0", "result": 5, "id": 1 })
    );
}

#[tokio::test]
async fn unknown_method_is_method_not_found() {
    let peer = test_peer();
    let remote = open_raw(&peer).await;

    send_json(&remote, json!({ "jsonrpc": "2.0", "method": "nope", "id": "q" })).await;
    assert_eq!(
        recv_json(&remote).await,
        json!({
            "jsonrpc": "2.0",
            "error": { "code": -32601, "message": "Method not found" },
            "id": "q"
        })
    );
}

#[tokio::test]
async fn default_handler_catches_the_rest() {
    let peer = test_peer();
    peer.set_default_rpc_handler(Some(rpc_handler(|_cx, req| async move {
        Ok(json!(format!("default:{}", req.method)))
    })));
    let remote = open_raw(&peer).await;

    send_json(&remote, json!({ "jsonrpc": "2.0", "method": "whatever", "id": 1 })).await;
    assert_eq!(recv_json(&remote).await["result"], json!("default:whatever"));
}

#[tokio::test]
async fn invalid_params_from_handler() {
    let peer = test_peer();
    peer.set_rpc_handler("add", add()).unwrap();
    let remote = open_raw(&peer).await;

    send_json(&remote, json!({ "jsonrpc": "2.0", "method": "add", "params": "x", "id": 2 })).await;
    let response = recv_json(&remote).await;
    assert_eq!(response["error"]["code"], json!(-32602));
    assert_eq!(response["id"], json!(2));
}

#[tokio::test]
async fn notifications_get_no_response() {
    let peer = test_peer();
    peer.set_rpc_handler("add", add()).unwrap();
    let remote = open_raw(&peer).await;

    send_json(&remote, json!({ "jsonrpc": "2.0", "method": "add", "params": [1, 1] })).await;
    send_json(&remote, json!({ "jsonrpc": "2.0", "method": "add", "params": [2, 2], "id": 9 })).await;
    assert_eq!(
        recv_json(&remote).await,
        json!({ "jsonrpc": "2.0", "result": 4, "id": 9 })
    );
}

#[tokio::test]
async fn bad_calls_are_invalid_request() {
    let peer = test_peer();
    peer.set_rpc_handler("add", add()).unwrap();
    let remote = open_raw(&peer).await;

    send_json(&remote, json!({ "jsonrpc": "1.0", "method": "add", "params": [1, 1], "id": 3 })).await;
    let response = recv_json(&remote).await;
    assert_eq!(response["error"]["code"], json!(-32600));
    assert_eq!(response["id"], json!(3));

    // An id that is not an integer or string is answered with a null id.
    send_json(&remote, json!({ "jsonrpc": "2.0", "method": "add", "params": [1, 1], "id": 1.5 })).await;
    let response = recv_json(&remote).await;
    assert_eq!(response["error"]["code"], json!(-32600));
    assert_eq!(response["id"], Value::Null);
}

#[tokio::test]
async fn bad_notifications_are_reported_locally() {
    let peer = test_peer();
    let remote = open_raw(&peer).await;
    let mut errors = collect(&peer, EventKind::ErrorOccurred);

    send_json(&remote, json!({ "jsonrpc": "2.0", "method": "missing" })).await;
    let PeerEvent::ErrorOccurred { error } = next_event(&mut errors).await else {
        panic!("wrong event");
    };
    assert!(matches!(&*error, PeerError::Protocol(e) if e.code() == -32601));
}

#[tokio::test]
async fn handler_failures_are_wrapped() {
    let peer = test_peer();
    peer.set_rpc_handler(
        "fail",
        rpc_handler(|_cx, _req| async move { Err(HandlerError::failed("disk on fire")) }),
    )
    .unwrap();
    peer.set_rpc_handler(
        "reject",
        rpc_handler(|_cx, _req| async move {
            Err(ProtocolError::new(-32050, "custom")
                .with_data_value(json!({ "why": "because" }))
                .into())
        }),
    )
    .unwrap();
    let remote = open_raw(&peer).await;
    let mut errors = collect(&peer, EventKind::ErrorOccurred);

    send_json(&remote, json!({ "jsonrpc": "2.0", "method": "fail", "id": 1 })).await;
    assert_eq!(
        recv_json(&remote).await,
        json!({
            "jsonrpc": "2.0",
            "error": { "code": -32002, "message": "disk on fire" },
            "id": 1
        })
    );
    let PeerEvent::ErrorOccurred { error } = next_event(&mut errors).await else {
        panic!("wrong event");
    };
    assert!(matches!(&*error, PeerError::Handler { method, .. } if method == "fail"));

    send_json(&remote, json!({ "jsonrpc": "2.0", "method": "reject", "id": 2 })).await;
    assert_eq!(
        recv_json(&remote).await,
        json!({
            "jsonrpc": "2.0",
            "error": { "code": -32050, "message": "custom", "data": { "why": "because" } },
            "id": 2
        })
    );
}

#[tokio::test]
async fn panicking_handler_still_answers() {
    let peer = test_peer();
    peer.set_rpc_handler(
        "boom",
        rpc_handler(|_cx, _req| async move {
            if true {
                panic!("kaboom");
            }
            Ok(Value::Null)
        }),
    )
    .unwrap();
    let remote = open_raw(&peer).await;

    send_json(&remote, json!({ "jsonrpc": "2.0", "method": "boom", "id": 1 })).await;
    let response = recv_json(&remote).await;
    assert_eq!(response["error"]["code"], json!(-32002));
    assert_eq!(response["error"]["message"], json!("panic in handler: kaboom"));
    assert!(peer.pending_execution_ids().is_empty());
}

#[tokio::test]
async fn duplicate_execution_id_is_rejected() {
    let peer = test_peer();
    peer.set_rpc_handler("slow", sleepy(100)).unwrap();
    peer.set_rpc_handler("add", add()).unwrap();
    let remote = open_raw(&peer).await;

    send_json(&remote, json!({ "jsonrpc": "2.0", "method": "slow", "id": 7 })).await;
    send_json(&remote, json!({ "jsonrpc": "2.0", "method": "add", "params": [1, 2], "id": 7 })).await;

    let first = recv_json(&remote).await;
    assert_eq!(first["error"]["code"], json!(-32600));
    assert_eq!(first["id"], json!(7));

    let second = recv_json(&remote).await;
    assert_eq!(second, json!({ "jsonrpc": "2.0", "result": "done", "id": 7 }));
    wait_until(|| peer.pending_execution_ids().is_empty()).await;
}

#[tokio::test]
async fn handler_context_is_visible() {
    let peer = test_peer();
    peer.set_handler_context(41u32);
    peer.set_rpc_handler(
        "ctx",
        rpc_handler(|cx, _req| async move {
            let base = cx.get::<u32>().copied().unwrap_or(0);
            Ok(json!({ "value": base + 1, "state": cx.peer().state().to_string() }))
        }),
    )
    .unwrap();
    let remote = open_raw(&peer).await;

    send_json(&remote, json!({ "jsonrpc": "2.0", "method": "ctx", "id": 1 })).await;
    assert_eq!(
        recv_json(&remote).await["result"],
        json!({ "value": 42, "state": "opened" })
    );
}

#[tokio::test]
async fn handler_registration_rules() {
    let peer = test_peer();
    let h = add();
    peer.set_rpc_handler("add", h.clone()).unwrap();
    peer.set_rpc_handler("add", h.clone()).unwrap();
    assert!(matches!(
        peer.set_rpc_handler("add", add()),
        Err(PeerError::HandlerConflict(_))
    ));
    assert!(Arc::ptr_eq(&peer.rpc_handler("add").unwrap(), &h));
    assert!(peer.remove_rpc_handler("add").is_some());
    assert!(peer.rpc_handler("add").is_none());
}

// ============================================================================
// Non-protocol traffic and batches
// ============================================================================

#[tokio::test]
async fn non_json_goes_to_its_handler() {
    let peer = test_peer();
    let (tx, mut rx) = mpsc::unbounded_channel();
    peer.set_non_json_message_handler(Some(non_json_handler(move |_cx, payload| {
        let _ = tx.send(payload);
    })));
    let remote = open_raw(&peer).await;

    remote.send_text("{not json".into()).await.unwrap();
    let payload = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(payload, jrpeer_core::NonJsonPayload::Text("{not json".into()));
}

#[tokio::test]
async fn unrecognized_objects() {
    let peer = test_peer();
    let remote = open_raw(&peer).await;

    // No id: silently dropped. The next message proves nothing was sent.
    send_json(&remote, json!({ "hello": "world" })).await;
    send_json(&remote, json!({ "hello": "world", "id": 4 })).await;
    assert_eq!(
        recv_json(&remote).await,
        json!({
            "jsonrpc": "2.0",
            "error": { "code": -32600, "message": "Invalid Request" },
            "id": 4
        })
    );
}

#[tokio::test]
async fn non_protocol_handler_takes_precedence() {
    let peer = test_peer();
    let (tx, mut rx) = mpsc::unbounded_channel();
    peer.set_non_protocol_message_handler(Some(non_protocol_handler(move |_cx, value| {
        let _ = tx.send(value);
    })));
    let remote = open_raw(&peer).await;

    send_json(&remote, json!({ "hello": "world", "id": 4 })).await;
    let value = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(value, json!({ "hello": "world", "id": 4 }));
}

#[tokio::test]
async fn empty_batch_is_one_invalid_request() {
    let peer = test_peer();
    let remote = open_raw(&peer).await;

    remote.send_text("[]".into()).await.unwrap();
    assert_eq!(
        recv_json(&remote).await,
        json!({
            "jsonrpc": "2.0",
            "error": { "code": -32600, "message": "Invalid Request" },
            "id": null
        })
    );
}

#[tokio::test]
async fn batch_with_garbage_is_rejected_per_entry() {
    let peer = test_peer();
    peer.set_rpc_handler("add", add()).unwrap();
    let remote = open_raw(&peer).await;

    send_json(
        &remote,
        json!([
            { "jsonrpc": "2.0", "method": "add", "params": [1, 2], "id": 1 },
            1,
            { "foo": "bar" }
        ]),
    )
    .await;
    let response = recv_json(&remote).await;
    let entries = response.as_array().unwrap();
    assert_eq!(entries.len(), 3);
    for entry in entries {
        assert_eq!(entry["error"]["code"], json!(-32600));
    }
    assert_eq!(entries[0]["id"], json!(1));
    assert_eq!(entries[1]["id"], Value::Null);
}

#[tokio::test]
async fn batch_resolves_responses_and_answers_calls_in_order() {
    let peer = test_peer();
    peer.set_rpc_handler("add", add()).unwrap();
    peer.set_rpc_handler("slow", sleepy(50)).unwrap();
    let remote = open_raw(&peer).await;

    let caller = peer.clone();
    let pending = tokio::spawn(async move {
        caller
            .request(Request::new("remote").with_id(10), RequestOptions::default())
            .await
    });
    recv_json(&remote).await;

    send_json(
        &remote,
        json!([
            { "jsonrpc": "2.0", "method": "slow", "id": 11 },
            { "jsonrpc": "2.0", "result": "r", "id": 10 },
            { "jsonrpc": "2.0", "method": "add", "params": [1, 2] },
            { "jsonrpc": "2.0", "method": "add", "params": [3, 4], "id": 12 }
        ]),
    )
    .await;

    // The response is delivered without waiting for the slow call.
    let outcome = timeout(Duration::from_millis(40), pending)
        .await
        .expect("response waited for local handlers")
        .unwrap()
        .unwrap();
    assert_eq!(outcome.value(), Some(&json!("r")));

    assert_eq!(
        recv_json(&remote).await,
        json!([
            { "jsonrpc": "2.0", "result": "done", "id": 11 },
            { "jsonrpc": "2.0", "result": 7, "id": 12 }
        ])
    );
}

#[tokio::test]
async fn batch_of_notifications_gets_no_response() {
    let peer = test_peer();
    peer.set_rpc_handler("add", add()).unwrap();
    let remote = open_raw(&peer).await;

    send_json(
        &remote,
        json!([
            { "jsonrpc": "2.0", "method": "add", "params": [1, 2] },
            { "jsonrpc": "2.0", "method": "add", "params": [3, 4] }
        ]),
    )
    .await;
    send_json(&remote, json!({ "jsonrpc": "2.0", "method": "add", "params": [5, 5], "id": "last" })).await;
    assert_eq!(recv_json(&remote).await["id"], json!("last"));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn close_cancels_pending_calls() {
    let peer = test_peer();
    let remote = open_raw(&peer).await;

    let caller = peer.clone();
    let call = tokio::spawn(async move {
        caller
            .request(Request::new("slow").with_id("p"), RequestOptions::timeout_ms(5000))
            .await
    });
    recv_json(&remote).await;

    peer.close().await.unwrap();
    let outcome = call.await.unwrap().unwrap();
    let error = outcome.error().unwrap();
    assert_eq!(error.code(), ErrorCode::CallCanceled.code());
    assert_eq!(
        error.message(),
        "RPC call p has been canceled because the peer is being closed"
    );
    assert!(peer.pending_invocation_ids().is_empty());

    assert_eq!(
        recv(&remote).await,
        Inbound::Closed {
            code: 1000,
            reason: String::new()
        }
    );
}

#[tokio::test]
async fn close_waits_for_running_handlers() {
    let peer = test_peer();
    peer.set_rpc_handler("slow", sleepy(50)).unwrap();
    let remote = open_raw(&peer).await;

    send_json(&remote, json!({ "jsonrpc": "2.0", "method": "slow", "id": 1 })).await;
    wait_until(|| !peer.pending_execution_ids().is_empty()).await;

    peer.close().await.unwrap();
    assert_eq!(peer.state(), PeerState::Idle);
    assert!(peer.pending_execution_ids().is_empty());

    assert_eq!(
        recv_json(&remote).await,
        json!({ "jsonrpc": "2.0", "result": "done", "id": 1 })
    );
    assert!(matches!(recv(&remote).await, Inbound::Closed { code: 1000, .. }));
}

#[tokio::test]
async fn close_finishes_even_if_the_caller_stops_waiting() {
    let peer = test_peer();
    peer.set_rpc_handler("slow", sleepy(100)).unwrap();
    let remote = open_raw(&peer).await;
    let mut closed = collect(&peer, EventKind::Closed);

    send_json(&remote, json!({ "jsonrpc": "2.0", "method": "slow", "id": 1 })).await;
    wait_until(|| !peer.pending_execution_ids().is_empty()).await;

    assert!(timeout(Duration::from_millis(20), peer.close()).await.is_err());
    assert_eq!(peer.state(), PeerState::Closing);

    next_event(&mut closed).await;
    assert_eq!(peer.state(), PeerState::Idle);
    assert!(peer.pending_execution_ids().is_empty());
    assert_eq!(
        recv_json(&remote).await,
        json!({ "jsonrpc": "2.0", "result": "done", "id": 1 })
    );
    assert!(matches!(recv(&remote).await, Inbound::Closed { code: 1000, .. }));

    let _remote = open_raw(&peer).await;
    peer.close().await.unwrap();
}

#[tokio::test]
async fn calls_arriving_while_closing_are_dropped() {
    let peer = test_peer();
    peer.set_rpc_handler("slow", sleepy(100)).unwrap();
    let remote = open_raw(&peer).await;

    send_json(&remote, json!({ "jsonrpc": "2.0", "method": "slow", "id": 1 })).await;
    wait_until(|| !peer.pending_execution_ids().is_empty()).await;

    let closer = peer.clone();
    let closing = tokio::spawn(async move { closer.close().await });
    wait_until(|| peer.state() == PeerState::Closing).await;
    send_json(&remote, json!({ "jsonrpc": "2.0", "method": "slow", "id": 2 })).await;

    closing.await.unwrap().unwrap();
    assert_eq!(peer.state(), PeerState::Idle);
    assert!(peer.pending_execution_ids().is_empty());
    assert_eq!(
        recv_json(&remote).await,
        json!({ "jsonrpc": "2.0", "result": "done", "id": 1 })
    );
    assert!(matches!(recv(&remote).await, Inbound::Closed { code: 1000, .. }));

    // Nothing from the old connection shows up on the next one.
    let fresh = open_raw(&peer).await;
    assert!(timeout(Duration::from_millis(250), fresh.recv()).await.is_err());
    assert!(peer.pending_execution_ids().is_empty());
    peer.close().await.unwrap();
}

#[tokio::test]
async fn remote_close_closes_the_peer() {
    let peer = test_peer();
    let remote = open_raw(&peer).await;
    let mut closed = collect(&peer, EventKind::Closed);
    let mut errors = collect(&peer, EventKind::ErrorOccurred);

    remote.close(1000, "bye").await.unwrap();
    next_event(&mut closed).await;
    assert_eq!(peer.state(), PeerState::Idle);
    assert!(!peer.closed_by_error());
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn transport_failure_is_reported_then_closed() {
    let peer = test_peer();
    let remote = open_raw(&peer).await;
    let mut closed = collect(&peer, EventKind::Closed);
    let mut errors = collect(&peer, EventKind::ErrorOccurred);

    let Transport::Mem(remote) = &remote else {
        panic!("expected mem transport");
    };
    remote.abort();

    let PeerEvent::ErrorOccurred { error } = next_event(&mut errors).await else {
        panic!("wrong event");
    };
    match &*error {
        PeerError::TransportClosed { code, reason } => {
            assert_eq!(*code, 1006);
            assert_eq!(reason, TRANSPORT_ERROR_REASON);
        }
        other => panic!("unexpected error {other:?}"),
    }
    next_event(&mut closed).await;
    assert_eq!(peer.state(), PeerState::Idle);
    assert!(peer.closed_by_error());
}

#[tokio::test]
async fn attached_transport_is_left_open() {
    let peer = test_peer();
    let (local, remote) = Transport::mem_pair();
    peer.open(OpenTarget::attach(local.clone())).await.unwrap();
    peer.close().await.unwrap();

    assert!(local.is_open());
    local.send_text("still here".into()).await.unwrap();
    assert_eq!(recv(&remote).await, Inbound::Text("still here".into()));
}

#[tokio::test]
async fn open_over_an_endpoint() {
    let (connector, mut acceptor) = jrpeer_core::mem::listener();
    let peer = test_peer();
    peer.open(OpenTarget::endpoint("mem://calc", connector))
        .await
        .unwrap();
    let remote = acceptor.accept().await.unwrap();

    peer.notify("hello", None).await.unwrap();
    assert_eq!(
        recv_json(&remote).await,
        json!({ "jsonrpc": "2.0", "method": "hello" })
    );
    peer.close().await.unwrap();
}

struct Stalled;

impl Connect for Stalled {
    fn connect<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<Transport, TransportError>> {
        Box::pin(futures::future::pending())
    }
}

#[tokio::test]
async fn abandoned_open_returns_to_idle() {
    let peer = test_peer();
    let mut closed = collect(&peer, EventKind::Closed);

    let open = peer.open(OpenTarget::endpoint("mem://nowhere", Stalled));
    assert!(timeout(Duration::from_millis(20), open).await.is_err());
    assert_eq!(peer.state(), PeerState::Idle);
    next_event(&mut closed).await;

    let _remote = open_raw(&peer).await;
    assert_eq!(peer.state(), PeerState::Opened);
    peer.close().await.unwrap();
}

#[tokio::test]
async fn lifecycle_misuse() {
    let peer = test_peer();
    let _remote = open_raw(&peer).await;

    let (other, _other_remote) = Transport::mem_pair();
    assert!(matches!(
        peer.open(OpenTarget::attach(other.clone())).await,
        Err(PeerError::AlreadyOpened)
    ));
    assert!(other.is_open());

    peer.close().await.unwrap();
    peer.close().await.unwrap();
    assert_eq!(peer.state(), PeerState::Idle);
}

#[tokio::test]
async fn sixteen_open_close_cycles() {
    let peer = test_peer();
    peer.set_rpc_handler("add", add()).unwrap();
    let mut closed = collect(&peer, EventKind::Closed);

    for i in 0..16i64 {
        let remote = open_raw(&peer).await;
        send_json(&remote, json!({ "jsonrpc": "2.0", "method": "add", "params": [i, 1], "id": i })).await;
        assert_eq!(recv_json(&remote).await["result"], json!(i + 1));

        peer.close().await.unwrap();
        next_event(&mut closed).await;
        assert!(peer.pending_invocation_ids().is_empty());
        assert!(peer.pending_execution_ids().is_empty());
    }
    assert!(closed.try_recv().is_err());
}

// ============================================================================
// wait_for
// ============================================================================

#[tokio::test]
async fn wait_for_sees_the_next_call() {
    let peer = test_peer();
    let remote = open_raw(&peer).await;
    peer.set_rpc_handler("add", add()).unwrap();

    let waiting = peer.wait_for("add", Some(WAIT));
    send_json(&remote, json!({ "jsonrpc": "2.0", "method": "add", "params": [1, 2] })).await;
    let request = waiting.await.unwrap();
    assert_eq!(request.params, Some(json!([1, 2])));
    assert!(request.is_notification());
}

#[tokio::test]
async fn wait_for_can_be_canceled() {
    let peer = test_peer();
    let _remote = open_raw(&peer).await;

    let waiting = peer.wait_for("never", None);
    let canceler = waiting.canceler();
    assert!(canceler.cancel("not needed"));
    assert!(!waiting.cancel("again"));
    assert_eq!(waiting.await, Err(WaitError::Canceled("not needed".into())));
}

#[tokio::test]
async fn wait_for_times_out_and_sees_close() {
    let peer = test_peer();
    let _remote = open_raw(&peer).await;

    let err = peer
        .wait_for("never", Some(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        WaitError::TimedOut {
            method: "never".into()
        }
    );

    let waiting = peer.wait_for("never", None);
    peer.close().await.unwrap();
    assert_eq!(waiting.await, Err(WaitError::PeerClosed));
}
