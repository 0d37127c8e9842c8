//! jrpeer-testkit: conformance scenarios for jrpeer transports.
//!
//! Provides the `TransportFactory` trait and shared scenarios that every
//! transport must pass with two peers talking to each other.
//!
//! # Usage
//!
//! ```ignore
//! use jrpeer_testkit::{TestError, TransportFactory};
//!
//! struct MyFactory;
//!
//! impl TransportFactory for MyFactory {
//!     async fn connect_pair() -> Result<(Transport, Transport), TestError> {
//!         /* create a connected pair */
//!     }
//! }
//!
//! #[tokio::test]
//! async fn happy_path() {
//!     jrpeer_testkit::run_happy_path::<MyFactory>().await;
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use jrpeer_core::{
    ErrorCode, EventKind, OpenTarget, Peer, PeerConfig, PeerError, PeerState, Request,
    RequestOptions, Transport, WaitError, listener, rpc_handler,
};
use serde_json::{Value, json};

pub mod calculator;

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    /// Transport creation failed.
    Setup(String),
    /// A peer operation failed.
    Peer(PeerError),
    /// Transport error.
    Transport(jrpeer_core::TransportError),
    /// Assertion failed.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {}", msg),
            TestError::Peer(e) => write!(f, "peer error: {}", e),
            TestError::Transport(e) => write!(f, "transport error: {}", e),
            TestError::Assertion(msg) => write!(f, "assertion failed: {}", msg),
        }
    }
}

impl std::error::Error for TestError {}

impl From<PeerError> for TestError {
    fn from(e: PeerError) -> Self {
        TestError::Peer(e)
    }
}

impl From<jrpeer_core::TransportError> for TestError {
    fn from(e: jrpeer_core::TransportError) -> Self {
        TestError::Transport(e)
    }
}

/// Factory trait for creating transport pairs for testing.
pub trait TransportFactory: Send + Sync + 'static {
    /// Create a connected pair of transports.
    ///
    /// Returns (client_side, server_side): text sent on one end is received
    /// by the other.
    fn connect_pair() -> impl Future<Output = Result<(Transport, Transport), TestError>> + Send;
}

/// Install a test subscriber once per process. Honors `RUST_LOG`.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::DEBUG.into()),
            )
            .with_test_writer()
            .try_init();
    });
}

const EVENT_WAIT: Duration = Duration::from_secs(2);

fn check(condition: bool, message: impl FnOnce() -> String) -> Result<(), TestError> {
    if condition {
        Ok(())
    } else {
        Err(TestError::Assertion(message()))
    }
}

/// A client peer and a server peer with the calculator installed, both open
/// over a fresh pair from `F`.
async fn connected_peers<F: TransportFactory>() -> Result<(Peer, Peer), TestError> {
    let (client_transport, server_transport) = F::connect_pair().await?;

    let server = Peer::with_config(PeerConfig::default());
    calculator::install(&server)?;
    server.open(OpenTarget::adopt(server_transport)).await?;

    let client = Peer::with_config(PeerConfig::default());
    client.open(OpenTarget::adopt(client_transport)).await?;
    Ok((client, server))
}

fn count_events(peer: &Peer, kind: EventKind) -> Arc<AtomicUsize> {
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = hits.clone();
    peer.subscribe(
        kind,
        listener(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );
    hits
}

/// Close `client` and wait for `server` to follow it.
async fn close_both(client: &Peer, server: &Peer) -> Result<(), TestError> {
    client.close().await?;
    eventually("server to close", || server.state() == PeerState::Idle).await
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) -> Result<(), TestError> {
    let deadline = tokio::time::Instant::now() + EVENT_WAIT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return Err(TestError::Assertion(format!("timed out waiting for {what}")));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}

// ============================================================================
// Scenarios
// ============================================================================

/// Call `add` on the remote peer, then close and check `Closed` fired once.
pub async fn run_happy_path<F: TransportFactory>() {
    let result = run_happy_path_inner::<F>().await;
    if let Err(e) = result {
        panic!("run_happy_path failed: {}", e);
    }
}

async fn run_happy_path_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (client, server) = connected_peers::<F>().await?;
    let closed = count_events(&client, EventKind::Closed);

    let outcome = client
        .request(
            Request::new("add").with_id("1").with_params(json!([1, 2])),
            RequestOptions::default(),
        )
        .await?;
    check(outcome.value() == Some(&json!(3)), || {
        format!("expected add(1, 2) = 3, got {:?}", outcome.result)
    })?;

    client.close().await?;
    check(client.state() == PeerState::Idle, || {
        format!("expected idle after close, got {}", client.state())
    })?;
    check(closed.load(Ordering::SeqCst) == 1, || {
        format!("expected one Closed event, got {}", closed.load(Ordering::SeqCst))
    })?;

    // The server follows once it sees the closure.
    eventually("server to close", || server.state() == PeerState::Idle).await?;
    Ok(())
}

/// Unknown methods come back as METHOD_NOT_FOUND.
pub async fn run_method_not_found<F: TransportFactory>() {
    let result = run_method_not_found_inner::<F>().await;
    if let Err(e) = result {
        panic!("run_method_not_found failed: {}", e);
    }
}

async fn run_method_not_found_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (client, server) = connected_peers::<F>().await?;

    let outcome = client
        .request(Request::new("divide").with_id(1), RequestOptions::default())
        .await?;
    let code = outcome.error().map(|e| e.code());
    check(code == Some(ErrorCode::MethodNotFound.code()), || {
        format!("expected -32601, got {:?}", outcome.result)
    })?;

    close_both(&client, &server).await?;
    Ok(())
}

/// Members of a batch settle independently and keep their order.
pub async fn run_batch_partial_failure<F: TransportFactory>() {
    let result = run_batch_partial_failure_inner::<F>().await;
    if let Err(e) = result {
        panic!("run_batch_partial_failure failed: {}", e);
    }
}

async fn run_batch_partial_failure_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (client, server) = connected_peers::<F>().await?;

    let outcomes = client
        .request_batch(
            vec![
                Request::new("add").with_id(1).with_params(json!([1, 2])),
                Request::new("divide").with_id(2).with_params(json!([1, 2])),
                Request::new("subtract").with_id(3).with_params(json!([5, 3])),
                Request::new("echo").with_params(json!("ignored")),
                Request::new("add").with_id(4).with_params(json!("nope")),
            ],
            RequestOptions::default(),
        )
        .await?;

    check(outcomes.len() == 5, || format!("expected 5 outcomes, got {}", outcomes.len()))?;
    let ids: Vec<Option<String>> = outcomes
        .iter()
        .map(|o| o.request.id.as_ref().map(ToString::to_string))
        .collect();
    check(
        ids == [Some("1"), Some("2"), Some("3"), None, Some("4")].map(|id| id.map(String::from)),
        || format!("outcomes out of order: {ids:?}"),
    )?;
    check(outcomes[0].value() == Some(&json!(3)), || {
        format!("add: {:?}", outcomes[0].result)
    })?;
    check(
        outcomes[1].error().map(|e| e.code()) == Some(ErrorCode::MethodNotFound.code()),
        || format!("divide: {:?}", outcomes[1].result),
    )?;
    check(outcomes[2].value() == Some(&json!(2)), || {
        format!("subtract: {:?}", outcomes[2].result)
    })?;
    check(outcomes[3].result == Ok(None), || {
        format!("notification: {:?}", outcomes[3].result)
    })?;
    check(
        outcomes[4].error().map(|e| e.code()) == Some(ErrorCode::InvalidParams.code()),
        || format!("bad add: {:?}", outcomes[4].result),
    )?;

    close_both(&client, &server).await?;
    Ok(())
}

/// A call the remote never answers in time fails with CALL_TIMED_OUT and is
/// forgotten.
pub async fn run_call_timeout<F: TransportFactory>() {
    let result = run_call_timeout_inner::<F>().await;
    if let Err(e) = result {
        panic!("run_call_timeout failed: {}", e);
    }
}

async fn run_call_timeout_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (client, server) = connected_peers::<F>().await?;

    let started = tokio::time::Instant::now();
    let outcome = client
        .request(
            Request::new("sleep").with_id("slow").with_params(json!([300])),
            RequestOptions::timeout_ms(50),
        )
        .await?;
    let elapsed = started.elapsed();

    let error = outcome
        .error()
        .ok_or_else(|| TestError::Assertion(format!("expected a timeout, got {:?}", outcome.result)))?;
    check(error.code() == ErrorCode::CallTimedOut.code(), || {
        format!("expected -32001, got {error}")
    })?;
    check(error.message() == "RPC call slow timed out after 50 ms", || {
        format!("unexpected message {:?}", error.message())
    })?;
    check(elapsed >= Duration::from_millis(50) && elapsed < Duration::from_millis(300), || {
        format!("timeout took {elapsed:?}")
    })?;
    check(client.pending_invocation_ids().is_empty(), || {
        format!("leaked invocations: {:?}", client.pending_invocation_ids())
    })?;

    // The late response is dropped without disturbing the peer.
    let outcome = client
        .request(
            Request::new("add").with_id("after").with_params(json!([2, 2])),
            RequestOptions::default(),
        )
        .await?;
    check(outcome.value() == Some(&json!(4)), || {
        format!("call after timeout: {:?}", outcome.result)
    })?;

    close_both(&client, &server).await?;
    Ok(())
}

/// A second call reusing an id that is still executing is rejected; the
/// first still completes.
pub async fn run_duplicate_execution_id<F: TransportFactory>() {
    let result = run_duplicate_execution_id_inner::<F>().await;
    if let Err(e) = result {
        panic!("run_duplicate_execution_id failed: {}", e);
    }
}

async fn run_duplicate_execution_id_inner<F: TransportFactory>() -> Result<(), TestError> {
    // The client side is driven by hand: a peer never sends a duplicate id.
    let (raw, server_transport) = F::connect_pair().await?;
    let server = Peer::with_config(PeerConfig::default());
    calculator::install(&server)?;
    server.open(OpenTarget::adopt(server_transport)).await?;

    let send = |value: Value| raw.send_text(value.to_string());
    send(json!({ "jsonrpc": "2.0", "method": "sleep", "params": [100], "id": 7 })).await?;
    send(json!({ "jsonrpc": "2.0", "method": "add", "params": [1, 2], "id": 7 })).await?;

    let first = recv_json(&raw).await?;
    check(
        first["error"]["code"] == json!(-32600) && first["id"] == json!(7),
        || format!("expected INVALID_REQUEST for the duplicate, got {first}"),
    )?;
    let second = recv_json(&raw).await?;
    check(
        second == json!({ "jsonrpc": "2.0", "result": 100, "id": 7 }),
        || format!("expected the first call to finish, got {second}"),
    )?;

    server.close().await?;
    Ok(())
}

async fn recv_json(transport: &Transport) -> Result<Value, TestError> {
    let inbound = tokio::time::timeout(EVENT_WAIT, transport.recv())
        .await
        .map_err(|_| TestError::Assertion("timed out waiting for a message".into()))??;
    match inbound {
        jrpeer_core::Inbound::Text(text) => serde_json::from_str(&text)
            .map_err(|e| TestError::Assertion(format!("not JSON ({e}): {text}"))),
        other => Err(TestError::Assertion(format!("expected text, got {other:?}"))),
    }
}

/// Closing rejects pending outbound calls with CALL_CANCELED.
pub async fn run_close_cancels_pending<F: TransportFactory>() {
    let result = run_close_cancels_pending_inner::<F>().await;
    if let Err(e) = result {
        panic!("run_close_cancels_pending failed: {}", e);
    }
}

async fn run_close_cancels_pending_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (client, server) = connected_peers::<F>().await?;

    let caller = client.clone();
    let pending = tokio::spawn(async move {
        caller
            .request(
                Request::new("sleep").with_id(1).with_params(json!([1000])),
                RequestOptions::timeout_ms(5000),
            )
            .await
    });
    eventually("the call to be pending", || !client.pending_invocation_ids().is_empty()).await?;

    client.close().await?;
    let outcome = pending
        .await
        .map_err(|e| TestError::Setup(format!("caller task panicked: {}", e)))??;
    check(
        outcome.error().map(|e| e.code()) == Some(ErrorCode::CallCanceled.code()),
        || format!("expected -32003, got {:?}", outcome.result),
    )?;
    check(client.pending_invocation_ids().is_empty(), || {
        "invocations left after close".into()
    })?;

    eventually("server to close", || server.state() == PeerState::Idle).await?;
    Ok(())
}

/// Notifications run on the remote and produce no response.
pub async fn run_notification<F: TransportFactory>() {
    let result = run_notification_inner::<F>().await;
    if let Err(e) = result {
        panic!("run_notification failed: {}", e);
    }
}

async fn run_notification_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (client, server) = connected_peers::<F>().await?;

    let seen = server.wait_for("echo", Some(EVENT_WAIT));
    client.notify("echo", Some(json!({ "hello": "world" }))).await?;
    let request = seen
        .await
        .map_err(|e| TestError::Assertion(format!("server never saw the notification: {e}")))?;
    check(request.is_notification(), || format!("expected a notification, got {request:?}"))?;
    check(request.params == Some(json!({ "hello": "world" })), || {
        format!("params changed on the way: {:?}", request.params)
    })?;
    check(client.pending_invocation_ids().is_empty(), || {
        "a notification was tracked as pending".into()
    })?;

    close_both(&client, &server).await?;
    Ok(())
}

/// Both peers call each other at the same time, and a handler calls back
/// into its caller while serving a request.
pub async fn run_bidirectional_calls<F: TransportFactory>() {
    let result = run_bidirectional_calls_inner::<F>().await;
    if let Err(e) = result {
        panic!("run_bidirectional_calls failed: {}", e);
    }
}

async fn run_bidirectional_calls_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (client, server) = connected_peers::<F>().await?;
    calculator::install(&client)?;
    server.set_rpc_handler(
        "relay",
        rpc_handler(|cx, request| async move {
            let echoed = cx
                .peer()
                .call("echo", request.params)
                .await
                .map_err(jrpeer_core::HandlerError::failed)?;
            Ok(json!({ "relayed": echoed }))
        }),
    )?;

    let (up, down) = tokio::join!(
        client.call("add", Some(json!([20, 22]))),
        server.call("subtract", Some(json!([10, 4]))),
    );
    check(up? == json!(42), || "client -> server add".into())?;
    check(down? == json!(6), || "server -> client subtract".into())?;

    let relayed = client.call("relay", Some(json!(["x"]))).await?;
    check(relayed == json!({ "relayed": ["x"] }), || {
        format!("unexpected relay result {relayed}")
    })?;

    close_both(&client, &server).await?;
    Ok(())
}

/// Sixteen open/close cycles leave nothing behind.
pub async fn run_open_close_cycles<F: TransportFactory>() {
    let result = run_open_close_cycles_inner::<F>().await;
    if let Err(e) = result {
        panic!("run_open_close_cycles failed: {}", e);
    }
}

async fn run_open_close_cycles_inner<F: TransportFactory>() -> Result<(), TestError> {
    let client = Peer::with_config(PeerConfig::default());
    let opened = count_events(&client, EventKind::Opened);
    let closed = count_events(&client, EventKind::Closed);

    for i in 0..16i64 {
        let (client_transport, server_transport) = F::connect_pair().await?;
        let server = Peer::with_config(PeerConfig::default());
        calculator::install(&server)?;
        server.open(OpenTarget::adopt(server_transport)).await?;
        client.open(OpenTarget::adopt(client_transport)).await?;

        let sum = client.call("add", Some(json!([i, i]))).await?;
        check(sum == json!(2 * i), || format!("cycle {i}: add returned {sum}"))?;

        close_both(&client, &server).await?;
        check(
            client.pending_invocation_ids().is_empty() && server.pending_execution_ids().is_empty(),
            || format!("cycle {i}: leaked bookkeeping"),
        )?;
    }

    check(opened.load(Ordering::SeqCst) == 16, || "expected 16 Opened events".into())?;
    check(closed.load(Ordering::SeqCst) == 16, || "expected 16 Closed events".into())?;
    Ok(())
}

/// Closing an idle peer is a no-op; closing twice is harmless.
pub async fn run_close_idempotent<F: TransportFactory>() {
    let result = run_close_idempotent_inner::<F>().await;
    if let Err(e) = result {
        panic!("run_close_idempotent failed: {}", e);
    }
}

async fn run_close_idempotent_inner<F: TransportFactory>() -> Result<(), TestError> {
    let idle = Peer::with_config(PeerConfig::default());
    let closed = count_events(&idle, EventKind::Closed);
    idle.close().await?;
    check(closed.load(Ordering::SeqCst) == 0, || "closing an idle peer emitted Closed".into())?;

    let (client, server) = connected_peers::<F>().await?;
    client.close().await?;
    client.close().await?;
    check(client.state() == PeerState::Idle, || format!("state is {}", client.state()))?;

    let err = client.call("add", Some(json!([1, 1]))).await;
    check(matches!(err, Err(PeerError::NotOpened(PeerState::Idle))), || {
        format!("call on a closed peer: {err:?}")
    })?;

    eventually("server to close", || server.state() == PeerState::Idle).await?;
    server.close().await?;
    Ok(())
}

/// When the remote closes, the local peer closes too without reporting an
/// error.
pub async fn run_remote_close<F: TransportFactory>() {
    let result = run_remote_close_inner::<F>().await;
    if let Err(e) = result {
        panic!("run_remote_close failed: {}", e);
    }
}

async fn run_remote_close_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (client, server) = connected_peers::<F>().await?;
    let closed = count_events(&client, EventKind::Closed);
    let errors = count_events(&client, EventKind::ErrorOccurred);

    server.close().await?;
    eventually("client to close", || closed.load(Ordering::SeqCst) == 1).await?;
    check(client.state() == PeerState::Idle, || format!("client is {}", client.state()))?;
    check(!client.closed_by_error(), || "clean closure flagged as an error".into())?;
    check(errors.load(Ordering::SeqCst) == 0, || "clean closure reported an error".into())?;
    Ok(())
}

/// A wait can be canceled, times out, and ends when the peer closes.
pub async fn run_wait_for<F: TransportFactory>() {
    let result = run_wait_for_inner::<F>().await;
    if let Err(e) = result {
        panic!("run_wait_for failed: {}", e);
    }
}

async fn run_wait_for_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (client, server) = connected_peers::<F>().await?;

    let canceled = server.wait_for("add", None);
    canceled.cancel("no longer needed");
    let result = canceled.await;
    check(result == Err(WaitError::Canceled("no longer needed".into())), || {
        format!("expected cancellation, got {result:?}")
    })?;

    let result = server.wait_for("add", Some(Duration::from_millis(20))).await;
    check(matches!(result, Err(WaitError::TimedOut { .. })), || {
        format!("expected a timeout, got {result:?}")
    })?;

    let received = server.wait_for("add", Some(EVENT_WAIT));
    let sum = client.call("add", Some(json!([3, 4]))).await?;
    check(sum == json!(7), || format!("add returned {sum}"))?;
    let request = received
        .await
        .map_err(|e| TestError::Assertion(format!("wait_for missed the call: {e}")))?;
    check(request.params == Some(json!([3, 4])), || format!("wrong request {request:?}"))?;

    let orphaned = server.wait_for("add", None);
    server.close().await?;
    let result = orphaned.await;
    check(result == Err(WaitError::PeerClosed), || {
        format!("expected PeerClosed, got {result:?}")
    })?;

    eventually("client to close", || client.state() == PeerState::Idle).await?;
    Ok(())
}
