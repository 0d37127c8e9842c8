//! Inbound messages: classification, batch splitting and local execution.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::message::{discoverable_id, validate_call};
use crate::peer::Execution;
use crate::{
    Envelope, ErrorCode, HandlerError, Incoming, NonJsonPayload, Peer, PeerError, PeerEvent,
    PeerState, ProtocolError, Request, RequestId, Response, RpcHandler, Transport, parse_envelope,
};

/// Keeps an execution registered while its handler runs.
///
/// Dropping it removes the entry and wakes anyone waiting for the peer to
/// drain.
pub(crate) struct ExecutionGuard {
    peer: Peer,
    id: RequestId,
    _done: watch::Sender<()>,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.peer.inner.tables.lock().executions.remove(&self.id);
    }
}

/// An inbound call after validation, ready to run or already answered.
enum Prepared {
    Run {
        request: Request,
        handler: RpcHandler,
        guard: Option<ExecutionGuard>,
    },
    /// Answer with an error without running anything.
    Reject { id: Option<RequestId>, error: ProtocolError },
    /// A rejected notification: nothing goes on the wire.
    Drop,
}

impl Peer {
    /// Handle one text message read from `transport`. Replies go back over
    /// the same transport, even if the peer has moved on to another one.
    pub(crate) async fn handle_text(&self, text: String, transport: &Transport) {
        tracing::trace!(payload = %text, "received message");
        let envelope = match parse_envelope(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(error = %e, "inbound message is not JSON");
                self.handle_non_json(NonJsonPayload::Text(text));
                return;
            }
        };

        match envelope {
            Envelope::Single(entry) => self.handle_single(entry, transport).await,
            Envelope::Batch(entries) => self.handle_batch(entries, transport).await,
        }
    }

    async fn handle_single(&self, entry: Incoming, transport: &Transport) {
        match entry {
            Incoming::Success { id, result } => self.resolve_invocation(id, Ok(result)),
            Incoming::Failure { id, error } => self.resolve_invocation(id, Err(error)),
            Incoming::Request(map) | Incoming::Notification(map) => {
                let prepared = self.prepare_call(map);
                let peer = self.clone();
                let transport = transport.clone();
                tokio::spawn(async move {
                    let (response, guard) = peer.execute(prepared).await;
                    if let Some(response) = response {
                        peer.send_json(&transport, &response).await;
                    }
                    drop(guard);
                });
            }
            Incoming::Unrecognized(value) => self.handle_unrecognized(value, transport).await,
        }
    }

    async fn handle_unrecognized(&self, value: Value, transport: &Transport) {
        let handler = self.inner.handlers.lock().non_protocol.clone();
        if let Some(handler) = handler {
            handler(&self.context(), value);
            return;
        }

        match discoverable_id(&value) {
            Some(id) => {
                tracing::debug!(id = ?id, "rejecting message that is not JSON-RPC");
                let response = Response::failure(id, ErrorCode::InvalidRequest.into());
                self.send_json(transport, &response).await;
            }
            None => tracing::warn!("dropping message that is not JSON-RPC"),
        }
    }

    async fn handle_batch(&self, entries: Vec<Incoming>, transport: &Transport) {
        if entries.is_empty() {
            tracing::debug!("rejecting empty batch");
            let response = Response::failure(None, ErrorCode::InvalidRequest.into());
            self.send_json(transport, &response).await;
            return;
        }

        if entries.iter().any(|e| !e.is_response() && !e.is_call()) {
            tracing::debug!(len = entries.len(), "rejecting batch with unrecognized entries");
            let responses: Vec<Response> = entries
                .iter()
                .map(|entry| Response::failure(entry_id(entry), ErrorCode::InvalidRequest.into()))
                .collect();
            self.send_json(transport, &responses).await;
            return;
        }

        // Responses first, so their waiters never queue behind local handlers.
        let mut calls = Vec::new();
        for entry in entries {
            match entry {
                Incoming::Success { id, result } => self.resolve_invocation(id, Ok(result)),
                Incoming::Failure { id, error } => self.resolve_invocation(id, Err(error)),
                Incoming::Request(map) | Incoming::Notification(map) => calls.push(map),
                Incoming::Unrecognized(_) => {}
            }
        }
        if calls.is_empty() {
            return;
        }

        let prepared: Vec<Prepared> = calls.into_iter().map(|map| self.prepare_call(map)).collect();
        let peer = self.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            let (responses, guards): (Vec<_>, Vec<_>) =
                futures::future::join_all(prepared.into_iter().map(|p| peer.execute(p)))
                    .await
                    .into_iter()
                    .unzip();
            let responses: Vec<Response> = responses.into_iter().flatten().collect();
            if !responses.is_empty() {
                peer.send_json(&transport, &responses).await;
            }
            drop(guards);
        });
    }

    /// Validate a call, resolve its handler and register its execution.
    ///
    /// Runs synchronously on the reader so that duplicate-id checks follow
    /// delivery order. Calls that arrive once the peer is closing are
    /// dropped; close only drains what was running when it started.
    fn prepare_call(&self, map: Map<String, Value>) -> Prepared {
        let state = self.state();
        if !accepts_calls(state) {
            tracing::debug!(%state, "dropping inbound call: peer is not open");
            return Prepared::Drop;
        }

        let has_id = map.get("id").is_some_and(|id| !id.is_null());
        let reply_id = map.get("id").and_then(RequestId::from_value);

        let request = match validate_call(map) {
            Ok(request) => request,
            Err(error) => return self.reject(has_id, reply_id, error),
        };

        let handler = self.inner.handlers.lock().resolve(&request.method);
        let Some(handler) = handler else {
            tracing::debug!(method = %request.method, "method not found");
            return self.reject(has_id, request.id, ErrorCode::MethodNotFound.into());
        };

        let guard = match &request.id {
            None => None,
            Some(id) => {
                let mut tables = self.inner.tables.lock();
                if !accepts_calls(tables.state) {
                    let state = tables.state;
                    drop(tables);
                    tracing::debug!(%id, %state, "dropping inbound call: peer is not open");
                    return Prepared::Drop;
                }
                if tables.executions.contains_key(id) {
                    drop(tables);
                    tracing::debug!(%id, method = %request.method, "call id is already executing");
                    return Prepared::Reject {
                        id: Some(id.clone()),
                        error: ErrorCode::InvalidRequest.into(),
                    };
                }
                let (done_tx, done_rx) = watch::channel(());
                tables.executions.insert(
                    id.clone(),
                    Execution {
                        request: request.clone(),
                        done: done_rx,
                    },
                );
                Some(ExecutionGuard {
                    peer: self.clone(),
                    id: id.clone(),
                    _done: done_tx,
                })
            }
        };

        tracing::debug!(id = ?request.id, method = %request.method, "dispatching request");
        self.emit(PeerEvent::RequestReceived {
            request: request.clone(),
        });
        Prepared::Run {
            request,
            handler,
            guard,
        }
    }

    fn reject(&self, has_id: bool, id: Option<RequestId>, error: ProtocolError) -> Prepared {
        if has_id {
            Prepared::Reject { id, error }
        } else {
            self.emit_error(PeerError::Protocol(error));
            Prepared::Drop
        }
    }

    /// Run a prepared call. Returns the response to send, if any, and the
    /// guard that keeps the execution registered until it has been sent.
    async fn execute(&self, prepared: Prepared) -> (Option<Response>, Option<ExecutionGuard>) {
        let (request, handler, guard) = match prepared {
            Prepared::Run {
                request,
                handler,
                guard,
            } => (request, handler, guard),
            Prepared::Reject { id, error } => return (Some(Response::failure(id, error)), None),
            Prepared::Drop => return (None, None),
        };

        let id = request.id.clone();
        let method = request.method.clone();
        let cx = self.context();

        // A panicking handler must still produce a response, or the remote
        // caller waits until its timeout.
        let call = async move { handler(cx, request).await };
        let result = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("panic in handler: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("panic in handler: {s}")
                } else {
                    "panic in handler".to_string()
                };
                Err(HandlerError::failed(message))
            }
        };
        let response = match result {
            Ok(value) => id.map(|id| Response::success(id, value)),
            Err(error) => {
                let wire = error.to_protocol_error();
                tracing::debug!(id = ?id, %method, code = wire.code(), "handler failed");
                match error {
                    HandlerError::Failed(source) => {
                        self.emit_error(PeerError::Handler { method, source });
                    }
                    HandlerError::Protocol(e) if id.is_none() => {
                        self.emit_error(PeerError::Protocol(e));
                    }
                    HandlerError::Protocol(_) => {}
                }
                id.map(|id| Response::failure(Some(id), wire))
            }
        };
        (response, guard)
    }

    pub(crate) async fn send_json<T: Serialize + ?Sized>(&self, transport: &Transport, message: &T) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode response");
                self.emit_error(PeerError::Encode(e));
                return;
            }
        };

        tracing::trace!(payload = %text, "sending response");
        if let Err(e) = transport.send_text(text).await {
            tracing::warn!(error = %e, "failed to send response");
            self.emit_error(PeerError::Transport(e));
        }
    }
}

fn accepts_calls(state: PeerState) -> bool {
    matches!(state, PeerState::Opened | PeerState::Corrupted)
}

fn entry_id(entry: &Incoming) -> Option<RequestId> {
    match entry {
        Incoming::Request(map) | Incoming::Notification(map) => {
            map.get("id").and_then(RequestId::from_value)
        }
        Incoming::Success { id, .. } | Incoming::Failure { id, .. } => id.clone(),
        Incoming::Unrecognized(value) => discoverable_id(value).flatten(),
    }
}
