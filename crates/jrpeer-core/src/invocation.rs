//! Outbound calls: correlation, batching and timeouts.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::peer::{Invocation, Settlement};
use crate::{
    ErrorCode, JSONRPC_VERSION, Peer, PeerError, PeerEvent, PeerState, ProtocolError, Request,
    RequestId, RequestOptions,
};

/// How one outbound call ended.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// The request as it was sent.
    pub request: Request,
    /// `Ok(None)` for notifications, which settle as soon as they are sent.
    pub result: Result<Option<Value>, ProtocolError>,
}

impl Outcome {
    pub fn value(&self) -> Option<&Value> {
        self.result.as_ref().ok()?.as_ref()
    }

    pub fn error(&self) -> Option<&ProtocolError> {
        self.result.as_ref().err()
    }
}

/// Removes still-registered invocations if the caller stops waiting.
struct PendingGuard<'a> {
    peer: &'a Peer,
    ids: Vec<RequestId>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        let mut tables = self.peer.inner.tables.lock();
        for id in &self.ids {
            if tables.invocations.remove(id).is_some() {
                tracing::debug!(%id, "call cancelled/dropped: removed pending invocation");
            }
        }
    }
}

impl Peer {
    /// Send one request and wait for its outcome.
    ///
    /// A request without an id is a notification and settles with `Ok(None)`
    /// once sent. `Err` is reserved for failures that prevent sending at all.
    pub async fn request(&self, request: Request, options: RequestOptions) -> Result<Outcome, PeerError> {
        let mut outcomes = self.invoke(vec![request], true, options).await?;
        outcomes.pop().ok_or_else(|| PeerError::InvalidCall {
            index: 0,
            reason: "no outcome".into(),
        })
    }

    /// Send several requests as one batch.
    ///
    /// Every member settles on its own; the returned outcomes follow the
    /// order of `requests`.
    pub async fn request_batch(
        &self,
        requests: Vec<Request>,
        options: RequestOptions,
    ) -> Result<Vec<Outcome>, PeerError> {
        if requests.is_empty() {
            return Err(PeerError::InvalidCall {
                index: 0,
                reason: "a batch needs at least one request".into(),
            });
        }
        self.invoke(requests, false, options).await
    }

    /// Call `method` with a generated id and return its result.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, PeerError> {
        let mut request = Request::new(method).with_id(self.next_request_id());
        request.params = params;
        let outcome = self.request(request, RequestOptions::default()).await?;
        match outcome.result {
            Ok(value) => Ok(value.unwrap_or(Value::Null)),
            Err(e) => Err(PeerError::Protocol(e)),
        }
    }

    /// Send a notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), PeerError> {
        let mut request = Request::new(method);
        request.params = params;
        self.invoke(vec![request], true, RequestOptions::default())
            .await
            .map(|_| ())
    }

    async fn invoke(
        &self,
        requests: Vec<Request>,
        single: bool,
        options: RequestOptions,
    ) -> Result<Vec<Outcome>, PeerError> {
        for (index, request) in requests.iter().enumerate() {
            if request.method.is_empty() {
                return Err(PeerError::InvalidCall {
                    index,
                    reason: "method must be a non-empty string".into(),
                });
            }
            if request.jsonrpc != JSONRPC_VERSION {
                return Err(PeerError::InvalidCall {
                    index,
                    reason: format!("unsupported protocol version '{}'", request.jsonrpc),
                });
            }
        }

        let text = if single {
            serde_json::to_string(&requests[0])?
        } else {
            serde_json::to_string(&requests)?
        };
        let timeout = options.timeout.unwrap_or(self.inner.config.call_timeout);

        let (transport, receivers, ids) = {
            let mut tables = self.inner.tables.lock();
            if tables.state != PeerState::Opened {
                return Err(PeerError::NotOpened(tables.state));
            }
            let transport = tables
                .transport()
                .ok_or(PeerError::NotOpened(tables.state))?;

            let mut seen = HashSet::new();
            for id in requests.iter().filter_map(|r| r.id.as_ref()) {
                if tables.invocations.contains_key(id) || !seen.insert(id) {
                    return Err(PeerError::DuplicateId(id.clone()));
                }
            }

            let pending_len = tables.invocations.len();
            let max = self.inner.config.max_pending;
            if pending_len + seen.len() > max {
                tracing::warn!(
                    pending_len,
                    max_pending = max,
                    "too many pending RPC calls; refusing new call"
                );
                return Err(PeerError::TooManyPending { max });
            }

            let mut ids = Vec::with_capacity(seen.len());
            let receivers: Vec<Option<oneshot::Receiver<Settlement>>> = requests
                .iter()
                .map(|request| {
                    let id = request.id.clone()?;
                    let (tx, rx) = oneshot::channel();
                    tables.invocations.insert(
                        id.clone(),
                        Invocation {
                            request: request.clone(),
                            tx,
                        },
                    );
                    ids.push(id);
                    Some(rx)
                })
                .collect();
            tracing::debug!(
                calls = ids.len(),
                pending_len = tables.invocations.len(),
                max_pending = max,
                "registered pending invocations"
            );
            (transport, receivers, ids)
        };
        let _guard = PendingGuard { peer: self, ids };

        tracing::trace!(payload = %text, "sending request");
        if let Err(e) = transport.send_text(text).await {
            tracing::warn!(error = %e, "failed to send request");
            return Err(PeerError::Transport(e));
        }

        let waits = requests
            .into_iter()
            .zip(receivers)
            .map(|(request, rx)| async move {
                let result = match (rx, request.id.as_ref()) {
                    (Some(rx), Some(id)) => self.settle(id, rx, timeout).await.map(Some),
                    _ => Ok(None),
                };
                Outcome { request, result }
            });
        let outcomes = futures::future::join_all(waits).await;

        if self.state() == PeerState::Opened {
            self.emit(PeerEvent::InvocationFinished {
                results: Arc::from(outcomes.clone()),
            });
        }
        Ok(outcomes)
    }

    async fn settle(
        &self,
        id: &RequestId,
        mut rx: oneshot::Receiver<Settlement>,
        timeout: Duration,
    ) -> Settlement {
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(settled)) => settled,
            Ok(Err(_)) => Err(ProtocolError::new(
                ErrorCode::InternalError,
                format!("RPC call {id} lost its response channel"),
            )),
            Err(_elapsed) => {
                let removed = self.inner.tables.lock().invocations.remove(id).is_some();
                if removed {
                    tracing::warn!(
                        %id,
                        timeout_ms = timeout.as_millis() as u64,
                        "RPC call timed out waiting for response"
                    );
                    return Err(ProtocolError::timed_out(id, timeout.as_millis()));
                }
                // Settled between the timer firing and the lock.
                rx.try_recv()
                    .unwrap_or_else(|_| Err(ProtocolError::timed_out(id, timeout.as_millis())))
            }
        }
    }

    /// Deliver a response to the invocation waiting on `id`.
    pub(crate) fn resolve_invocation(&self, id: Option<RequestId>, settlement: Settlement) {
        let Some(id) = id else {
            match settlement {
                Err(error) => {
                    tracing::warn!(code = error.code(), message = error.message(), "error response without id");
                    self.emit_error(PeerError::Protocol(error));
                }
                Ok(_) => tracing::warn!("dropping result without id"),
            }
            return;
        };

        let invocation = self.inner.tables.lock().invocations.remove(&id);
        match invocation {
            Some(invocation) => {
                tracing::debug!(%id, method = %invocation.request.method, "delivered response to waiter");
                let _ = invocation.tx.send(settlement);
            }
            None => tracing::warn!(%id, "unroutable response (no pending invocation)"),
        }
    }
}
