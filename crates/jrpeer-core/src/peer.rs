//! Peer: one end of a JSON-RPC connection, client and server at once.
//!
//! # Architecture
//!
//! ```text
//!                        ┌─────────────────────────────────┐
//!                        │              Peer               │
//!                        ├─────────────────────────────────┤
//!                        │  state: PeerState               │
//!                        │  link: transport + reader task  │
//!                        │  invocations: id -> oneshot     │
//!                        │  executions:  id -> done signal │
//!                        │  handlers: method -> RpcHandler │
//!                        └───────────┬─────────────────────┘
//!                                    │
//!                               reader loop
//!                                    │
//!              ┌─────────────────────┼─────────────────────┐
//!              │                     │                     │
//!        response/error        call/notification       not JSON-RPC
//!              │                     │                     │
//!   ┌──────────▼─────────┐ ┌─────────▼──────────┐ ┌────────▼─────────┐
//!   │ settle invocation  │ │ spawn handler,     │ │ escape-hatch     │
//!   │ (oneshot send)     │ │ send response(s)   │ │ handler or drop  │
//!   └────────────────────┘ └────────────────────┘ └──────────────────┘
//! ```
//!
//! Only the reader task calls `transport.recv()`. All bookkeeping lives in
//! one mutex-protected table so that check-then-insert steps (duplicate ids,
//! execution tracking) are atomic.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use core::fmt;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::{
    ABNORMAL_CLOSURE, EventBus, EventKind, HandlerRegistry, Inbound, Listener, NORMAL_CLOSURE,
    NonJsonHandler, NonJsonPayload, NonProtocolHandler, OpenTarget, PeerConfig, PeerError,
    PeerEvent, ProtocolError, Request, RequestId, RpcContext, RpcHandler, SubscriptionId,
    Transport, TransportError,
};

/// Reason reported when the transport failed without saying why.
pub const TRANSPORT_ERROR_REASON: &str =
    "the connection has been closed because of an internal transport error";

/// Lifecycle state of a [`Peer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    Idle,
    Opening,
    Opened,
    Corrupted,
    Closing,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Opening => write!(f, "opening"),
            Self::Opened => write!(f, "opened"),
            Self::Corrupted => write!(f, "corrupted"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

pub(crate) type Settlement = Result<Value, ProtocolError>;

/// An outbound call awaiting its response.
pub(crate) struct Invocation {
    pub(crate) request: Request,
    pub(crate) tx: oneshot::Sender<Settlement>,
}

/// An inbound call being served. The entry disappears when the
/// [`ExecutionGuard`](crate::dispatch::ExecutionGuard) drops, which also
/// closes `done`.
pub(crate) struct Execution {
    pub(crate) request: Request,
    pub(crate) done: watch::Receiver<()>,
}

struct Link {
    transport: Transport,
    owned: bool,
    reader: Option<JoinHandle<()>>,
}

/// Sends a peer left in `Opening` through `Corrupted` back to `Idle` when
/// the caller of [`Peer::open`] stops waiting.
struct OpenGuard<'a> {
    peer: &'a Peer,
    armed: bool,
}

impl Drop for OpenGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!("open abandoned before the transport was ready");
        self.peer.inner.tables.lock().state = PeerState::Corrupted;
        // Nothing is linked or registered while opening, so there is nothing
        // to drain.
        match self.peer.begin_close() {
            Ok(Some(_)) => self.peer.settle_idle(),
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "close after abandoned open"),
        }
    }
}

pub(crate) struct Tables {
    pub(crate) state: PeerState,
    link: Option<Link>,
    pub(crate) invocations: HashMap<RequestId, Invocation>,
    pub(crate) executions: HashMap<RequestId, Execution>,
    closed_by_error: bool,
}

impl Tables {
    pub(crate) fn transport(&self) -> Option<Transport> {
        self.link.as_ref().map(|link| link.transport.clone())
    }
}

pub(crate) struct PeerInner {
    pub(crate) config: PeerConfig,
    pub(crate) tables: Mutex<Tables>,
    pub(crate) handlers: Mutex<HandlerRegistry>,
    pub(crate) events: EventBus,
    next_id: AtomicI64,
}

/// A symmetric JSON-RPC 2.0 peer.
///
/// Cheap to clone; clones share the same connection and tables. A peer can be
/// opened and closed any number of times.
#[derive(Clone)]
pub struct Peer {
    pub(crate) inner: Arc<PeerInner>,
}

impl Default for Peer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Peer {
    /// A peer configured from the environment, see [`PeerConfig::from_env`].
    pub fn new() -> Self {
        Self::with_config(PeerConfig::from_env())
    }

    pub fn with_config(config: PeerConfig) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                config,
                tables: Mutex::new(Tables {
                    state: PeerState::Idle,
                    link: None,
                    invocations: HashMap::new(),
                    executions: HashMap::new(),
                    closed_by_error: false,
                }),
                handlers: Mutex::new(HandlerRegistry::default()),
                events: EventBus::new(),
                next_id: AtomicI64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &PeerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> PeerState {
        self.inner.tables.lock().state
    }

    /// Whether the last connection ended because of a transport error.
    pub fn closed_by_error(&self) -> bool {
        self.inner.tables.lock().closed_by_error
    }

    /// A fresh integer id for an outbound call.
    pub fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Open the peer over `target`.
    ///
    /// Only legal while idle. If the transport cannot be established the peer
    /// goes through `Corrupted`, reports the failure as an
    /// [`ErrorOccurred`](PeerEvent::ErrorOccurred) event, closes itself and
    /// returns the failure.
    pub async fn open(&self, target: OpenTarget) -> Result<(), PeerError> {
        {
            let mut tables = self.inner.tables.lock();
            match tables.state {
                PeerState::Idle => {}
                PeerState::Opening => return Err(PeerError::AlreadyOpening),
                PeerState::Opened => return Err(PeerError::AlreadyOpened),
                PeerState::Corrupted => return Err(PeerError::Corrupted),
                PeerState::Closing => return Err(PeerError::BeingClosed),
            }
            tables.state = PeerState::Opening;
            tables.closed_by_error = false;
        }
        let mut guard = OpenGuard {
            peer: self,
            armed: true,
        };
        tracing::debug!(?target, "opening peer");

        let connected = match target {
            OpenTarget::Endpoint { url, connector } => {
                connector.connect(&url).await.map(|transport| (transport, true))
            }
            OpenTarget::Transport { transport, owned } => {
                if transport.is_open() {
                    Ok((transport, owned))
                } else {
                    Err(TransportError::NotOpen)
                }
            }
        };

        let (transport, owned) = match connected {
            Ok(connected) => connected,
            Err(e) => {
                tracing::warn!(error = %e, "failed to open transport");
                guard.armed = false;
                self.inner.tables.lock().state = PeerState::Corrupted;
                self.emit_error(PeerError::Transport(duplicate_transport_error(&e)));
                if let Err(close_error) = self.close().await {
                    tracing::debug!(error = %close_error, "close after failed open");
                }
                return Err(PeerError::Transport(e));
            }
        };

        {
            let mut tables = self.inner.tables.lock();
            tables.state = PeerState::Opened;
            let reader = tokio::spawn(read_loop(Arc::downgrade(&self.inner), transport.clone()));
            tables.link = Some(Link {
                transport,
                owned,
                reader: Some(reader),
            });
            guard.armed = false;
        }
        tracing::debug!(owned, "peer opened");
        self.emit(PeerEvent::Opened);
        Ok(())
    }

    /// Close the peer.
    ///
    /// Pending outbound calls are rejected with
    /// [`CallCanceled`](crate::ErrorCode::CallCanceled), in-flight inbound
    /// calls are awaited, and an owned transport is closed with code 1000.
    /// Closing an idle peer does nothing.
    ///
    /// The close sequence runs on its own task once started, so dropping
    /// this future does not stop the peer from reaching `Idle`.
    ///
    /// Do not await this from inside a handler: close waits for that handler.
    pub async fn close(&self) -> Result<(), PeerError> {
        let Some(executions) = self.begin_close()? else {
            return Ok(());
        };
        let peer = self.clone();
        let teardown = tokio::spawn(async move { peer.finish_close(executions).await });
        if let Err(e) = teardown.await {
            if e.is_panic() {
                std::panic::resume_unwind(e.into_panic());
            }
            tracing::warn!(error = %e, "close task did not finish");
        }
        Ok(())
    }

    /// Enter `Closing` and reject every pending outbound call.
    ///
    /// Returns the executions to wait for, or `None` when already idle.
    fn begin_close(&self) -> Result<Option<Vec<watch::Receiver<()>>>, PeerError> {
        let (invocations, executions) = {
            let mut tables = self.inner.tables.lock();
            match tables.state {
                PeerState::Idle => return Ok(None),
                PeerState::Opening => return Err(PeerError::OpenInProgress),
                PeerState::Closing => return Err(PeerError::AlreadyClosing),
                PeerState::Opened | PeerState::Corrupted => {}
            }
            tables.state = PeerState::Closing;
            let invocations = std::mem::take(&mut tables.invocations);
            let executions: Vec<watch::Receiver<()>> = tables
                .executions
                .iter()
                .map(|(id, execution)| {
                    tracing::debug!(%id, method = %execution.request.method, "waiting for execution");
                    execution.done.clone()
                })
                .collect();
            (invocations, executions)
        };
        tracing::debug!(
            pending_invocations = invocations.len(),
            pending_executions = executions.len(),
            "closing peer"
        );

        for (id, invocation) in invocations {
            tracing::debug!(%id, method = %invocation.request.method, "canceling pending call");
            let _ = invocation.tx.send(Err(ProtocolError::canceled_by_close(&id)));
        }
        Ok(Some(executions))
    }

    /// Drain executions, detach from the transport and return to `Idle`.
    async fn finish_close(&self, executions: Vec<watch::Receiver<()>>) {
        // Outcomes don't matter here, only that every execution has finished.
        futures::future::join_all(executions.into_iter().map(|mut done| async move {
            let _ = done.changed().await;
        }))
        .await;

        let link = self.inner.tables.lock().link.take();
        if let Some(link) = link {
            if let Some(reader) = link.reader {
                reader.abort();
            }
            if link.owned {
                if let Err(e) = link.transport.close(NORMAL_CLOSURE, "").await {
                    tracing::debug!(error = %e, "error while closing transport");
                }
            }
        }
        self.settle_idle();
    }

    fn settle_idle(&self) {
        self.inner.tables.lock().state = PeerState::Idle;
        tracing::debug!("peer closed");
        self.emit(PeerEvent::Closed);
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    /// Register `handler` for `method`.
    ///
    /// Registering the same handler again is a no-op; registering a different
    /// one while a handler is present fails with
    /// [`PeerError::HandlerConflict`].
    pub fn set_rpc_handler(&self, method: &str, handler: RpcHandler) -> Result<(), PeerError> {
        self.inner.handlers.lock().set(method, handler)
    }

    pub fn remove_rpc_handler(&self, method: &str) -> Option<RpcHandler> {
        self.inner.handlers.lock().remove(method)
    }

    pub fn rpc_handler(&self, method: &str) -> Option<RpcHandler> {
        self.inner.handlers.lock().get(method)
    }

    /// Fallback for methods without a specific handler. `None` clears it.
    pub fn set_default_rpc_handler(&self, handler: Option<RpcHandler>) {
        self.inner.handlers.lock().set_default(handler);
    }

    pub fn set_non_json_message_handler(&self, handler: Option<NonJsonHandler>) {
        self.inner.handlers.lock().non_json = handler;
    }

    pub fn set_non_protocol_message_handler(&self, handler: Option<NonProtocolHandler>) {
        self.inner.handlers.lock().non_protocol = handler;
    }

    /// Value exposed to handlers through [`RpcContext::get`].
    pub fn set_handler_context<T: Any + Send + Sync>(&self, value: T) {
        self.inner.handlers.lock().context = Some(Arc::new(value));
    }

    pub fn clear_handler_context(&self) {
        self.inner.handlers.lock().context = None;
    }

    pub(crate) fn context(&self) -> RpcContext {
        let value = self.inner.handlers.lock().context.clone();
        RpcContext::new(self.clone(), value)
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn subscribe(&self, kind: EventKind, listener: Listener) -> SubscriptionId {
        self.inner.events.subscribe(kind, listener, false)
    }

    /// Like [`subscribe`](Self::subscribe), removed after the first delivery.
    pub fn once(&self, kind: EventKind, listener: Listener) -> SubscriptionId {
        self.inner.events.subscribe(kind, listener, true)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    pub(crate) fn emit(&self, event: PeerEvent) {
        self.inner.events.emit(event);
    }

    pub(crate) fn emit_error(&self, error: PeerError) {
        self.emit(PeerEvent::ErrorOccurred {
            error: Arc::new(error),
        });
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Ids of outbound calls awaiting a response, sorted.
    pub fn pending_invocation_ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self.inner.tables.lock().invocations.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Ids of inbound calls currently being served, sorted.
    pub fn pending_execution_ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self.inner.tables.lock().executions.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    // ========================================================================
    // Reader
    // ========================================================================

    fn on_transport_gone(&self, error: Option<TransportError>, code: u16, reason: String) {
        let schedule_close = {
            let mut tables = self.inner.tables.lock();
            if error.is_some() {
                tables.closed_by_error = true;
                if tables.state == PeerState::Opened {
                    tables.state = PeerState::Corrupted;
                }
            }
            matches!(tables.state, PeerState::Opened | PeerState::Corrupted)
        };

        match error {
            Some(e) => {
                tracing::warn!(error = %e, code, %reason, "transport failed");
                self.emit_error(PeerError::TransportClosed { code, reason });
            }
            None => tracing::debug!(code, %reason, "transport closed by remote"),
        }

        if schedule_close {
            let peer = self.clone();
            tokio::spawn(async move {
                if let Err(e) = peer.close().await {
                    tracing::debug!(error = %e, "scheduled close skipped");
                }
            });
        }
    }

    pub(crate) fn handle_non_json(&self, payload: NonJsonPayload) {
        let handler = self.inner.handlers.lock().non_json.clone();
        match handler {
            Some(handler) => handler(&self.context(), payload),
            None => tracing::warn!("dropping inbound message that is not JSON"),
        }
    }
}

async fn read_loop(peer: Weak<PeerInner>, transport: Transport) {
    tracing::debug!("read_loop: starting");
    loop {
        let inbound = transport.recv().await;
        let Some(inner) = peer.upgrade() else {
            tracing::debug!("read_loop: peer dropped");
            return;
        };
        let peer = Peer { inner };

        match inbound {
            Ok(Inbound::Text(text)) => peer.handle_text(text, &transport).await,
            Ok(Inbound::Binary(data)) => peer.handle_non_json(NonJsonPayload::Binary(data)),
            Ok(Inbound::Closed { code, reason }) => {
                peer.on_transport_gone(None, code, reason);
                return;
            }
            Err(e) => {
                peer.on_transport_gone(Some(e), ABNORMAL_CLOSURE, TRANSPORT_ERROR_REASON.to_owned());
                return;
            }
        }
    }
}

fn duplicate_transport_error(e: &TransportError) -> TransportError {
    match e {
        TransportError::Closed => TransportError::Closed,
        TransportError::NotOpen => TransportError::NotOpen,
        TransportError::Io(io) => TransportError::Io(std::io::Error::new(io.kind(), io.to_string())),
    }
}
