//! Local method handlers and the registry that owns them.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::{HandlerError, Peer, PeerError, Request};

pub type HandlerFuture = BoxFuture<'static, Result<Value, HandlerError>>;

/// A handler for inbound calls.
///
/// Handlers are compared by identity: registering the same `Arc` twice under
/// one method is a no-op, a different `Arc` is a conflict.
pub type RpcHandler = Arc<dyn Fn(RpcContext, Request) -> HandlerFuture + Send + Sync>;

/// Receives messages that are not valid JSON, and binary messages.
pub type NonJsonHandler = Arc<dyn Fn(&RpcContext, NonJsonPayload) + Send + Sync>;

/// Receives JSON values that are not JSON-RPC shaped.
pub type NonProtocolHandler = Arc<dyn Fn(&RpcContext, Value) + Send + Sync>;

/// Wrap an async closure as an [`RpcHandler`].
///
/// ```ignore
/// let add = rpc_handler(|_cx, req| async move {
///     let [a, b]: [f64; 2] = req.parse_params()?;
///     Ok(serde_json::json!(a + b))
/// });
/// peer.set_rpc_handler("add", add)?;
/// ```
pub fn rpc_handler<F, Fut>(f: F) -> RpcHandler
where
    F: Fn(RpcContext, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(move |cx, req| -> HandlerFuture { Box::pin(f(cx, req)) })
}

pub fn non_json_handler<F>(f: F) -> NonJsonHandler
where
    F: Fn(&RpcContext, NonJsonPayload) + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn non_protocol_handler<F>(f: F) -> NonProtocolHandler
where
    F: Fn(&RpcContext, Value) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NonJsonPayload {
    /// Text that failed to parse as JSON.
    Text(String),
    Binary(Vec<u8>),
}

/// Passed to every handler invocation.
///
/// Always gives access to the peer that received the message; carries the
/// value set with [`Peer::set_handler_context`] when there is one.
#[derive(Clone)]
pub struct RpcContext {
    peer: Peer,
    value: Option<Arc<dyn Any + Send + Sync>>,
}

impl RpcContext {
    pub(crate) fn new(peer: Peer, value: Option<Arc<dyn Any + Send + Sync>>) -> Self {
        Self { peer, value }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// The user context, if one is set and it is a `T`.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.value.as_deref()?.downcast_ref::<T>()
    }

    pub fn value(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.value.as_ref()
    }
}

impl std::fmt::Debug for RpcContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcContext")
            .field("peer", &self.peer)
            .field("has_value", &self.value.is_some())
            .finish()
    }
}

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    by_method: HashMap<String, RpcHandler>,
    default: Option<RpcHandler>,
    pub(crate) non_json: Option<NonJsonHandler>,
    pub(crate) non_protocol: Option<NonProtocolHandler>,
    pub(crate) context: Option<Arc<dyn Any + Send + Sync>>,
}

impl HandlerRegistry {
    pub(crate) fn set(&mut self, method: &str, handler: RpcHandler) -> Result<(), PeerError> {
        match self.by_method.get(method) {
            Some(existing) if Arc::ptr_eq(existing, &handler) => Ok(()),
            Some(_) => Err(PeerError::HandlerConflict(method.to_owned())),
            None => {
                self.by_method.insert(method.to_owned(), handler);
                Ok(())
            }
        }
    }

    pub(crate) fn remove(&mut self, method: &str) -> Option<RpcHandler> {
        self.by_method.remove(method)
    }

    pub(crate) fn get(&self, method: &str) -> Option<RpcHandler> {
        self.by_method.get(method).cloned()
    }

    pub(crate) fn set_default(&mut self, handler: Option<RpcHandler>) {
        self.default = handler;
    }

    /// Method-specific handler first, then the default one.
    pub(crate) fn resolve(&self, method: &str) -> Option<RpcHandler> {
        self.get(method).or_else(|| self.default.clone())
    }
}
