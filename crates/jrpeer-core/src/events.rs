//! Peer events and the subscription interface.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::{Outcome, PeerError, Request};

/// Something observable that happened on a peer.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The transport is open and the reader is running.
    Opened,
    /// The close sequence finished; the peer is idle again.
    Closed,
    /// A failure nobody else is waiting on: transport errors, rejected
    /// inbound messages, failing notification handlers.
    ErrorOccurred { error: Arc<PeerError> },
    /// A [`Peer::request`](crate::Peer::request) call settled.
    InvocationFinished { results: Arc<[Outcome]> },
    /// An inbound call or notification passed validation and is about to run.
    RequestReceived { request: Request },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Opened,
    Closed,
    ErrorOccurred,
    InvocationFinished,
    RequestReceived,
}

impl PeerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Opened => EventKind::Opened,
            Self::Closed => EventKind::Closed,
            Self::ErrorOccurred { .. } => EventKind::ErrorOccurred,
            Self::InvocationFinished { .. } => EventKind::InvocationFinished,
            Self::RequestReceived { .. } => EventKind::RequestReceived,
        }
    }
}

pub type Listener = Arc<dyn Fn(&PeerEvent) + Send + Sync>;

/// Wrap a closure as a [`Listener`].
///
/// Keep the returned `Arc` around if you intend to subscribe the same
/// listener again: identity is what makes a subscription a duplicate.
pub fn listener<F>(f: F) -> Listener
where
    F: Fn(&PeerEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    listener: Listener,
    once: bool,
}

pub(crate) struct EventBus {
    next_id: AtomicU64,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Register `listener` for `kind`. An identical `(kind, listener)` pair
    /// keeps its original subscription and id.
    pub(crate) fn subscribe(&self, kind: EventKind, listener: Listener, once: bool) -> SubscriptionId {
        let mut subscriptions = self.subscriptions.lock();
        if let Some(existing) = subscriptions
            .iter()
            .find(|s| s.kind == kind && Arc::ptr_eq(&s.listener, &listener))
        {
            return existing.id;
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        subscriptions.push(Subscription {
            id,
            kind,
            listener,
            once,
        });
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Deliver `event` to every matching listener.
    ///
    /// Listeners run outside the lock, so they may subscribe, unsubscribe or
    /// call back into the peer.
    pub(crate) fn emit(&self, event: PeerEvent) {
        let kind = event.kind();
        let targets: Vec<Listener> = {
            let mut subscriptions = self.subscriptions.lock();
            let targets = subscriptions
                .iter()
                .filter(|s| s.kind == kind)
                .map(|s| s.listener.clone())
                .collect();
            subscriptions.retain(|s| !(s.kind == kind && s.once));
            targets
        };

        tracing::trace!(?kind, listeners = targets.len(), "emitting peer event");
        for listener in targets {
            listener(&event);
        }
    }
}
