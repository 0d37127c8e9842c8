//! Waiting for a specific inbound call.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Sleep;

use crate::{EventKind, Peer, PeerEvent, Request, SubscriptionId, listener};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("wait canceled: {0}")]
    Canceled(String),
    #[error("timed out waiting for '{method}'")]
    TimedOut { method: String },
    #[error("the peer closed while waiting")]
    PeerClosed,
}

type Slot = Arc<Mutex<Option<oneshot::Sender<Result<Request, WaitError>>>>>;

/// Cancels a pending [`WaitHandle`] from elsewhere.
#[derive(Clone)]
pub struct WaitCanceler {
    slot: Slot,
}

impl WaitCanceler {
    /// Settle the wait with [`WaitError::Canceled`]. Returns false if it had
    /// already settled.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        settle(&self.slot, Err(WaitError::Canceled(reason.into())))
    }
}

fn settle(slot: &Slot, result: Result<Request, WaitError>) -> bool {
    match slot.lock().take() {
        Some(tx) => {
            let _ = tx.send(result);
            true
        }
        None => false,
    }
}

/// Resolves with the next inbound call or notification for one method.
///
/// Created by [`Peer::wait_for`]. Dropping it stops listening.
pub struct WaitHandle {
    peer: Peer,
    method: String,
    slot: Slot,
    rx: oneshot::Receiver<Result<Request, WaitError>>,
    deadline: Option<Pin<Box<Sleep>>>,
    subscriptions: Vec<SubscriptionId>,
}

impl WaitHandle {
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        self.canceler().cancel(reason)
    }

    pub fn canceler(&self) -> WaitCanceler {
        WaitCanceler {
            slot: self.slot.clone(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl Future for WaitHandle {
    type Output = Result<Request, WaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Poll::Ready(received) = Pin::new(&mut this.rx).poll(cx) {
            return Poll::Ready(received.unwrap_or(Err(WaitError::PeerClosed)));
        }

        let expired = this
            .deadline
            .as_mut()
            .is_some_and(|deadline| deadline.as_mut().poll(cx).is_ready());
        if expired {
            let method = this.method.clone();
            settle(&this.slot, Err(WaitError::TimedOut { method }));
            // Whatever won the race is in the channel now.
            return match this.rx.try_recv() {
                Ok(result) => Poll::Ready(result),
                Err(_) => Poll::Ready(Err(WaitError::PeerClosed)),
            };
        }

        Poll::Pending
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.peer.unsubscribe(id);
        }
    }
}

impl Peer {
    /// Wait for the next inbound call or notification of `method`.
    ///
    /// The wait ends early with [`WaitError::TimedOut`] after `timeout`, with
    /// [`WaitError::PeerClosed`] when the peer closes, or with
    /// [`WaitError::Canceled`] through [`WaitHandle::cancel`].
    pub fn wait_for(&self, method: &str, timeout: Option<Duration>) -> WaitHandle {
        let (tx, rx) = oneshot::channel();
        let slot: Slot = Arc::new(Mutex::new(Some(tx)));

        let on_request = {
            let slot = slot.clone();
            let method = method.to_owned();
            listener(move |event| {
                if let PeerEvent::RequestReceived { request } = event {
                    if request.method == method {
                        settle(&slot, Ok(request.clone()));
                    }
                }
            })
        };
        let on_closed = {
            let slot = slot.clone();
            listener(move |_| {
                settle(&slot, Err(WaitError::PeerClosed));
            })
        };

        let subscriptions = vec![
            self.subscribe(EventKind::RequestReceived, on_request),
            self.subscribe(EventKind::Closed, on_closed),
        ];

        WaitHandle {
            peer: self.clone(),
            method: method.to_owned(),
            slot,
            rx,
            deadline: timeout.map(|t| Box::pin(tokio::time::sleep(t))),
            subscriptions,
        }
    }
}
