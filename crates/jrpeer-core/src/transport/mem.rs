//! In-process transport, used by tests and by peers living in one process.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use futures::future::BoxFuture;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};

use crate::{Connect, TransportError};

use super::{Inbound, ReadyState, Transport, TransportBackend};

#[derive(Debug)]
enum MemFrame {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
    Abort,
}

#[derive(Clone)]
pub struct MemTransport {
    inner: Arc<MemInner>,
}

struct MemInner {
    // Unbounded: a reader that is itself blocked on sending must never stall
    // the other end.
    tx: mpsc::UnboundedSender<MemFrame>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<MemFrame>>,
    state: AtomicU8,
    local_close: watch::Sender<Option<(u16, String)>>,
}

impl MemTransport {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (Self::half(tx_b, rx_a), Self::half(tx_a, rx_b))
    }

    fn half(tx: mpsc::UnboundedSender<MemFrame>, rx: mpsc::UnboundedReceiver<MemFrame>) -> Self {
        Self {
            inner: Arc::new(MemInner {
                tx,
                rx: AsyncMutex::new(rx),
                state: AtomicU8::new(ReadyState::Open as u8),
                local_close: watch::channel(None).0,
            }),
        }
    }

    /// Drop the connection without a close handshake.
    ///
    /// Both ends see a transport error on their next `recv`.
    pub fn abort(&self) {
        self.set_state(ReadyState::Closed);
        let _ = self.inner.tx.send(MemFrame::Abort);
        self.inner
            .local_close
            .send_replace(Some((super::ABNORMAL_CLOSURE, String::new())));
    }

    fn set_state(&self, state: ReadyState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    fn on_frame(&self, frame: Option<MemFrame>) -> Result<Inbound, TransportError> {
        match frame {
            Some(MemFrame::Text(text)) => Ok(Inbound::Text(text)),
            Some(MemFrame::Binary(data)) => Ok(Inbound::Binary(data)),
            Some(MemFrame::Close { code, reason }) => {
                self.set_state(ReadyState::Closed);
                Ok(Inbound::Closed { code, reason })
            }
            Some(MemFrame::Abort) => {
                self.set_state(ReadyState::Closed);
                Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection aborted by remote",
                )))
            }
            None => {
                self.set_state(ReadyState::Closed);
                Err(TransportError::Closed)
            }
        }
    }
}

impl std::fmt::Debug for MemTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTransport")
            .field("ready_state", &self.ready_state())
            .finish_non_exhaustive()
    }
}

impl TransportBackend for MemTransport {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.ready_state() != ReadyState::Open {
            return Err(TransportError::Closed);
        }
        self.inner
            .tx
            .send(MemFrame::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Inbound, TransportError> {
        let mut local_close = self.inner.local_close.subscribe();
        let mut rx = self.inner.rx.lock().await;

        tokio::select! {
            biased;
            frame = rx.recv() => self.on_frame(frame),
            closed = local_close.wait_for(Option::is_some) => match closed {
                Ok(closed) => match &*closed {
                    Some((code, reason)) if *code != super::ABNORMAL_CLOSURE => Ok(Inbound::Closed {
                        code: *code,
                        reason: reason.clone(),
                    }),
                    _ => Err(TransportError::Closed),
                },
                Err(_) => Err(TransportError::Closed),
            },
        }
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        if self.ready_state() == ReadyState::Closed {
            return Ok(());
        }
        self.set_state(ReadyState::Closed);
        let _ = self.inner.tx.send(MemFrame::Close {
            code,
            reason: reason.to_owned(),
        });
        self.inner
            .local_close
            .send_replace(Some((code, reason.to_owned())));
        Ok(())
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.inner.state.load(Ordering::Acquire))
    }
}

impl MemTransport {
    /// Send a binary message. Peers route these to their non-JSON handler.
    pub fn send_binary(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if self.ready_state() != ReadyState::Open {
            return Err(TransportError::Closed);
        }
        self.inner
            .tx
            .send(MemFrame::Binary(data))
            .map_err(|_| TransportError::Closed)
    }
}

/// Create an in-process listener: connections made with the [`MemConnector`]
/// show up on the [`MemAcceptor`].
pub fn listener() -> (MemConnector, MemAcceptor) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MemConnector { tx }, MemAcceptor { rx })
}

#[derive(Clone, Debug)]
pub struct MemConnector {
    tx: mpsc::UnboundedSender<MemTransport>,
}

#[derive(Debug)]
pub struct MemAcceptor {
    rx: mpsc::UnboundedReceiver<MemTransport>,
}

impl MemAcceptor {
    /// Wait for the next connection. `None` once every connector is gone.
    pub async fn accept(&mut self) -> Option<Transport> {
        self.rx.recv().await.map(Transport::Mem)
    }
}

impl Connect for MemConnector {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Transport, TransportError>> {
        Box::pin(async move {
            let (local, remote) = MemTransport::pair();
            self.tx.send(remote).map_err(|_| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("nobody is accepting on {url}"),
                ))
            })?;
            tracing::debug!(url, "mem transport connected");
            Ok(Transport::Mem(local))
        })
    }
}
