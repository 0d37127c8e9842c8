//! Transport enum and internal backend trait.
//!
//! The public API is the [`Transport`] enum. Each backend lives in its own
//! module under `transport/` and implements the internal [`TransportBackend`]
//! trait. A transport carries whole text messages; framing is the backend's
//! business.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::TransportError;

/// Close code sent when a peer closes a transport it owns.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code reported when the connection dropped without a close handshake.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Connection state as seen by the local end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// What a transport delivers to its reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    /// The close handshake completed.
    Closed { code: u16, reason: String },
}

pub(crate) trait TransportBackend: Send + Sync + Clone + 'static {
    async fn send_text(&self, text: String) -> Result<(), TransportError>;
    async fn recv(&self) -> Result<Inbound, TransportError>;
    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError>;
    fn ready_state(&self) -> ReadyState;
}

#[derive(Clone, Debug)]
pub enum Transport {
    #[cfg(feature = "mem")]
    Mem(mem::MemTransport),
    #[cfg(feature = "websocket")]
    WebSocket(websocket::WebSocketTransport),
}

impl Transport {
    pub async fn send_text(&self, text: String) -> Result<(), TransportError> {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.send_text(text).await,
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.send_text(text).await,
        }
    }

    /// Wait for the next inbound message.
    ///
    /// `Err` means the connection failed; a clean shutdown is reported as
    /// [`Inbound::Closed`].
    pub async fn recv(&self) -> Result<Inbound, TransportError> {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.recv().await,
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.recv().await,
        }
    }

    pub async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.close(code, reason).await,
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.close(code, reason).await,
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.ready_state(),
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.ready_state(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    #[cfg(feature = "mem")]
    pub fn mem_pair() -> (Self, Self) {
        let (a, b) = mem::MemTransport::pair();
        (Transport::Mem(a), Transport::Mem(b))
    }

    #[cfg(feature = "websocket")]
    pub fn websocket<S>(ws: tokio_tungstenite::WebSocketStream<S>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        Transport::WebSocket(websocket::WebSocketTransport::new(ws))
    }

    #[cfg(feature = "websocket")]
    pub async fn websocket_pair() -> Result<(Self, Self), TransportError> {
        let (a, b) = websocket::WebSocketTransport::pair().await?;
        Ok((Transport::WebSocket(a), Transport::WebSocket(b)))
    }
}

/// Opens a transport to an address. Injected into [`OpenTarget::Endpoint`].
pub trait Connect: Send + Sync + 'static {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Transport, TransportError>>;
}

/// What [`Peer::open`](crate::Peer::open) connects over.
#[derive(Clone)]
pub enum OpenTarget {
    /// Dial `url` with `connector`. The peer owns the resulting transport.
    Endpoint {
        url: String,
        connector: Arc<dyn Connect>,
    },
    /// An already-open transport. When `owned` is false the peer only
    /// detaches from it on close.
    Transport { transport: Transport, owned: bool },
}

impl OpenTarget {
    pub fn endpoint(url: impl Into<String>, connector: impl Connect) -> Self {
        Self::Endpoint {
            url: url.into(),
            connector: Arc::new(connector),
        }
    }

    /// Use `transport` without taking ownership of it.
    pub fn attach(transport: Transport) -> Self {
        Self::Transport {
            transport,
            owned: false,
        }
    }

    /// Use `transport` and close it when the peer closes.
    pub fn adopt(transport: Transport) -> Self {
        Self::Transport {
            transport,
            owned: true,
        }
    }
}

impl std::fmt::Debug for OpenTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Endpoint { url, .. } => f.debug_struct("Endpoint").field("url", url).finish(),
            Self::Transport { transport, owned } => f
                .debug_struct("Transport")
                .field("transport", transport)
                .field("owned", owned)
                .finish(),
        }
    }
}

#[cfg(feature = "mem")]
pub mod mem;
#[cfg(feature = "websocket")]
pub mod websocket;
