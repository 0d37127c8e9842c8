//! WebSocket transport over `tokio-tungstenite`.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use futures::future::BoxFuture;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::{Connect, TransportError};

use super::{Inbound, ReadyState, Transport, TransportBackend};

// RFC 6455: no status code was present in the close frame.
const NO_STATUS_RECEIVED: u16 = 1005;

type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
type WsStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

#[derive(Clone)]
pub struct WebSocketTransport {
    inner: Arc<WebSocketInner>,
}

struct WebSocketInner {
    /// Write half (async mutex for holding across awaits).
    sink: AsyncMutex<WsSink>,
    /// Read half (async mutex for holding across awaits).
    stream: AsyncMutex<WsStream>,
    state: AtomicU8,
}

impl WebSocketTransport {
    /// Wrap an established WebSocket stream, client or server side.
    pub fn new<S>(ws: tokio_tungstenite::WebSocketStream<S>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        Self {
            inner: Arc::new(WebSocketInner {
                sink: AsyncMutex::new(Box::pin(sink)),
                stream: AsyncMutex::new(Box::pin(stream)),
                state: AtomicU8::new(ReadyState::Open as u8),
            }),
        }
    }

    /// Create a connected pair of WebSocket transports for testing.
    ///
    /// Uses `tokio::io::duplex` with WebSocket framing internally.
    pub async fn pair() -> Result<(Self, Self), TransportError> {
        let (client_stream, server_stream) = tokio::io::duplex(65536);

        let (client, server) = tokio::join!(
            tokio_tungstenite::client_async("ws://localhost/", client_stream),
            tokio_tungstenite::accept_async(server_stream),
        );
        let (ws_a, _response) = client.map_err(|e| handshake_error("client", e))?;
        let ws_b = server.map_err(|e| handshake_error("server", e))?;

        Ok((Self::new(ws_a), Self::new(ws_b)))
    }

    fn set_state(&self, state: ReadyState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }
}

fn handshake_error(side: &str, e: WsError) -> TransportError {
    TransportError::Io(std::io::Error::other(format!(
        "websocket {side} handshake: {e}"
    )))
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("ready_state", &self.ready_state())
            .finish_non_exhaustive()
    }
}

impl TransportBackend for WebSocketTransport {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.ready_state() != ReadyState::Open {
            return Err(TransportError::Closed);
        }

        let mut sink = self.inner.sink.lock().await;
        sink.send(Message::Text(text.into())).await.map_err(|e| {
            TransportError::Io(std::io::Error::other(format!("websocket send: {e}")))
        })
    }

    async fn recv(&self) -> Result<Inbound, TransportError> {
        let mut stream = self.inner.stream.lock().await;

        loop {
            let msg = match stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    self.set_state(ReadyState::Closed);
                    return Err(TransportError::Io(std::io::Error::other(format!(
                        "websocket recv: {e}"
                    ))));
                }
                None => {
                    self.set_state(ReadyState::Closed);
                    return Err(TransportError::Closed);
                }
            };

            match msg {
                Message::Text(text) => return Ok(Inbound::Text(text.as_str().to_owned())),
                Message::Binary(data) => return Ok(Inbound::Binary(data.to_vec())),
                Message::Close(frame) => {
                    self.set_state(ReadyState::Closed);
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
                        None => (NO_STATUS_RECEIVED, String::new()),
                    };
                    tracing::debug!(code, %reason, "websocket close frame received");
                    return Ok(Inbound::Closed { code, reason });
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        if self.ready_state() == ReadyState::Closed {
            return Ok(());
        }
        self.set_state(ReadyState::Closing);

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        let mut sink = self.inner.sink.lock().await;
        let result = sink.send(Message::Close(Some(frame))).await;
        self.set_state(ReadyState::Closed);

        match result {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::Io(std::io::Error::other(format!(
                "websocket close: {e}"
            )))),
        }
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.inner.state.load(Ordering::Acquire))
    }
}

/// Dials `ws://` and `wss://` URLs with `tokio_tungstenite::connect_async`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketConnector;

impl Connect for WebSocketConnector {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Transport, TransportError>> {
        Box::pin(async move {
            let (ws, _response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
                TransportError::Io(std::io::Error::other(format!(
                    "websocket connect to {url}: {e}"
                )))
            })?;
            tracing::debug!(url, "websocket connected");
            Ok(Transport::WebSocket(WebSocketTransport::new(ws)))
        })
    }
}
