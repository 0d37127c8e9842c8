//! Calculator peer over WebSocket.
//!
//! `serve` hosts a calculator peer for every connection; `call` dials one,
//! issues a single call and prints how it ended.
//!
//! ```text
//! calculator-peer serve --listen 127.0.0.1:4790
//! calculator-peer call --url ws://127.0.0.1:4790 --method add --params '[1, 2]'
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jrpeer_core::websocket::WebSocketConnector;
use jrpeer_core::{
    EventKind, OpenTarget, Peer, PeerEvent, Request, RequestId, RequestOptions, Transport, listener,
};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "calculator-peer")]
#[command(about = "JSON-RPC 2.0 calculator peer over WebSocket")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept WebSocket connections and serve the calculator on each.
    Serve {
        #[arg(long, default_value = "127.0.0.1:4790")]
        listen: SocketAddr,
    },
    /// Connect, make one call and print the outcome.
    Call {
        #[arg(long, default_value = "ws://127.0.0.1:4790")]
        url: String,
        #[arg(long)]
        method: String,
        /// JSON params, e.g. '[1, 2]'
        #[arg(long)]
        params: Option<String>,
        /// Call id. Integers are sent as numbers. Omit for a generated id.
        #[arg(long, conflicts_with = "notify")]
        id: Option<String>,
        /// Send a notification instead of a call.
        #[arg(long)]
        notify: bool,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    match Args::parse().command {
        Command::Serve { listen } => serve(listen).await,
        Command::Call {
            url,
            method,
            params,
            id,
            notify,
            timeout_ms,
        } => {
            let params = params
                .map(|raw| serde_json::from_str::<Value>(&raw))
                .transpose()
                .context("--params is not valid JSON")?;
            call(&url, &method, params, id, notify, timeout_ms).await
        }
    }
}

async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("calculator peer ready on ws://{}", listener.local_addr()?);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, peer_addr).await {
                error!(?err, "connection from {} failed", peer_addr);
            }
        });
    }
}

async fn serve_connection(stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .with_context(|| format!("WebSocket handshake failed for {peer_addr}"))?;

    let peer = Peer::new();
    jrpeer_testkit::calculator::install(&peer)?;

    let closed = Arc::new(Notify::new());
    peer.once(EventKind::Closed, {
        let closed = closed.clone();
        listener(move |_| closed.notify_one())
    });
    peer.subscribe(
        EventKind::ErrorOccurred,
        listener(move |event| {
            if let PeerEvent::ErrorOccurred { error } = event {
                warn!(%error, "peer error from {}", peer_addr);
            }
        }),
    );

    peer.open(OpenTarget::adopt(Transport::websocket(ws))).await?;
    info!("serving {}", peer_addr);
    closed.notified().await;
    info!("{} disconnected", peer_addr);
    Ok(())
}

async fn call(
    url: &str,
    method: &str,
    params: Option<Value>,
    id: Option<String>,
    notify: bool,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let peer = Peer::new();
    peer.open(OpenTarget::endpoint(url, WebSocketConnector))
        .await
        .with_context(|| format!("failed to connect to {url}"))?;

    let mut request = Request::new(method);
    request.params = params;
    if !notify {
        let id = match id {
            Some(raw) => raw
                .parse::<i64>()
                .map(RequestId::Number)
                .unwrap_or(RequestId::String(raw)),
            None => peer.next_request_id(),
        };
        request = request.with_id(id);
    }
    let options = RequestOptions {
        timeout: timeout_ms.map(Duration::from_millis),
    };

    let outcome = peer.request(request, options).await;
    peer.close().await?;
    let outcome = outcome?;

    let printed = match (&outcome.request.id, &outcome.result) {
        (None, _) => json!({ "sent": outcome.request }),
        (Some(id), Ok(result)) => json!({ "id": id, "result": result }),
        (Some(id), Err(error)) => json!({ "id": id, "error": error }),
    };
    println!("{}", serde_json::to_string_pretty(&printed)?);
    Ok(())
}
