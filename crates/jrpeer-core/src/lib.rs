//! jrpeer-core: a symmetric JSON-RPC 2.0 peer.
//!
//! This crate defines:
//! - The peer engine ([`Peer`], [`PeerState`]): lifecycle, outbound calls,
//!   inbound dispatch
//! - Wire messages and the inbound classifier ([`Request`], [`Response`], [`classify`])
//! - Error codes and types ([`ErrorCode`], [`ProtocolError`], [`PeerError`], [`HandlerError`])
//! - Transports ([`Transport`], [`OpenTarget`], [`Connect`])
//! - Handlers ([`RpcHandler`], [`rpc_handler`], [`RpcContext`])
//! - Events ([`PeerEvent`], [`EventKind`]) and [`Peer::wait_for`]
//! - Configuration ([`PeerConfig`], [`RequestOptions`])

#![forbid(unsafe_code)]

mod config;
mod dispatch;
mod error;
mod events;
mod handler;
mod invocation;
mod message;
mod peer;
mod transport;
mod wait;

pub use config::*;
pub use error::*;
pub use events::*;
pub use handler::*;
pub use invocation::*;
pub use message::*;
pub use peer::*;
pub use transport::*;
pub use wait::*;
