//! # wsrelay-core
//!
//! Core of wsrelay, a cooperative WebSocket fan-out server.
//!
//! Clients connect over TCP, upgrade to WebSocket, and from then on receive
//! every message broadcast on the server's channels. They can also send JSON
//! request envelopes, which are routed to application handlers and answered
//! to the sender alone. Several server nodes can share channels through a
//! Redis-compatible pub/sub broker.
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────┐   accept    ┌───────────┐  flush   ┌───────────────┐
//!  TCP ─►│ Runtime  │────────────►│ Scheduler │─────────►│ client tasks  │
//!        └──────────┘             └───────────┘          │ handshake     │
//!                                       │                │ listener ─────┼─► RequestDispatcher
//!                                       │                │ keepalive     │
//!                                       ▼                └───────────────┘
//!                              ┌─────────────────┐
//!   broker ◄── PUBLISH ────────│    Messenger    │── broadcast ──► ClientRegistry
//!   broker ── message ────────►│  subscriptions  │
//!                              └─────────────────┘
//! ```
//!
//! Everything runs on the task that calls [`Runtime::run`]: the runtime
//! accepts connections, then resumes each queued task once per tick. Tasks
//! never block; they yield whenever a socket has nothing to offer.
//!
//! ## Modules
//!
//! - [`frame`]: WebSocket frame codec
//! - [`handshake`]: upgrade response and identity parsing
//! - [`scheduler`]: FIFO cooperative task queue
//! - [`client`] / [`registry`]: per-connection state and the live set
//! - [`session`]: the three tasks each client runs
//! - [`broker`] / [`channel`] / [`messenger`]: pub/sub and fan-out
//! - [`dispatch`] / [`router`] / [`handler`] / [`extractor`] / [`state`]:
//!   request handling
//! - [`runtime`] / [`config`]: the server loop and its settings
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use wsrelay_core::prelude::*;
//!
//! async fn publish(Json(body): Json<serde_json::Value>, State(messenger): State<Messenger>) -> Result<&'static str> {
//!     messenger.publish("live_streams", &body["message"].to_string()).await?;
//!     Ok("published")
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let router = HandlerRouter::new().route("publish", handler(publish));
//!     let config = ServerConfig::default().without_broker();
//!
//!     Runtime::bind(config, Arc::new(router)).await?.run().await
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod broker;
pub mod channel;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod extractor;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod messenger;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod state;

#[cfg(test)]
mod test_util;

pub use async_trait::async_trait;
pub use channel::{Channel, ChannelHandle, LiveStreams};
pub use client::{Caller, Client, ClientId, ClientState};
pub use config::{BrokerConfig, ServerConfig};
pub use dispatch::{IntoReply, JsonReply, Reply, Request, RequestDispatcher};
pub use error::{Error, Result};
pub use extractor::{Json, Method, Payload, State};
pub use frame::{Frame, Opcode};
pub use handler::{handler, Handler};
pub use handshake::Identity;
pub use messenger::{BroadcastReport, Messenger, OnlineCount};
pub use registry::ClientRegistry;
pub use router::HandlerRouter;
pub use runtime::Runtime;
pub use state::AppState;

/// Commonly used types and traits for wsrelay applications.
///
/// ```
/// use wsrelay_core::prelude::*;
///
/// async fn hello(caller: Caller) -> Result<String> {
///     Ok(format!("hello {}", caller.id))
/// }
///
/// let router = HandlerRouter::new().route("hello", handler(hello));
/// assert!(router.has_route("hello"));
/// ```
pub mod prelude {
    pub use crate::async_trait;
    pub use crate::channel::{Channel, ChannelHandle};
    pub use crate::client::{Caller, ClientId};
    pub use crate::config::{BrokerConfig, ServerConfig};
    pub use crate::dispatch::{IntoReply, JsonReply, Reply, Request, RequestDispatcher};
    pub use crate::error::{Error, Result};
    pub use crate::extractor::{Json, Method, Payload, State};
    pub use crate::handler::{handler, Handler};
    pub use crate::handshake::Identity;
    pub use crate::messenger::Messenger;
    pub use crate::router::HandlerRouter;
    pub use crate::runtime::Runtime;
    pub use crate::state::AppState;
}
