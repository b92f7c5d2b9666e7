//! # wsrelay
//!
//! A cooperative WebSocket fan-out server with Redis-style pub/sub scaling.
//!
//! This crate re-exports [`wsrelay_core`]; see its documentation for the
//! architecture and module guide.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use wsrelay::prelude::*;
//!
//! async fn echo(Payload(fields): Payload) -> Result<String> {
//!     Ok(serde_json::Value::Object(fields).to_string())
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let router = HandlerRouter::new().route("echo", handler(echo));
//!     let config = ServerConfig::default().with_port(8085);
//!
//!     let runtime = Runtime::bind(config, Arc::new(router)).await?;
//!     runtime.run().await
//! }
//! ```
//!
//! Clients then connect with any WebSocket client:
//!
//! ```text
//! ws://127.0.0.1:8085/?fingerprint=<hash>&trongateToken=<token>&user_id=<id>
//! ```
//!
//! and receive `{"channel": "...", "message": ...}` envelopes for every
//! broadcast, including `state` updates with the online count.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub use wsrelay_core::*;

/// Prelude module for convenient imports.
///
/// ```
/// use wsrelay::prelude::*;
///
/// async fn whoami(identity: Identity) -> Result<String> {
///     Ok(format!("{:?}", identity.user_id))
/// }
///
/// let _router = HandlerRouter::new().route("whoami", handler(whoami));
/// ```
pub mod prelude {
    pub use wsrelay_core::prelude::*;
}
