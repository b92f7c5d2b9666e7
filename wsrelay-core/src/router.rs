//! Name-based request routing.
//!
//! [`HandlerRouter`] maps handler names to [`Handler`]s and implements
//! [`RequestDispatcher`], so it can be handed straight to the runtime.
//!
//! A request for handler `Chat` with method `send` is looked up as
//! `chat.send` first, then as `chat`, then falls back to the default
//! handler. Names are matched case-insensitively.
//!
//! # Examples
//!
//! ```
//! use wsrelay_core::router::HandlerRouter;
//! use wsrelay_core::handler::handler;
//! use wsrelay_core::extractor::Payload;
//!
//! async fn echo(Payload(fields): Payload) -> String {
//!     serde_json::Value::Object(fields).to_string()
//! }
//!
//! async fn send() -> &'static str {
//!     "sent"
//! }
//!
//! let router = HandlerRouter::new()
//!     .route("echo", handler(echo))
//!     .route("chat.send", handler(send));
//!
//! assert!(router.has_route("Chat.Send"));
//! ```

use crate::dispatch::{Caller, Reply, Request, RequestDispatcher};
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::messenger::Messenger;
use crate::state::AppState;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Dispatcher that routes requests to handlers by name.
#[derive(Clone, Default)]
pub struct HandlerRouter {
    routes: Arc<DashMap<String, Arc<dyn Handler>>>,
    default_handler: Option<Arc<dyn Handler>>,
    state: AppState,
}

impl HandlerRouter {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under `name` (`handler` or `handler.method`).
    pub fn route(self, name: impl AsRef<str>, handler: Arc<dyn Handler>) -> Self {
        self.routes.insert(name.as_ref().to_lowercase(), handler);
        self
    }

    /// Handler for requests no route matches.
    pub fn default_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.default_handler = Some(handler);
        self
    }

    /// Adds a value handlers can extract with `State<T>`.
    pub fn with_state<T: Send + Sync + 'static>(self, value: Arc<T>) -> Self {
        self.state.insert(value);
        self
    }

    /// Shared handler state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Returns `true` if `name` has a registered handler.
    pub fn has_route(&self, name: &str) -> bool {
        self.routes.contains_key(&name.to_lowercase())
    }

    fn resolve(&self, request: &Request) -> Option<Arc<dyn Handler>> {
        request
            .route_keys()
            .iter()
            .find_map(|key| self.routes.get(key).map(|entry| entry.value().clone()))
            .or_else(|| self.default_handler.clone())
    }
}

#[async_trait]
impl RequestDispatcher for HandlerRouter {
    async fn dispatch(&self, request: Request, caller: Caller) -> Result<Reply> {
        let Some(handler) = self.resolve(&request) else {
            return Err(Error::HandlerNotFound(request.handler));
        };

        debug!(client = %caller.id, handler = %request.handler, "dispatching request");
        handler.call(request, caller, self.state.clone()).await
    }

    fn on_start(&self, messenger: &Arc<Messenger>) {
        self.state.insert(messenger.clone());
    }
}

impl std::fmt::Debug for HandlerRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let routes: Vec<String> = self.routes.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("HandlerRouter")
            .field("routes", &routes)
            .field("default_handler", &self.default_handler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler;
    use crate::handshake::Identity;
    use crate::registry::ClientRegistry;
    use std::time::Duration;

    fn caller() -> Caller {
        Caller {
            id: "client_3".into(),
            peer_addr: "127.0.0.1:6000".parse().unwrap(),
            identity: Identity::default(),
        }
    }

    async fn whole() -> &'static str {
        "whole"
    }

    async fn method() -> &'static str {
        "method"
    }

    async fn fallback() -> &'static str {
        "fallback"
    }

    #[tokio::test]
    async fn test_method_route_wins() {
        let router = HandlerRouter::new()
            .route("Chat", handler(whole))
            .route("chat.send", handler(method));

        let reply = router
            .dispatch(Request::new("chat").with_method("SEND"), caller())
            .await
            .unwrap();
        assert_eq!(reply, Reply::text("method"));

        let reply = router
            .dispatch(Request::new("CHAT").with_method("edit"), caller())
            .await
            .unwrap();
        assert_eq!(reply, Reply::text("whole"));
    }

    #[tokio::test]
    async fn test_unknown_handler() {
        let router = HandlerRouter::new().route("chat", handler(whole));
        let err = router.dispatch(Request::new("nope"), caller()).await.unwrap_err();
        assert_eq!(err.to_string(), "handler [nope] not found");

        let router = router.default_handler(handler(fallback));
        let reply = router.dispatch(Request::new("nope"), caller()).await.unwrap();
        assert_eq!(reply, Reply::text("fallback"));
    }

    #[test]
    fn test_on_start_stores_messenger() {
        let router = HandlerRouter::new();
        let messenger = Arc::new(Messenger::new(
            Arc::new(ClientRegistry::new()),
            None,
            Duration::from_millis(10),
        ));
        router.on_start(&messenger);
        assert!(router.state().messenger().is_some());
    }
}
