//! Typed arguments for request handlers.
//!
//! A handler function takes any number (up to four) of arguments whose
//! types implement [`FromRequest`]. Each one is pulled from the incoming
//! [`Request`], the [`Caller`] that sent it, or the router's [`AppState`]
//! before the handler runs. A failed extraction becomes the reply.
//!
//! | Extractor | Source |
//! |-----------|--------|
//! | [`Json<T>`] | the whole envelope, deserialized |
//! | [`Payload`] | envelope fields other than `handler` / `handler_method` |
//! | [`Method`] | `handler_method` |
//! | [`State<T>`] | a value stored in [`AppState`] |
//! | [`Caller`] | the sending client |
//! | [`Identity`] | the sending client's identity |
//! | [`Request`] | the envelope itself |
//!
//! # Examples
//!
//! ```
//! use serde::Deserialize;
//! use wsrelay_core::extractor::{Json, Method};
//! use wsrelay_core::dispatch::Caller;
//! use wsrelay_core::Result;
//!
//! #[derive(Deserialize)]
//! struct Chat {
//!     text: String,
//! }
//!
//! async fn chat(Json(chat): Json<Chat>, Method(method): Method, caller: Caller) -> Result<String> {
//!     Ok(format!("{} via {:?}: {}", caller.id, method, chat.text))
//! }
//! ```

use crate::dispatch::{Caller, Request};
use crate::error::{Error, Result};
use crate::handshake::Identity;
use crate::state::AppState;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Builds a handler argument from a request.
#[async_trait]
pub trait FromRequest: Sized {
    /// Performs the extraction.
    async fn from_request(request: &Request, caller: &Caller, state: &AppState) -> Result<Self>;
}

/// A value of type `T` stored in the router's state.
///
/// Fails when nothing of that type was stored.
pub struct State<T>(pub Arc<T>);

#[async_trait]
impl<T: Send + Sync + 'static> FromRequest for State<T> {
    async fn from_request(_request: &Request, _caller: &Caller, state: &AppState) -> Result<Self> {
        state.get::<T>().map(State).ok_or_else(|| {
            Error::extractor(format!("state {} not found", std::any::type_name::<T>()))
        })
    }
}

/// The whole request envelope deserialized as `T`.
///
/// The envelope includes `handler` and `handler_method`, so `T` may name
/// them too; unknown fields are ignored by serde's defaults.
pub struct Json<T>(pub T);

#[async_trait]
impl<T: DeserializeOwned + Send> FromRequest for Json<T> {
    async fn from_request(request: &Request, _caller: &Caller, _state: &AppState) -> Result<Self> {
        request
            .json()
            .map(Json)
            .map_err(|e| Error::extractor(format!("invalid request body: {}", e)))
    }
}

/// Envelope fields other than `handler` and `handler_method`.
pub struct Payload(pub Map<String, Value>);

#[async_trait]
impl FromRequest for Payload {
    async fn from_request(request: &Request, _caller: &Caller, _state: &AppState) -> Result<Self> {
        Ok(Payload(request.payload.clone()))
    }
}

/// The `handler_method` of the envelope, if any.
pub struct Method(pub Option<String>);

#[async_trait]
impl FromRequest for Method {
    async fn from_request(request: &Request, _caller: &Caller, _state: &AppState) -> Result<Self> {
        Ok(Method(request.handler_method.clone()))
    }
}

#[async_trait]
impl FromRequest for Caller {
    async fn from_request(_request: &Request, caller: &Caller, _state: &AppState) -> Result<Self> {
        Ok(caller.clone())
    }
}

#[async_trait]
impl FromRequest for Identity {
    async fn from_request(_request: &Request, caller: &Caller, _state: &AppState) -> Result<Self> {
        Ok(caller.identity.clone())
    }
}

#[async_trait]
impl FromRequest for Request {
    async fn from_request(request: &Request, _caller: &Caller, _state: &AppState) -> Result<Self> {
        Ok(request.clone())
    }
}
