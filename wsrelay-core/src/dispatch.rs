//! Request envelopes and the dispatcher seam.
//!
//! Clients send JSON objects that name a handler:
//!
//! ```text
//! {"handler": "Chat", "handler_method": "send", "text": "hi"}
//! ```
//!
//! The listener turns such a frame into a [`Request`] and hands it, with a
//! [`Caller`] snapshot of the sender, to the application's
//! [`RequestDispatcher`]. Whatever [`Reply`] comes back is written to the
//! sender only. A dispatcher error is sent back as an `Error: ...` text
//! reply and does not affect the connection.
//!
//! [`HandlerRouter`](crate::router::HandlerRouter) is the stock dispatcher;
//! implement the trait directly to plug in anything else.
//!
//! # Examples
//!
//! ```
//! use wsrelay_core::dispatch::{Caller, Reply, Request, RequestDispatcher};
//! use wsrelay_core::{async_trait, Result};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl RequestDispatcher for Echo {
//!     async fn dispatch(&self, request: Request, _caller: Caller) -> Result<Reply> {
//!         Ok(Reply::text(serde_json::to_string(&request.payload)?))
//!     }
//! }
//! ```

pub use crate::client::Caller;

use crate::error::{Error, Result};
use crate::frame::Opcode;
use crate::messenger::Messenger;
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// A decoded request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Handler name.
    pub handler: String,
    /// Optional method on the handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_method: Option<String>,
    /// Every other field of the envelope.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Request {
    /// Creates a request for `handler` with an empty payload.
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            handler_method: None,
            payload: Map::new(),
        }
    }

    /// Sets the handler method.
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.handler_method = Some(method.into());
        self
    }

    /// Adds a payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Parses a frame payload.
    ///
    /// Fails unless the payload is a JSON object with a string `handler`.
    ///
    /// ```
    /// use wsrelay_core::dispatch::Request;
    ///
    /// let request = Request::from_slice(br#"{"handler":"chat","text":"hi"}"#).unwrap();
    /// assert_eq!(request.handler, "chat");
    /// assert_eq!(request.payload["text"], "hi");
    ///
    /// assert!(Request::from_slice(br#"{"text":"hi"}"#).is_err());
    /// ```
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        match value.get("handler") {
            Some(Value::String(_)) => Ok(serde_json::from_value(value)?),
            Some(_) => Err(Error::InvalidRequest("handler must be a string".into())),
            None => Err(Error::InvalidRequest("missing handler".into())),
        }
    }

    /// Lookup keys, most specific first: `handler.method`, then `handler`.
    pub fn route_keys(&self) -> Vec<String> {
        let handler = self.handler.to_lowercase();
        match &self.handler_method {
            Some(method) => vec![format!("{}.{}", handler, method.to_lowercase()), handler],
            None => vec![handler],
        }
    }

    /// Deserializes the whole envelope into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        let value = serde_json::to_value(self)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Looks up one payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

/// What a dispatcher sends back to the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Reply {
    /// Nothing is sent.
    #[default]
    Empty,
    /// A text payload.
    Text(String),
    /// A byte payload.
    Binary(Vec<u8>),
}

impl Reply {
    /// Text reply.
    pub fn text(text: impl Into<String>) -> Self {
        Reply::Text(text.into())
    }

    /// Byte reply.
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Reply::Binary(data.into())
    }

    /// Serializes `value` as a JSON text reply.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Reply::Text(serde_json::to_string(value)?))
    }

    /// Returns `true` for [`Reply::Empty`].
    pub fn is_empty(&self) -> bool {
        matches!(self, Reply::Empty)
    }

    /// Payload and inferred opcode, or `None` when there is nothing to send.
    ///
    /// The opcode follows the payload: UTF-8 up to 1 MiB is TEXT, larger
    /// UTF-8 is streamed, anything else is BINARY.
    pub fn into_payload(self) -> Option<(Bytes, Opcode)> {
        let bytes = match self {
            Reply::Empty => return None,
            Reply::Text(text) => Bytes::from(text),
            Reply::Binary(data) => Bytes::from(data),
        };
        if bytes.is_empty() {
            return None;
        }
        let opcode = Opcode::infer(&bytes);
        Some((bytes, opcode))
    }
}

/// Conversion of handler return values into a [`Reply`].
pub trait IntoReply: Send {
    /// Performs the conversion.
    fn into_reply(self) -> Result<Reply>;
}

impl IntoReply for () {
    fn into_reply(self) -> Result<Reply> {
        Ok(Reply::Empty)
    }
}

impl IntoReply for Reply {
    fn into_reply(self) -> Result<Reply> {
        Ok(self)
    }
}

impl IntoReply for String {
    fn into_reply(self) -> Result<Reply> {
        Ok(Reply::Text(self))
    }
}

impl IntoReply for &'static str {
    fn into_reply(self) -> Result<Reply> {
        Ok(Reply::Text(self.to_string()))
    }
}

impl IntoReply for Vec<u8> {
    fn into_reply(self) -> Result<Reply> {
        Ok(Reply::Binary(self))
    }
}

impl IntoReply for Value {
    fn into_reply(self) -> Result<Reply> {
        Ok(Reply::Text(self.to_string()))
    }
}

impl<T: IntoReply> IntoReply for Result<T> {
    fn into_reply(self) -> Result<Reply> {
        match self {
            Ok(reply) => reply.into_reply(),
            Err(e) => Ok(error_reply(&e)),
        }
    }
}

/// Serializes the wrapped value as a JSON text reply.
///
/// ```
/// use wsrelay_core::dispatch::{IntoReply, JsonReply, Reply};
/// use serde_json::json;
///
/// let reply = JsonReply(json!({"ok": true})).into_reply().unwrap();
/// assert_eq!(reply, Reply::text(r#"{"ok":true}"#));
/// ```
pub struct JsonReply<T>(pub T);

impl<T: Serialize + Send> IntoReply for JsonReply<T> {
    fn into_reply(self) -> Result<Reply> {
        Reply::json(&self.0)
    }
}

/// The text reply sent for a failed request.
pub fn error_reply(error: &Error) -> Reply {
    Reply::Text(format!("Error: {}", error))
}

/// Routes request envelopes to application code.
#[async_trait]
pub trait RequestDispatcher: Send + Sync + 'static {
    /// Handles one request from `caller`.
    async fn dispatch(&self, request: Request, caller: Caller) -> Result<Reply>;

    /// Called once before the first connection is accepted.
    fn on_start(&self, _messenger: &Arc<Messenger>) {}
}

#[async_trait]
impl<D: RequestDispatcher + ?Sized> RequestDispatcher for Arc<D> {
    async fn dispatch(&self, request: Request, caller: Caller) -> Result<Reply> {
        (**self).dispatch(request, caller).await
    }

    fn on_start(&self, messenger: &Arc<Messenger>) {
        (**self).on_start(messenger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_keeps_extra_fields() {
        let request =
            Request::from_slice(br#"{"handler":"Chat","handler_method":"Send","text":"hi","n":2}"#)
                .unwrap();
        assert_eq!(request.handler_method.as_deref(), Some("Send"));
        assert_eq!(request.field("n"), Some(&json!(2)));
        assert!(request.field("handler").is_none());
        assert_eq!(request.route_keys(), vec!["chat.send", "chat"]);
    }

    #[test]
    fn test_request_rejects_non_envelopes() {
        assert!(matches!(Request::from_slice(b"[1,2]"), Err(Error::InvalidRequest(_))));
        assert!(matches!(
            Request::from_slice(br#"{"handler":5}"#),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(Request::from_slice(b"not json"), Err(Error::Json(_))));
    }

    #[test]
    fn test_request_json_sees_whole_envelope() {
        #[derive(Deserialize)]
        struct Chat {
            handler: String,
            text: String,
        }

        let request = Request::new("chat").with_field("text", "hello");
        let chat: Chat = request.json().unwrap();
        assert_eq!(chat.handler, "chat");
        assert_eq!(chat.text, "hello");
    }

    #[test]
    fn test_reply_payload_opcodes() {
        assert_eq!(Reply::Empty.into_payload(), None);
        assert_eq!(Reply::text("").into_payload(), None);

        let (bytes, opcode) = Reply::text("hi").into_payload().unwrap();
        assert_eq!(&bytes[..], b"hi");
        assert_eq!(opcode, Opcode::Text);

        let (_, opcode) = Reply::binary(vec![0xff, 0x00]).into_payload().unwrap();
        assert_eq!(opcode, Opcode::Binary);

        let (_, opcode) = Reply::text("a".repeat(2 * 1024 * 1024)).into_payload().unwrap();
        assert_eq!(opcode, Opcode::Continuation);
    }

    #[test]
    fn test_result_error_becomes_text() {
        let result: Result<String> = Err(Error::handler("boom"));
        assert_eq!(result.into_reply().unwrap(), Reply::text("Error: Handler error: boom"));
    }

    #[test]
    fn test_unit_is_empty() {
        assert!(().into_reply().unwrap().is_empty());
    }
}
