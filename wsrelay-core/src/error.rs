//! Error types and result handling for wsrelay.
//!
//! Every fallible operation in the crate returns [`Result<T>`], an alias for
//! `std::result::Result<T, Error>`. The variants follow the server's error
//! taxonomy:
//!
//! - **Fatal**: [`Error::Bind`] and [`Error::BrokerConnect`] abort startup.
//! - **Recoverable**: [`Error::InvalidOpcode`], [`Error::IncompleteFrame`],
//!   [`Error::FrameTooLarge`], [`Error::Json`] and [`Error::InvalidRequest`]
//!   are dropped by the task that hit them, which then keeps going.
//! - **Peer failure**: [`Error::ConnectionClosed`] and [`Error::Io`] from a
//!   client socket lead to eviction of that client, never to a process error.
//! - **Partial I/O**: [`Error::WriteExhausted`] abandons a single send.
//!
//! # Examples
//!
//! ```
//! use wsrelay_core::{Error, Result};
//!
//! fn validate(handler: &str) -> Result<()> {
//!     if handler.is_empty() {
//!         return Err(Error::handler("handler name cannot be empty"));
//!     }
//!     Ok(())
//! }
//!
//! assert!(validate("chat").is_ok());
//! assert!(matches!(validate(""), Err(Error::Handler(_))));
//! ```

use std::fmt;
use thiserror::Error;

/// The main error type for wsrelay operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The listening socket could not be bound. Fatal at startup.
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// The pub/sub broker could not be reached when a connection was required.
    #[error("could not connect to broker at {addr}: {source}")]
    BrokerConnect {
        /// Broker address.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// I/O error on a socket.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A frame carried an opcode outside the protocol's set.
    #[error("invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    /// Fewer bytes were available than the frame header declares.
    #[error("incomplete frame")]
    IncompleteFrame,

    /// A frame declared a payload above the inbound limit.
    #[error("frame payload of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge {
        /// Declared payload length.
        size: u64,
        /// Configured limit.
        limit: u64,
    },

    /// The upgrade request header never terminated within the allowed size.
    #[error("request header exceeds {0} bytes")]
    HeaderTooLarge(usize),

    /// The peer closed the connection, or it was already torn down.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// A write could not be completed within the retry budget.
    #[error("write abandoned after {attempts} retries ({written}/{total} bytes written)")]
    WriteExhausted {
        /// Retries performed.
        attempts: u32,
        /// Bytes that did make it out.
        written: usize,
        /// Bytes requested.
        total: usize,
    },

    /// No handler is registered for a request envelope.
    #[error("handler [{0}] not found")]
    HandlerNotFound(String),

    /// A payload could not be read as a request envelope.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Handler execution error.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Type extractor error.
    #[error("Extractor error: {0}")]
    Extractor(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Custom application-defined error.
    #[error("Custom error: {0}")]
    Custom(String),
}

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a custom error with the given message.
    pub fn custom<T: fmt::Display>(msg: T) -> Self {
        Error::Custom(msg.to_string())
    }

    /// Creates a handler error with the given message.
    ///
    /// Use this from request handlers; the message is sent back to the caller
    /// as a best-effort error reply.
    pub fn handler<T: fmt::Display>(msg: T) -> Self {
        Error::Handler(msg.to_string())
    }

    /// Creates an extractor error with the given message.
    pub fn extractor<T: fmt::Display>(msg: T) -> Self {
        Error::Extractor(msg.to_string())
    }

    pub(crate) fn bind(addr: impl fmt::Display, source: std::io::Error) -> Self {
        Error::Bind {
            addr: addr.to_string(),
            source,
        }
    }

    /// Returns `true` for errors that should abort startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Bind { .. } | Error::BrokerConnect { .. } | Error::Config(_)
        )
    }

    /// Returns `true` when the error means the peer is gone.
    pub fn is_peer_failure(&self) -> bool {
        match self {
            Error::ConnectionClosed(_) => true,
            Error::Io(e) => !matches!(e.kind(), std::io::ErrorKind::WouldBlock),
            _ => false,
        }
    }
}
