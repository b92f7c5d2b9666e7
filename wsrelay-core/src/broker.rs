//! Redis-compatible pub/sub client.
//!
//! Two connections are kept: a subscriber, opened at startup, that all
//! channel subscriptions share, and a publisher that may be opened lazily on
//! first use. Commands are sent in the inline form:
//!
//! ```text
//! PUBLISH <channel> '<message>'\r\n
//! SUBSCRIBE <channel> \r\n
//! ```
//!
//! Only the parts of the RESP reply format needed to receive published
//! messages are understood; every other reply is read and discarded.

use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

const READ_CHUNK: usize = 4096;

/// What a connection is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerRole {
    /// Sends PUBLISH; its replies are discarded.
    Publisher,
    /// Sends SUBSCRIBE and receives pushed messages.
    Subscriber,
}

/// A message pushed by the broker on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Raw message body.
    pub payload: String,
}

/// Renders an inline PUBLISH command.
///
/// Single quotes inside the message are escaped so the broker reads the
/// whole message as one argument.
///
/// ```
/// use wsrelay_core::broker::publish_command;
///
/// assert_eq!(
///     publish_command("news", r#"{"id":1}"#),
///     "PUBLISH news '{\"id\":1}'\r\n"
/// );
/// ```
pub fn publish_command(channel: &str, message: &str) -> String {
    format!("PUBLISH {} '{}'\r\n", channel, message.replace('\'', "\\'"))
}

/// Renders an inline SUBSCRIBE command.
pub fn subscribe_command(channel: &str) -> String {
    format!("SUBSCRIBE {} \r\n", channel)
}

/// Parses one `message` push reply into `(channel, payload)`.
///
/// The reply must be a complete three-element multi-bulk reply (`*3`) whose
/// first element is `message`. Element boundaries come from the `$<len>`
/// markers, so a reply cut short inside its payload is incomplete, never an
/// empty message.
///
/// ```
/// use wsrelay_core::broker::parse_subscribe_reply;
///
/// let reply = "*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$2\r\n{}\r\n";
/// assert_eq!(
///     parse_subscribe_reply(reply),
///     Some(("news".to_string(), "{}".to_string()))
/// );
/// assert_eq!(parse_subscribe_reply("+OK\r\n"), None);
/// ```
pub fn parse_subscribe_reply(reply: &str) -> Option<(String, String)> {
    match parse_value(reply.as_bytes(), 0) {
        Parsed::Done(value, _) => value.into_message().map(|m| (m.channel, m.payload)),
        Parsed::Partial | Parsed::Malformed => None,
    }
}

/// Splits broker output into complete replies.
///
/// Returns the replies and the number of bytes they cover; a trailing
/// partial reply is left out. A line that is not valid reply syntax forms a
/// reply of its own.
pub fn split_replies(data: &[u8]) -> (Vec<&[u8]>, usize) {
    let mut replies = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let Some((_, end)) = next_reply(data, pos) else {
            break;
        };
        replies.push(&data[pos..end]);
        pos = end;
    }

    (replies, pos)
}

/// Returns `true` when a payload looks like a JSON object or array.
pub fn is_bracketed_json(payload: &str) -> bool {
    let payload = payload.trim();
    (payload.starts_with('{') && payload.ends_with('}'))
        || (payload.starts_with('[') && payload.ends_with(']'))
}

/// Largest bulk string the broker sends.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Largest multi-bulk element count accepted.
const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// One RESP value, as much of it as the subscriber needs.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RespValue {
    /// Status, error or integer line.
    Line,
    /// Bulk string; `None` for the null bulk string.
    Bulk(Option<Vec<u8>>),
    Array(Vec<RespValue>),
}

impl RespValue {
    fn into_message(self) -> Option<BrokerMessage> {
        let RespValue::Array(items) = self else {
            return None;
        };
        match items.as_slice() {
            [
                RespValue::Bulk(Some(kind)),
                RespValue::Bulk(Some(channel)),
                RespValue::Bulk(Some(payload)),
            ] if kind.as_slice() == b"message" => Some(BrokerMessage {
                channel: String::from_utf8_lossy(channel).into_owned(),
                payload: String::from_utf8_lossy(payload).into_owned(),
            }),
            _ => None,
        }
    }
}

enum Parsed {
    /// A whole value and the offset just past it.
    Done(RespValue, usize),
    /// More bytes are needed.
    Partial,
    Malformed,
}

fn line_end(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)
}

fn parse_len(digits: &[u8]) -> Option<i64> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Parses the value starting at `start`.
fn parse_value(data: &[u8], start: usize) -> Parsed {
    let Some(eol) = line_end(data, start) else {
        return Parsed::Partial;
    };
    if eol == start {
        return Parsed::Malformed;
    }
    let body = &data[start + 1..eol];
    let next = eol + 2;

    match data[start] {
        b'+' | b'-' | b':' => Parsed::Done(RespValue::Line, next),
        b'$' => match parse_len(body) {
            Some(-1) => Parsed::Done(RespValue::Bulk(None), next),
            Some(len @ 0..=MAX_BULK_LEN) => {
                let end = next + len as usize;
                if data.len() < end + 2 {
                    Parsed::Partial
                } else if &data[end..end + 2] != b"\r\n" {
                    Parsed::Malformed
                } else {
                    Parsed::Done(RespValue::Bulk(Some(data[next..end].to_vec())), end + 2)
                }
            }
            _ => Parsed::Malformed,
        },
        b'*' => match parse_len(body) {
            Some(-1) => Parsed::Done(RespValue::Array(Vec::new()), next),
            Some(count @ 0..=MAX_ARRAY_LEN) => {
                let mut items = Vec::new();
                let mut pos = next;
                for _ in 0..count {
                    match parse_value(data, pos) {
                        Parsed::Done(item, end) => {
                            items.push(item);
                            pos = end;
                        }
                        other => return other,
                    }
                }
                Parsed::Done(RespValue::Array(items), pos)
            }
            _ => Parsed::Malformed,
        },
        _ => Parsed::Malformed,
    }
}

/// The reply starting at `pos` and the offset just past it.
///
/// A malformed reply yields no value and covers only its first line, so the
/// next call picks up at the following line. `None` means the reply is not
/// complete yet.
fn next_reply(data: &[u8], pos: usize) -> Option<(Option<RespValue>, usize)> {
    match parse_value(data, pos) {
        Parsed::Done(value, end) => Some((Some(value), end)),
        Parsed::Partial => None,
        Parsed::Malformed => line_end(data, pos).map(|eol| (None, eol + 2)),
    }
}

/// Takes every complete push message out of `pending`.
///
/// A reply whose last bytes have not arrived yet stays buffered for the next
/// read. Other replies, such as subscribe confirmations, are dropped.
fn drain_messages(pending: &mut BytesMut) -> Vec<BrokerMessage> {
    let mut messages = Vec::new();
    let mut pos = 0;

    while pos < pending.len() {
        let Some((value, end)) = next_reply(&pending[..], pos) else {
            break;
        };
        let reply = &pending[pos..end];
        match value.map(RespValue::into_message) {
            Some(Some(message)) => messages.push(message),
            Some(None) => trace!(reply = %value_summary(reply), "ignoring broker reply"),
            None => debug!(line = %value_summary(reply), "malformed broker reply"),
        }
        pos = end;
    }

    pending.advance(pos);
    messages
}

fn value_summary(reply: &[u8]) -> String {
    let text = String::from_utf8_lossy(reply);
    text.trim_end().chars().take(80).collect()
}

async fn open(addr: &str) -> Result<TcpStream> {
    TcpStream::connect(addr)
        .await
        .map_err(|source| Error::BrokerConnect {
            addr: addr.to_string(),
            source,
        })
}

/// One TCP connection to the broker.
#[derive(Debug)]
pub struct BrokerConnection {
    addr: String,
    role: BrokerRole,
    stream: Mutex<Option<Arc<TcpStream>>>,
    pending: Mutex<BytesMut>,
}

impl BrokerConnection {
    /// Opens a connection now, or on first write when `lazy` is set.
    pub async fn new(addr: impl Into<String>, role: BrokerRole, lazy: bool) -> Result<Self> {
        if lazy {
            Ok(Self::lazy(addr, role))
        } else {
            Self::connect(addr, role).await
        }
    }

    /// Connects right away.
    pub async fn connect(addr: impl Into<String>, role: BrokerRole) -> Result<Self> {
        let conn = Self::lazy(addr, role);
        let stream = open(&conn.addr).await?;
        *conn.stream.lock() = Some(Arc::new(stream));
        Ok(conn)
    }

    /// Defers connecting to the first write.
    pub fn lazy(addr: impl Into<String>, role: BrokerRole) -> Self {
        Self {
            addr: addr.into(),
            role,
            stream: Mutex::new(None),
            pending: Mutex::new(BytesMut::new()),
        }
    }

    /// Broker address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Returns `true` while a socket is held.
    pub fn is_connected(&self) -> bool {
        self.stream.lock().is_some()
    }

    fn reset(&self) {
        self.stream.lock().take();
        self.pending.lock().clear();
    }

    /// Reads and drops whatever replies are waiting. Returns `false` if the
    /// broker has closed the connection.
    fn discard_replies(stream: &TcpStream) -> bool {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.try_read(&mut chunk) {
                Ok(0) => return false,
                Ok(n) => trace!(bytes = n, "discarded broker replies"),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(_) => return false,
            }
        }
    }

    async fn stream(&self) -> Result<Arc<TcpStream>> {
        let current = self.stream.lock().clone();
        if let Some(stream) = current {
            if self.role == BrokerRole::Subscriber || Self::discard_replies(&stream) {
                return Ok(stream);
            }
            warn!(addr = %self.addr, "broker connection lost, reconnecting");
            self.reset();
        }

        let stream = Arc::new(open(&self.addr).await?);
        debug!(addr = %self.addr, role = ?self.role, "broker connection opened");
        *self.stream.lock() = Some(stream.clone());
        Ok(stream)
    }

    /// Writes a command, connecting first when needed.
    ///
    /// Returns the number of bytes written. Write failures are logged and
    /// drop the socket so the next write reconnects; only a failed connect
    /// is returned as an error.
    pub async fn write(&self, command: &str) -> Result<usize> {
        let stream = self.stream().await?;
        let bytes = command.as_bytes();
        let mut written = 0;

        while written < bytes.len() {
            if let Err(e) = stream.writable().await {
                error!(addr = %self.addr, error = %e, "broker socket not writable");
                self.reset();
                break;
            }
            match stream.try_write(&bytes[written..]) {
                Ok(0) => {
                    error!(addr = %self.addr, "broker accepted no bytes");
                    self.reset();
                    break;
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => {
                    error!(addr = %self.addr, error = %e, "broker write failed");
                    self.reset();
                    break;
                }
            }
        }

        if written < bytes.len() {
            warn!(written, total = bytes.len(), "partial broker write");
        }
        Ok(written)
    }

    /// Waits up to `wait` for data and returns the push messages it completes.
    pub async fn read_messages(&self, wait: Duration) -> Result<Vec<BrokerMessage>> {
        let current = self.stream.lock().clone();
        let Some(stream) = current else {
            return Err(Error::ConnectionClosed(self.addr.clone()));
        };

        match tokio::time::timeout(wait, stream.readable()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(Err(e)) => {
                self.reset();
                return Err(e.into());
            }
            Ok(Ok(())) => {}
        }

        let mut chunk = vec![0u8; READ_CHUNK];
        match self.read_available(&mut chunk)? {
            0 => Ok(Vec::new()),
            n => {
                let mut pending = self.pending.lock();
                pending.extend_from_slice(&chunk[..n]);
                Ok(drain_messages(&mut pending))
            }
        }
    }

    /// Reads whatever bytes are pending without waiting.
    ///
    /// Returns `Ok(0)` when nothing is available; EOF is reported as
    /// [`Error::ConnectionClosed`] and drops the socket.
    pub fn read_available(&self, buf: &mut [u8]) -> Result<usize> {
        let current = self.stream.lock().clone();
        let Some(stream) = current else {
            return Err(Error::ConnectionClosed(self.addr.clone()));
        };

        match stream.try_read(buf) {
            Ok(0) => {
                self.reset();
                Err(Error::ConnectionClosed(self.addr.clone()))
            }
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => {
                self.reset();
                Err(e.into())
            }
        }
    }
}

/// Publisher and subscriber connections to one broker.
#[derive(Debug)]
pub struct Broker {
    publisher: BrokerConnection,
    subscriber: BrokerConnection,
}

impl Broker {
    /// Opens the subscriber connection, and the publisher unless it is lazy.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let addr = config.addr();
        let subscriber = BrokerConnection::new(addr.clone(), BrokerRole::Subscriber, false).await?;
        let publisher =
            BrokerConnection::new(addr.clone(), BrokerRole::Publisher, config.lazy_publisher).await?;

        info!(%addr, lazy_publisher = config.lazy_publisher, "connected to broker");
        Ok(Self {
            publisher,
            subscriber,
        })
    }

    /// Publishes a message. Returns the bytes written.
    pub async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        self.publisher
            .write(&publish_command(channel, message))
            .await
    }

    /// Subscribes the shared subscriber connection to a channel.
    pub async fn subscribe(&self, channel: &str) -> Result<usize> {
        self.subscriber.write(&subscribe_command(channel)).await
    }

    /// Reads pushed messages from the subscriber connection.
    pub async fn next_messages(&self, wait: Duration) -> Result<Vec<BrokerMessage>> {
        self.subscriber.read_messages(wait).await
    }

    /// Publisher connection.
    pub fn publisher(&self) -> &BrokerConnection {
        &self.publisher
    }

    /// Subscriber connection.
    pub fn subscriber(&self) -> &BrokerConnection {
        &self.subscriber
    }
}
