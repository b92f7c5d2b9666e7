//! Per-connection state.
//!
//! A [`Client`] owns one accepted socket together with the caller's identity,
//! liveness timestamps and lifecycle state. Its three cooperative tasks live
//! in [`session`](crate::session); this module only holds the state and the
//! socket operations those tasks build on.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting ──► Handshaking ──► Established ──► Closing ──► Closed
//!                     │                              ▲
//!                     └──────── (EOF / error) ───────┘
//! ```
//!
//! `Closing` is entered on eviction; `Closed` only once every task of the
//! client has returned, at which point the socket is shut down.
//!
//! # Writes
//!
//! Outbound writes are serialized through a per-client writer lock so frames
//! never interleave on the wire. Replies wait for the lock. Pings use
//! [`Client::send_now`], which gives up when the writer is busy. Broadcasts use
//! [`Client::send_or_queue`]: a frame that cannot go out right away waits in
//! a small per-client queue that the next writer drains before its own data.

use crate::error::{Error, Result};
use crate::frame::{Frame, Opcode};
use crate::handshake::Identity;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Default outbound fragmentation threshold (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1_048_576;

/// Bytes reserved for the extended length header of a large frame.
const EXTENDED_HEADER_RESERVE: usize = 2;

/// Retries for a short write before a send is abandoned.
pub const MAX_WRITE_RETRIES: u32 = 5;

/// Pause between write retries.
pub const WRITE_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Frames a client may have waiting behind a busy writer. Past this the
/// oldest is dropped.
pub const MAX_QUEUED_FRAMES: usize = 1024;

/// A unique identifier for a client.
///
/// Ids are generated on accept and never reused within a process.
pub type ClientId = String;

fn next_client_id() -> ClientId {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!("client_{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Lifecycle state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    /// Accepted, tasks not yet started.
    Connecting,
    /// Waiting for the request header.
    Handshaking,
    /// Handshake done, frames flow.
    Established,
    /// Evicted; tasks are winding down.
    Closing,
    /// Socket shut down.
    Closed,
}

/// Outcome of a non-waiting send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The whole frame was written.
    Sent,
    /// Nothing was written: the writer is busy or the socket buffer is full.
    Busy,
    /// The frame is waiting in the client's queue behind earlier writes.
    Queued,
}

/// Outcome of one keepalive check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveTick {
    /// No ping was due.
    Idle,
    /// A ping went out.
    Sent,
    /// A ping was due but the socket could not take it right now.
    Deferred,
}

/// Snapshot of a client handed to request handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Caller {
    /// Connection id.
    pub id: ClientId,
    /// Peer socket address.
    pub peer_addr: SocketAddr,
    /// Identity parsed from the connection URL.
    pub identity: Identity,
}

/// One accepted connection.
pub struct Client {
    id: ClientId,
    peer_addr: SocketAddr,
    socket: TcpStream,
    state: Mutex<ClientState>,
    identity: Mutex<Identity>,
    last_ping_sent_at: Mutex<Instant>,
    last_pong_received_at: Mutex<Instant>,
    max_frame_size: usize,
    writer: tokio::sync::Mutex<()>,
    queued: Mutex<VecDeque<Bytes>>,
    pending: Mutex<Vec<u8>>,
    pub(crate) live_tasks: AtomicUsize,
}

impl Client {
    /// Wraps an accepted socket.
    pub fn new(socket: TcpStream, peer_addr: SocketAddr, max_frame_size: usize) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            id: next_client_id(),
            peer_addr,
            socket,
            state: Mutex::new(ClientState::Connecting),
            identity: Mutex::new(Identity::default()),
            last_ping_sent_at: Mutex::new(now),
            last_pong_received_at: Mutex::new(now),
            max_frame_size,
            writer: tokio::sync::Mutex::new(()),
            queued: Mutex::new(VecDeque::new()),
            pending: Mutex::new(Vec::new()),
            live_tasks: AtomicUsize::new(0),
        })
    }

    /// Connection id.
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Peer socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Underlying socket.
    pub fn socket(&self) -> &TcpStream {
        &self.socket
    }

    /// Outbound fragmentation threshold.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, next: ClientState) {
        let mut state = self.state.lock();
        // Never move backwards out of teardown.
        if *state < ClientState::Closing {
            *state = next;
        }
    }

    /// Returns `true` until the client is evicted.
    pub fn is_open(&self) -> bool {
        self.state() < ClientState::Closing
    }

    /// Returns `true` once the handshake completed and before eviction.
    pub fn is_established(&self) -> bool {
        self.state() == ClientState::Established
    }

    /// Moves the client to `Closing`. Returns `false` if it already was.
    pub(crate) fn begin_closing(&self) -> bool {
        let mut state = self.state.lock();
        if *state >= ClientState::Closing {
            return false;
        }
        *state = ClientState::Closing;
        true
    }

    /// Shuts the socket down. Only the first call has an effect.
    pub(crate) fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == ClientState::Closed {
                return false;
            }
            *state = ClientState::Closed;
        }
        if let Err(e) = socket2::SockRef::from(&self.socket).shutdown(Shutdown::Both) {
            // The peer may already be gone; the descriptor is released on drop.
            debug!(client = %self.id, error = %e, "socket shutdown failed");
        }
        true
    }

    /// Identity parsed during the handshake.
    pub fn identity(&self) -> Identity {
        self.identity.lock().clone()
    }

    /// Fingerprint used for unique-visitor counting.
    pub fn fingerprint(&self) -> Option<String> {
        self.identity.lock().fingerprint.clone()
    }

    pub(crate) fn set_identity(&self, identity: Identity) {
        *self.identity.lock() = identity;
    }

    /// Snapshot for request handlers.
    pub fn caller(&self) -> Caller {
        Caller {
            id: self.id.clone(),
            peer_addr: self.peer_addr,
            identity: self.identity(),
        }
    }

    pub(crate) fn stash_pending(&self, bytes: &[u8]) {
        self.pending.lock().extend_from_slice(bytes);
    }

    pub(crate) fn take_pending(&self) -> Vec<u8> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// When the last ping went out.
    pub fn last_ping_sent_at(&self) -> Instant {
        *self.last_ping_sent_at.lock()
    }

    /// When the last pong arrived.
    pub fn last_pong_received_at(&self) -> Instant {
        *self.last_pong_received_at.lock()
    }

    pub(crate) fn record_pong(&self) {
        *self.last_pong_received_at.lock() = Instant::now();
    }

    #[cfg(test)]
    pub(crate) fn backdate_liveness(&self, pong_age: Duration, ping_age: Duration) {
        let now = Instant::now();
        *self.last_pong_received_at.lock() = now.checked_sub(pong_age).unwrap_or(now);
        *self.last_ping_sent_at.lock() = now.checked_sub(ping_age).unwrap_or(now);
    }

    /// Whether a ping is due: no pong for `ping_timeout` and no ping for
    /// more than half of it.
    pub fn keepalive_due(&self, now: Instant, ping_timeout: Duration) -> bool {
        let since_pong = now.saturating_duration_since(self.last_pong_received_at());
        let since_ping = now.saturating_duration_since(self.last_ping_sent_at());
        since_pong >= ping_timeout && since_ping > ping_timeout / 2
    }

    /// Sends a ping when one is due.
    ///
    /// An error means the client is unreachable and must be evicted.
    pub fn keepalive_tick(&self, ping_timeout: Duration) -> Result<KeepaliveTick> {
        let now = Instant::now();
        if !self.keepalive_due(now, ping_timeout) {
            return Ok(KeepaliveTick::Idle);
        }

        match self.send_now(&Frame::ping().encode())? {
            SendOutcome::Sent => {
                *self.last_ping_sent_at.lock() = now;
                Ok(KeepaliveTick::Sent)
            }
            SendOutcome::Busy | SendOutcome::Queued => Ok(KeepaliveTick::Deferred),
        }
    }

    /// Writes an encoded frame without waiting.
    ///
    /// Returns [`SendOutcome::Busy`] when another write holds the writer or
    /// the socket takes no bytes. Frames queued by earlier broadcasts go out
    /// first. A frame cut off halfway leaves the stream unusable and is
    /// reported as an error.
    pub fn send_now(&self, bytes: &[u8]) -> Result<SendOutcome> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed(self.id.clone()));
        }
        let Ok(_writer) = self.writer.try_lock() else {
            return Ok(SendOutcome::Busy);
        };

        if self.write_queued_now()? == SendOutcome::Queued {
            return Ok(SendOutcome::Busy);
        }
        if self.try_write_frame(bytes)? {
            Ok(SendOutcome::Sent)
        } else {
            Ok(SendOutcome::Busy)
        }
    }

    /// Writes an encoded frame now, or queues it for the next writer.
    ///
    /// Unlike [`send_now`](Self::send_now) the frame is never dropped while
    /// the client stays open, unless more than [`MAX_QUEUED_FRAMES`] pile up.
    pub fn send_or_queue(&self, bytes: Bytes) -> Result<SendOutcome> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed(self.id.clone()));
        }
        self.enqueue(bytes);

        match self.writer.try_lock() {
            Ok(_writer) => self.write_queued_now(),
            Err(_) => Ok(SendOutcome::Queued),
        }
    }

    /// Writes queued frames if the writer is free. Returns how many are
    /// still waiting.
    pub fn flush_queued(&self) -> Result<usize> {
        if let Ok(_writer) = self.writer.try_lock() {
            self.write_queued_now()?;
        }
        Ok(self.queued_len())
    }

    #[cfg(test)]
    pub(crate) fn hold_writer(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        self.writer.try_lock().ok()
    }

    /// Frames waiting behind the writer.
    pub fn queued_len(&self) -> usize {
        self.queued.lock().len()
    }

    fn enqueue(&self, bytes: Bytes) {
        let mut queued = self.queued.lock();
        if queued.len() == MAX_QUEUED_FRAMES {
            queued.pop_front();
            warn!(client = %self.id, "outbound queue full, dropping oldest frame");
        }
        queued.push_back(bytes);
    }

    fn pop_queued(&self) -> Option<Bytes> {
        self.queued.lock().pop_front()
    }

    /// Writes queued frames until the queue is empty or the socket is full.
    ///
    /// Callers must hold the writer lock.
    fn write_queued_now(&self) -> Result<SendOutcome> {
        while let Some(bytes) = self.pop_queued() {
            if !self.try_write_frame(&bytes)? {
                self.queued.lock().push_front(bytes);
                return Ok(SendOutcome::Queued);
            }
        }
        Ok(SendOutcome::Sent)
    }

    /// Writes a whole frame without waiting. `Ok(false)` means the socket
    /// took nothing.
    fn try_write_frame(&self, bytes: &[u8]) -> Result<bool> {
        let mut written = 0;
        while written < bytes.len() {
            match self.socket.try_write(&bytes[written..]) {
                Ok(0) => return Err(Error::ConnectionClosed(self.id.clone())),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock && written == 0 => return Ok(false),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return Err(Error::WriteExhausted {
                        attempts: 0,
                        written,
                        total: bytes.len(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Writes raw bytes (the handshake response) under the writer lock.
    pub(crate) async fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.write_with_retry(bytes).await
    }

    /// Writes a single frame under the writer lock.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.write_with_retry(&frame.encode()).await?;
        self.write_queued().await
    }

    /// Sends a reply payload, fragmenting it when it exceeds the frame size.
    pub async fn reply(&self, payload: Bytes, opcode: Opcode) -> Result<()> {
        let frames = outbound_frames(payload, opcode, self.max_frame_size);
        if frames.len() > 1 {
            debug!(client = %self.id, frames = frames.len(), "streaming reply");
        }

        let _writer = self.writer.lock().await;
        for frame in &frames {
            self.write_with_retry(&frame.encode()).await?;
        }
        self.write_queued().await
    }

    /// Writes everything queued behind the current writer.
    ///
    /// Callers must hold the writer lock.
    async fn write_queued(&self) -> Result<()> {
        while let Some(bytes) = self.pop_queued() {
            self.write_with_retry(&bytes).await?;
        }
        Ok(())
    }

    /// Writes all of `bytes`, retrying short writes with a fixed backoff.
    ///
    /// Callers must hold the writer lock.
    async fn write_with_retry(&self, bytes: &[u8]) -> Result<()> {
        let mut written = 0;
        let mut attempts = 0;

        loop {
            if !self.is_open() {
                return Err(Error::ConnectionClosed(self.id.clone()));
            }

            match self.socket.try_write(&bytes[written..]) {
                Ok(0) => return Err(Error::ConnectionClosed(self.id.clone())),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }

            if written == bytes.len() {
                return Ok(());
            }
            if attempts == MAX_WRITE_RETRIES {
                warn!(client = %self.id, written, total = bytes.len(), "giving up on write");
                return Err(Error::WriteExhausted {
                    attempts,
                    written,
                    total: bytes.len(),
                });
            }
            attempts += 1;
            tokio::time::sleep(WRITE_RETRY_BACKOFF).await;
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Splits a reply into the frames that carry it.
///
/// A payload that fits in `max_frame_size` (less two bytes once it needs an
/// extended length) goes out as one frame. Anything larger is cut into
/// chunks of `max_frame_size - 2` bytes: the first carries the data opcode,
/// the rest are CONTINUATION, and only the last one has FIN set.
pub fn outbound_frames(payload: Bytes, opcode: Opcode, max_frame_size: usize) -> Vec<Frame> {
    let lead = if opcode == Opcode::Binary {
        Opcode::Binary
    } else {
        Opcode::Text
    };

    let mut limit = max_frame_size;
    if payload.len() > 125 {
        limit = limit.saturating_sub(EXTENDED_HEADER_RESERVE);
    }
    if payload.len() <= limit {
        return vec![Frame::new(lead, payload)];
    }

    let chunk = max_frame_size.saturating_sub(EXTENDED_HEADER_RESERVE).max(1);
    let total = payload.len();
    let mut frames = Vec::with_capacity(total.div_ceil(chunk));
    let mut offset = 0;

    while offset < total {
        let end = (offset + chunk).min(total);
        let opcode = if offset == 0 { lead } else { Opcode::Continuation };
        let piece = payload.slice(offset..end);
        frames.push(if end == total {
            Frame::new(opcode, piece)
        } else {
            Frame::fragment(opcode, piece)
        });
        offset = end;
    }

    frames
}
