//! The cooperative tasks that drive one client.
//!
//! [`admit`] registers an accepted client and queues three tasks on the
//! scheduler:
//!
//! - **handshake** reads the request header, answers an upgrade request,
//!   records the caller's identity and announces the new online count;
//! - **listener** decodes inbound frames, answers pings, and dispatches
//!   request envelopes;
//! - **keepalive** pings the client when it has gone quiet.
//!
//! Each task holds a [`TaskGuard`]. When the last guard of a client drops,
//! the client is removed from the registry, its socket is shut down and the
//! online count is broadcast again. This happens exactly once per client,
//! whichever task ends last and however it ends.

use crate::client::{Client, ClientState};
use crate::dispatch::{error_reply, Request, RequestDispatcher};
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameBuffer, Opcode};
use crate::handshake;
use crate::messenger::Messenger;
use crate::scheduler::{suspend, Scheduler};
use bytes::Bytes;
use std::io::ErrorKind;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Largest request header accepted before the connection is dropped.
pub const MAX_HEADER_SIZE: usize = 16 * 1024;

const TASKS_PER_CLIENT: usize = 3;

/// Timing and sizing shared by every client's tasks.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Silence after which a ping is sent.
    pub ping_timeout: Duration,
    /// How long a listener waits for data per turn.
    pub read_poll: Duration,
    /// Bytes read per attempt.
    pub read_chunk: usize,
}

/// Everything a client's tasks need besides the client itself.
pub struct SessionContext {
    /// Fan-out and registry access.
    pub messenger: Arc<Messenger>,
    /// Application request handling.
    pub dispatcher: Arc<dyn RequestDispatcher>,
    /// Timings.
    pub settings: SessionSettings,
}

/// Registers a client and queues its tasks.
pub fn admit(client: Arc<Client>, ctx: &Arc<SessionContext>, scheduler: &Scheduler) {
    ctx.messenger.registry().insert(&client);
    client.set_state(ClientState::Handshaking);
    client.live_tasks.store(TASKS_PER_CLIENT, Ordering::SeqCst);

    let id = client.id().clone();
    scheduler.enqueue(
        format!("handshake:{id}"),
        handshake_task(TaskGuard::new(client.clone(), ctx.clone())),
    );
    scheduler.enqueue(
        format!("listen:{id}"),
        listen_task(TaskGuard::new(client.clone(), ctx.clone())),
    );
    scheduler.enqueue(
        format!("keepalive:{id}"),
        keepalive_task(TaskGuard::new(client, ctx.clone())),
    );
}

/// Keeps a client alive for the duration of one task.
pub struct TaskGuard {
    client: Arc<Client>,
    ctx: Arc<SessionContext>,
}

impl TaskGuard {
    fn new(client: Arc<Client>, ctx: Arc<SessionContext>) -> Self {
        Self { client, ctx }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.client.live_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
            teardown(&self.client, &self.ctx.messenger);
        }
    }
}

fn teardown(client: &Client, messenger: &Messenger) {
    messenger.registry().remove(client.id());
    if client.close() {
        info!(client = %client.id(), peer = %client.peer_addr(), "client disconnected");
    }
    messenger.broadcast_online_count();
}

/// Logs why a client is going away and evicts it.
fn drop_client(client: &Client, ctx: &SessionContext, error: &Error) {
    if error.is_peer_failure() {
        debug!(client = %client.id(), error = %error, "peer went away");
    } else {
        warn!(client = %client.id(), error = %error, "dropping client");
    }
    ctx.messenger.evict(client);
}

/// Reads until the blank line ending the request header.
///
/// Returns the bytes read and the offset just past the header, or `None`
/// when the client was evicted meanwhile.
async fn read_header(client: &Client) -> Result<Option<(Vec<u8>, usize)>> {
    let mut header = Vec::new();
    let mut chunk = vec![0u8; 1024];
    loop {
        if !client.is_open() {
            return Ok(None);
        }
        match client.socket().try_read(&mut chunk) {
            Ok(0) => return Err(Error::ConnectionClosed(client.id().clone())),
            Ok(n) => {
                header.extend_from_slice(&chunk[..n]);
                if let Some(end) = handshake::header_end(&header) {
                    return Ok(Some((header, end)));
                }
                if header.len() > MAX_HEADER_SIZE {
                    return Err(Error::HeaderTooLarge(MAX_HEADER_SIZE));
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => suspend().await,
            Err(e) => return Err(e.into()),
        }
    }
}

async fn handshake_task(guard: TaskGuard) {
    let TaskGuard { client, ctx } = &guard;

    let (header, end) = match read_header(client).await {
        Ok(Some(read)) => read,
        Ok(None) => return,
        Err(e) => {
            drop_client(client, ctx, &e);
            return;
        }
    };

    let text = String::from_utf8_lossy(&header[..end]).into_owned();
    if handshake::is_upgrade_request(&text) {
        if let Some(response) = handshake::response(&text) {
            if let Err(e) = client.send_raw(response.as_bytes()).await {
                drop_client(client, ctx, &e);
                return;
            }
        }
    } else {
        debug!(client = %client.id(), "connection without upgrade request");
    }

    client.set_identity(handshake::parse_identity(&text));
    client.stash_pending(&header[end..]);
    client.set_state(ClientState::Established);
    info!(
        client = %client.id(),
        peer = %client.peer_addr(),
        fingerprint = ?client.fingerprint(),
        "client connected"
    );
    ctx.messenger.broadcast_online_count();
}

/// Waits until the handshake is done. Returns `false` if the client went
/// away first.
async fn wait_established(client: &Client) -> bool {
    loop {
        match client.state() {
            ClientState::Connecting | ClientState::Handshaking => suspend().await,
            ClientState::Established => return true,
            ClientState::Closing | ClientState::Closed => return false,
        }
    }
}

async fn listen_task(guard: TaskGuard) {
    let TaskGuard { client, ctx } = &guard;
    if !wait_established(client).await {
        return;
    }

    let mut buffer = FrameBuffer::new();
    buffer.extend(&client.take_pending());
    let mut chunk = vec![0u8; ctx.settings.read_chunk];

    loop {
        loop {
            if !client.is_open() {
                return;
            }
            let frame = match buffer.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    debug!(client = %client.id(), error = %e, "dropping undecodable input");
                    break;
                }
            };
            if !handle_frame(client, ctx, frame).await {
                return;
            }
        }

        if let Err(e) = client.flush_queued() {
            drop_client(client, ctx, &e);
            return;
        }

        let read = match tokio::time::timeout(ctx.settings.read_poll, client.socket().readable()).await {
            Err(_) => Ok(0),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(())) => match client.socket().try_read(&mut chunk) {
                Ok(0) => Err(Error::ConnectionClosed(client.id().clone())),
                Ok(n) => Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
                Err(e) => Err(e.into()),
            },
        };
        match read {
            Ok(n) => buffer.extend(&chunk[..n]),
            Err(e) => {
                drop_client(client, ctx, &e);
                return;
            }
        }

        suspend().await;
    }
}

/// Handles one inbound frame. Returns `false` once the client is done.
async fn handle_frame(client: &Arc<Client>, ctx: &SessionContext, frame: Frame) -> bool {
    match frame.opcode {
        Opcode::Pong => {
            trace!(client = %client.id(), "pong");
            client.record_pong();
        }
        Opcode::Ping => {
            if let Err(e) = client.send_frame(&Frame::pong(frame.payload)).await {
                debug!(client = %client.id(), error = %e, "failed to answer ping");
            }
        }
        Opcode::Close => {
            debug!(client = %client.id(), "close frame received");
            ctx.messenger.evict(client);
            return false;
        }
        Opcode::Text | Opcode::Binary | Opcode::Continuation => {
            if !frame.payload.is_empty() {
                handle_request(client, ctx, &frame.payload).await;
            }
        }
    }
    true
}

async fn handle_request(client: &Arc<Client>, ctx: &SessionContext, payload: &Bytes) {
    let request = match Request::from_slice(payload) {
        Ok(request) => request,
        Err(e) => {
            debug!(client = %client.id(), error = %e, "ignoring non-request payload");
            return;
        }
    };

    let handler = request.handler.clone();
    let reply = match ctx.dispatcher.dispatch(request, client.caller()).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(client = %client.id(), handler = %handler, error = %e, "request failed");
            error_reply(&e)
        }
    };

    if let Some((bytes, opcode)) = reply.into_payload() {
        if let Err(e) = client.reply(bytes, opcode).await {
            warn!(client = %client.id(), error = %e, "failed to send reply");
        }
    }
}

async fn keepalive_task(guard: TaskGuard) {
    let TaskGuard { client, ctx } = &guard;
    if !wait_established(client).await {
        return;
    }

    loop {
        if !client.is_open() || !ctx.messenger.registry().contains(client.id()) {
            return;
        }
        if let Err(e) = client.keepalive_tick(ctx.settings.ping_timeout) {
            drop_client(client, ctx, &e);
            return;
        }
        suspend().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DEFAULT_MAX_FRAME_SIZE;
    use crate::dispatch::{Caller, Reply};
    use crate::registry::ClientRegistry;
    use crate::test_util::{read_frames, socket_pair};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Echo;

    #[async_trait]
    impl RequestDispatcher for Echo {
        async fn dispatch(&self, request: Request, caller: Caller) -> Result<Reply> {
            if request.handler == "fail" {
                return Err(crate::Error::handler("bad"));
            }
            Reply::json(&json!({"from": caller.identity.fingerprint, "payload": request.payload}))
        }
    }

    fn context(registry: Arc<ClientRegistry>) -> Arc<SessionContext> {
        Arc::new(SessionContext {
            messenger: Arc::new(Messenger::new(registry, None, Duration::from_millis(20))),
            dispatcher: Arc::new(Echo),
            settings: SessionSettings {
                ping_timeout: Duration::from_secs(10),
                read_poll: Duration::from_millis(5),
                read_chunk: 4096,
            },
        })
    }

    async fn accepted_client() -> (Arc<Client>, tokio::net::TcpStream) {
        let (server, peer) = socket_pair().await;
        let addr = server.peer_addr().unwrap();
        (Client::new(server, addr, DEFAULT_MAX_FRAME_SIZE), peer)
    }

    /// Flushes the scheduler until `done` holds or the attempts run out.
    async fn drive(scheduler: &Scheduler, mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            scheduler.flush();
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn masked(opcode: u8, payload: &[u8]) -> Vec<u8> {
        let key = [1u8, 2, 3, 4];
        let mut out = vec![0x80 | opcode];
        assert!(payload.len() < 126);
        out.push(0x80 | payload.len() as u8);
        out.extend_from_slice(&key);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        out
    }

    const UPGRADE: &str = "GET /?fingerprint=fp1 HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";

    #[tokio::test]
    async fn test_handshake_then_request_reply() {
        let registry = Arc::new(ClientRegistry::new());
        let ctx = context(registry.clone());
        let scheduler = Scheduler::new();
        let (client, mut peer) = accepted_client().await;

        admit(client.clone(), &ctx, &scheduler);
        assert_eq!(scheduler.len(), 3);
        assert!(registry.contains(client.id()));

        peer.write_all(UPGRADE.as_bytes()).await.unwrap();
        drive(&scheduler, || client.is_established()).await;
        assert_eq!(client.fingerprint().as_deref(), Some("fp1"));

        let mut response = vec![0u8; 512];
        let n = tokio::time::timeout(Duration::from_secs(1), peer.read(&mut response))
            .await
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&response[..n]).into_owned();
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        peer.write_all(&masked(0x1, br#"{"handler":"echo","n":1}"#)).await.unwrap();

        let mut buffer = FrameBuffer::new();
        if let Some(rest) = text.find("\r\n\r\n").map(|i| &response[i + 4..n]) {
            buffer.extend(rest);
        }
        let mut frames = Vec::new();
        drive(&scheduler, || {
            while let Ok(Some(frame)) = buffer.next_frame() {
                frames.push(frame);
            }
            let mut chunk = [0u8; 4096];
            if let Ok(n) = peer.try_read(&mut chunk) {
                buffer.extend(&chunk[..n]);
            }
            frames.iter().any(|f: &Frame| f.as_text().is_some_and(|t| t.contains("payload")))
        })
        .await;

        let reply: Value = frames
            .iter()
            .filter_map(|f| serde_json::from_slice(&f.payload).ok())
            .find(|v: &Value| v.get("payload").is_some())
            .unwrap();
        assert_eq!(reply, json!({"from": "fp1", "payload": {"n": 1}}));
    }

    #[tokio::test]
    async fn test_disconnect_broadcasts_once() {
        let registry = Arc::new(ClientRegistry::new());
        let ctx = context(registry.clone());
        let scheduler = Scheduler::new();

        let (observer, mut observer_peer) = accepted_client().await;
        let (leaver, mut leaver_peer) = accepted_client().await;
        admit(observer.clone(), &ctx, &scheduler);
        admit(leaver.clone(), &ctx, &scheduler);

        observer_peer.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        leaver_peer.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        drive(&scheduler, || observer.is_established() && leaver.is_established()).await;

        let mut buffer = FrameBuffer::new();
        read_frames(&mut observer_peer, &mut buffer, Duration::from_millis(50)).await;

        drop(leaver_peer);
        drive(&scheduler, || leaver.state() == ClientState::Closed).await;
        // Only the observer's listener and keepalive remain.
        assert_eq!(scheduler.len(), 2);
        assert!(!registry.contains(leaver.id()));

        let frames = read_frames(&mut observer_peer, &mut buffer, Duration::from_millis(100)).await;
        let states: Vec<Value> = frames
            .iter()
            .map(|f| serde_json::from_slice(&f.payload).unwrap())
            .collect();
        assert_eq!(
            states,
            vec![json!({"channel": "state", "message": {"num_clients": 1, "num_online": 1}})]
        );
    }

    #[tokio::test]
    async fn test_close_frame_evicts() {
        let registry = Arc::new(ClientRegistry::new());
        let ctx = context(registry.clone());
        let scheduler = Scheduler::new();
        let (client, mut peer) = accepted_client().await;
        admit(client.clone(), &ctx, &scheduler);

        peer.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        peer.write_all(&masked(0x8, b"")).await.unwrap();
        drive(&scheduler, || client.state() == ClientState::Closed).await;

        assert_eq!(client.state(), ClientState::Closed);
        assert!(registry.is_empty());
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn test_ping_is_answered_and_pong_recorded() {
        let registry = Arc::new(ClientRegistry::new());
        let ctx = context(registry.clone());
        let scheduler = Scheduler::new();
        let (client, mut peer) = accepted_client().await;
        admit(client.clone(), &ctx, &scheduler);

        peer.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        drive(&scheduler, || client.is_established()).await;

        let mut buffer = FrameBuffer::new();
        read_frames(&mut peer, &mut buffer, Duration::from_millis(50)).await;

        let before = client.last_pong_received_at();
        peer.write_all(&masked(0x9, b"hb")).await.unwrap();
        peer.write_all(&masked(0xA, b"")).await.unwrap();

        let mut frames = Vec::new();
        drive(&scheduler, || {
            let mut chunk = [0u8; 256];
            if let Ok(n) = peer.try_read(&mut chunk) {
                buffer.extend(&chunk[..n]);
            }
            while let Ok(Some(frame)) = buffer.next_frame() {
                frames.push(frame);
            }
            !frames.is_empty() && client.last_pong_received_at() > before
        })
        .await;

        assert_eq!(frames[0].opcode, Opcode::Pong);
        assert!(client.last_pong_received_at() > before);
    }

    #[tokio::test]
    async fn test_failed_dispatch_replies_with_error_text() {
        let registry = Arc::new(ClientRegistry::new());
        let ctx = context(registry.clone());
        let scheduler = Scheduler::new();
        let (client, mut peer) = accepted_client().await;
        admit(client.clone(), &ctx, &scheduler);

        peer.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        drive(&scheduler, || client.is_established()).await;
        let mut buffer = FrameBuffer::new();
        read_frames(&mut peer, &mut buffer, Duration::from_millis(50)).await;

        peer.write_all(&masked(0x1, br#"{"handler":"fail"}"#)).await.unwrap();
        let mut frames = Vec::new();
        drive(&scheduler, || {
            let mut chunk = [0u8; 256];
            if let Ok(n) = peer.try_read(&mut chunk) {
                buffer.extend(&chunk[..n]);
            }
            while let Ok(Some(frame)) = buffer.next_frame() {
                frames.push(frame);
            }
            !frames.is_empty()
        })
        .await;

        assert_eq!(frames[0].as_text(), Some("Error: Handler error: bad"));
        assert!(client.is_established());
    }

    #[tokio::test]
    async fn test_oversized_header_is_rejected() {
        let (client, mut peer) = accepted_client().await;
        client.set_state(ClientState::Handshaking);

        let flood = vec![b'a'; MAX_HEADER_SIZE + 1024];
        let (written, read) = tokio::join!(peer.write_all(&flood), read_header(&client));
        written.unwrap();
        let err = read.unwrap_err();
        assert!(matches!(err, Error::HeaderTooLarge(MAX_HEADER_SIZE)));
        assert!(!err.is_peer_failure());
    }

    #[tokio::test]
    async fn test_oversized_header_evicts() {
        let registry = Arc::new(ClientRegistry::new());
        let ctx = context(registry.clone());
        let scheduler = Scheduler::new();
        let (client, mut peer) = accepted_client().await;
        admit(client.clone(), &ctx, &scheduler);

        peer.write_all(&vec![b'a'; MAX_HEADER_SIZE + 1024]).await.unwrap();
        drive(&scheduler, || client.state() == ClientState::Closed).await;

        assert_eq!(client.state(), ClientState::Closed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_eof_during_handshake_is_peer_failure() {
        let (client, peer) = accepted_client().await;
        client.set_state(ClientState::Handshaking);
        drop(peer);

        let err = read_header(&client).await.unwrap_err();
        assert!(err.is_peer_failure());
    }

    #[tokio::test]
    async fn test_listener_flushes_queued_broadcasts() {
        let registry = Arc::new(ClientRegistry::new());
        let ctx = context(registry.clone());
        let scheduler = Scheduler::new();
        let (client, mut peer) = accepted_client().await;
        admit(client.clone(), &ctx, &scheduler);

        peer.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        drive(&scheduler, || client.is_established()).await;
        let mut buffer = FrameBuffer::new();
        read_frames(&mut peer, &mut buffer, Duration::from_millis(50)).await;

        {
            let _writer = client.hold_writer().unwrap();
            let report = ctx.messenger.broadcast("live_streams", r#"{"n":1}"#);
            assert_eq!(report.queued, 1);
        }
        assert_eq!(client.queued_len(), 1);

        drive(&scheduler, || client.queued_len() == 0).await;
        let frames = read_frames(&mut peer, &mut buffer, Duration::from_millis(100)).await;
        let messages: Vec<Value> = frames
            .iter()
            .map(|f| serde_json::from_slice(&f.payload).unwrap())
            .collect();
        assert_eq!(messages, vec![json!({"channel": "live_streams", "message": {"n": 1}})]);
    }
}
