//! Socket helpers shared by unit tests.

use crate::client::{Client, ClientState, DEFAULT_MAX_FRAME_SIZE};
use crate::frame::{Frame, FrameBuffer};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

/// Returns a connected `(server side, peer side)` pair on loopback.
pub(crate) async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (peer, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (accepted.unwrap().0, peer.unwrap())
}

/// Builds an established client and returns it with the peer socket.
pub(crate) async fn established_client() -> (Arc<Client>, TcpStream) {
    let (server, peer) = socket_pair().await;
    let addr = server.peer_addr().unwrap();
    let client = Client::new(server, addr, DEFAULT_MAX_FRAME_SIZE);
    client.set_state(ClientState::Established);
    client.socket().writable().await.unwrap();
    (client, peer)
}

/// Reads frames until nothing arrives for `idle`.
pub(crate) async fn read_frames(
    peer: &mut TcpStream,
    buffer: &mut FrameBuffer,
    idle: Duration,
) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut chunk = vec![0u8; 64 * 1024];

    loop {
        while let Some(frame) = buffer.next_frame().unwrap() {
            frames.push(frame);
        }
        match tokio::time::timeout(idle, peer.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => return frames,
            Ok(Ok(n)) => buffer.extend(&chunk[..n]),
            Ok(Err(e)) => panic!("peer read failed: {e}"),
        }
    }
}
