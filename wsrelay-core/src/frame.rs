//! Wire framing: opcodes, frame encoding and decoding.
//!
//! Frames follow the WebSocket base framing layout:
//!
//! ```text
//!  0               1               2               3
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |     Masking-key (0 or 4 bytes, client frames only)            |
//! +---------------------------------------------------------------+
//! |                         Payload Data                          |
//! +---------------------------------------------------------------+
//! ```
//!
//! Server frames are never masked. Multi-byte lengths are big-endian.
//!
//! # Examples
//!
//! ```
//! use wsrelay_core::frame::{self, Opcode};
//!
//! let wire = frame::encode(b"hello", Opcode::Text);
//! assert_eq!(&wire[..2], &[0x81, 5]);
//!
//! let decoded = frame::decode(&wire).unwrap().unwrap();
//! assert!(decoded.fin);
//! assert_eq!(decoded.opcode, Opcode::Text);
//! assert_eq!(&decoded.payload[..], b"hello");
//! ```

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Payloads up to this size are sent as TEXT without streaming.
pub const TEXT_FRAME_LIMIT: usize = 1024 * 1024;

/// Largest payload accepted from a client frame.
pub const MAX_INBOUND_PAYLOAD: u64 = 16 * 1024 * 1024;

const FIN_BIT: u8 = 0b1000_0000;
const MASK_BIT: u8 = 0b1000_0000;
const OPCODE_MASK: u8 = 0b0000_1111;
const LENGTH_MASK: u8 = 0b0111_1111;

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Continuation of a fragmented message.
    Continuation,
    /// UTF-8 text.
    Text,
    /// Arbitrary bytes.
    Binary,
    /// Connection close.
    Close,
    /// Liveness check.
    Ping,
    /// Liveness answer.
    Pong,
}

impl Opcode {
    /// Parses the low nibble of a frame's first byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(Error::InvalidOpcode(other)),
        }
    }

    /// Wire value of this opcode.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    /// Picks the opcode for an outbound reply payload.
    ///
    /// Valid UTF-8 up to [`TEXT_FRAME_LIMIT`] is TEXT, larger UTF-8 is
    /// CONTINUATION (it has to be streamed), anything else is BINARY.
    ///
    /// ```
    /// use wsrelay_core::frame::Opcode;
    ///
    /// assert_eq!(Opcode::infer(b"{\"ok\":true}"), Opcode::Text);
    /// assert_eq!(Opcode::infer(&[0xff, 0xfe]), Opcode::Binary);
    /// ```
    pub fn infer(payload: &[u8]) -> Self {
        if std::str::from_utf8(payload).is_err() {
            Self::Binary
        } else if payload.len() > TEXT_FRAME_LIMIT {
            Self::Continuation
        } else {
            Self::Text
        }
    }
}

/// One unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Last fragment of a logical message.
    pub fin: bool,
    /// Frame type.
    pub opcode: Opcode,
    /// Unmasked payload.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a final (FIN=1) frame.
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    /// Creates a non-final fragment.
    pub fn fragment(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: false,
            opcode,
            payload: payload.into(),
        }
    }

    /// Creates an empty PING frame.
    pub fn ping() -> Self {
        Self::new(Opcode::Ping, Bytes::new())
    }

    /// Creates a PONG frame echoing `payload`.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// Payload as UTF-8, if it is valid.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Serializes the frame, unmasked, honoring its own FIN bit.
    pub fn encode(&self) -> Bytes {
        let len = self.payload.len();
        let mut out = BytesMut::with_capacity(len + 10);

        let first = if self.fin { FIN_BIT } else { 0 } | self.opcode.as_u8();
        out.put_u8(first);

        if len <= 125 {
            out.put_u8(len as u8);
        } else if len <= u16::MAX as usize {
            out.put_u8(126);
            out.put_u16(len as u16);
        } else {
            out.put_u8(127);
            out.put_u64(len as u64);
        }

        out.extend_from_slice(&self.payload);
        out.freeze()
    }
}

/// Encodes `message` as a single final, unmasked frame.
pub fn encode(message: &[u8], opcode: Opcode) -> Bytes {
    Frame::new(opcode, Bytes::copy_from_slice(message)).encode()
}

/// Decodes the first frame in `data`.
///
/// Returns `Ok(None)` for empty input. Trailing bytes past the first frame
/// are ignored; use [`FrameBuffer`] to walk a stream.
pub fn decode(data: &[u8]) -> Result<Option<Frame>> {
    if data.is_empty() {
        return Ok(None);
    }
    match parse(data, u64::MAX)? {
        Some((frame, _)) => Ok(Some(frame)),
        None => Err(Error::IncompleteFrame),
    }
}

/// Parses one frame from the front of `data`.
///
/// `Ok(None)` means more bytes are needed. On success returns the frame and
/// the number of bytes it occupied.
fn parse(data: &[u8], limit: u64) -> Result<Option<(Frame, usize)>> {
    if data.len() < 2 {
        return Ok(None);
    }

    let mut cursor = data;
    let first = cursor.get_u8();
    let second = cursor.get_u8();

    let fin = first & FIN_BIT != 0;
    let opcode = Opcode::from_u8(first & OPCODE_MASK)?;
    let masked = second & MASK_BIT != 0;

    let declared = match second & LENGTH_MASK {
        126 => {
            if cursor.remaining() < 2 {
                return Ok(None);
            }
            cursor.get_u16() as u64
        }
        127 => {
            if cursor.remaining() < 8 {
                return Ok(None);
            }
            cursor.get_u64()
        }
        n => n as u64,
    };

    if declared > limit {
        return Err(Error::FrameTooLarge {
            size: declared,
            limit,
        });
    }

    let mask = if masked {
        if cursor.remaining() < 4 {
            return Ok(None);
        }
        let mut key = [0u8; 4];
        cursor.copy_to_slice(&mut key);
        Some(key)
    } else {
        None
    };

    let Ok(len) = usize::try_from(declared) else {
        return Err(Error::FrameTooLarge {
            size: declared,
            limit,
        });
    };
    if cursor.remaining() < len {
        return Ok(None);
    }

    let header_len = data.len() - cursor.remaining();

    // PONG carries no payload we care about; consume it and hand back nothing.
    let payload = if opcode == Opcode::Pong {
        Bytes::new()
    } else {
        let mut payload = BytesMut::from(&cursor[..len]);
        if let Some(key) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }
        payload.freeze()
    };

    Ok(Some((
        Frame {
            fin,
            opcode,
            payload,
        },
        header_len + len,
    )))
}

/// Incremental decoder over a byte stream.
///
/// Bytes are appended as they arrive; [`next_frame`](Self::next_frame)
/// yields each complete frame in order. Inbound fragments are not
/// reassembled: every frame is handed out on its own.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    limit: u64,
}

impl FrameBuffer {
    /// Creates an empty buffer with the default inbound limit.
    pub fn new() -> Self {
        Self::with_limit(MAX_INBOUND_PAYLOAD)
    }

    /// Creates an empty buffer rejecting payloads above `limit` bytes.
    pub fn with_limit(limit: u64) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            limit,
        }
    }

    /// Appends received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered, not yet decoded bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Takes the next complete frame.
    ///
    /// On error the buffer is cleared since the stream cannot be
    /// resynchronized after a bad header.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match parse(&self.buf, self.limit) {
            Ok(Some((frame, consumed))) => {
                self.buf.advance(consumed);
                Ok(Some(frame))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.buf.clear();
                Err(e)
            }
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPCODES: [Opcode; 5] = [
        Opcode::Continuation,
        Opcode::Text,
        Opcode::Binary,
        Opcode::Close,
        Opcode::Ping,
    ];

    fn masked_frame(opcode: Opcode, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
        let mut out = vec![FIN_BIT | opcode.as_u8()];
        if payload.len() <= 125 {
            out.push(MASK_BIT | payload.len() as u8);
        } else {
            out.push(MASK_BIT | 126);
            out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        }
        out.extend_from_slice(&key);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        out
    }

    #[test]
    fn test_round_trip_all_lengths() {
        for &len in &[0usize, 1, 125, 126, 65535, 65536, 2_000_000] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            for opcode in OPCODES {
                let wire = encode(&payload, opcode);
                let frame = decode(&wire).unwrap().unwrap();
                assert!(frame.fin);
                assert_eq!(frame.opcode, opcode);
                assert_eq!(frame.payload.len(), len);
                assert_eq!(&frame.payload[..], &payload[..]);
            }
        }
    }

    #[test]
    fn test_length_class_boundaries() {
        assert_eq!(encode(&[0; 125], Opcode::Text)[1], 125);
        assert_eq!(encode(&[0; 125], Opcode::Text).len(), 2 + 125);

        let wire = encode(&[0; 126], Opcode::Text);
        assert_eq!(wire[1], 126);
        assert_eq!(&wire[2..4], &[0x00, 0x7e]);

        let wire = encode(&vec![0; 65535], Opcode::Text);
        assert_eq!(wire[1], 126);
        assert_eq!(&wire[2..4], &[0xff, 0xff]);

        let wire = encode(&vec![0; 65536], Opcode::Text);
        assert_eq!(wire[1], 127);
        assert_eq!(&wire[2..10], &[0, 0, 0, 0, 0, 1, 0, 0]);
    }

    #[test]
    fn test_server_frames_are_unmasked_and_final() {
        let wire = encode(b"x", Opcode::Binary);
        assert_eq!(wire[0], 0x82);
        assert_eq!(wire[1] & MASK_BIT, 0);
    }

    #[test]
    fn test_fragment_clears_fin() {
        let wire = Frame::fragment(Opcode::Text, &b"abc"[..]).encode();
        assert_eq!(wire[0], 0x01);
        let frame = decode(&wire).unwrap().unwrap();
        assert!(!frame.fin);
    }

    #[test]
    fn test_masked_client_frame() {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let wire = masked_frame(Opcode::Text, b"Hello", key);
        // RFC 6455 section 5.7 sample
        assert_eq!(wire, vec![0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]);

        let frame = decode(&wire).unwrap().unwrap();
        assert_eq!(frame.as_text(), Some("Hello"));
    }

    #[test]
    fn test_masked_extended_length() {
        let payload: Vec<u8> = (0..300).map(|i| (i * 7) as u8).collect();
        let wire = masked_frame(Opcode::Binary, &payload, [1, 2, 3, 4]);
        let frame = decode(&wire).unwrap().unwrap();
        assert_eq!(&frame.payload[..], &payload[..]);
    }

    #[test]
    fn test_pong_is_payload_less() {
        let wire = masked_frame(Opcode::Pong, b"abcd", [9, 9, 9, 9]);
        let frame = decode(&wire).unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Pong);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_empty_input_is_none() {
        assert!(decode(&[]).unwrap().is_none());
    }

    #[test]
    fn test_unknown_opcode_fails() {
        let err = decode(&[0x83, 0x00]).unwrap_err();
        assert!(matches!(err, Error::InvalidOpcode(0x3)));
    }

    #[test]
    fn test_truncated_frame_fails() {
        assert!(matches!(decode(&[0x81]), Err(Error::IncompleteFrame)));
        assert!(matches!(decode(&[0x81, 0x05, b'h']), Err(Error::IncompleteFrame)));
    }

    #[test]
    fn test_infer_opcode() {
        assert_eq!(Opcode::infer(b"plain"), Opcode::Text);
        assert_eq!(Opcode::infer(&[0xc3, 0x28]), Opcode::Binary);
        let big = vec![b'a'; TEXT_FRAME_LIMIT + 1];
        assert_eq!(Opcode::infer(&big), Opcode::Continuation);
    }

    #[test]
    fn test_buffer_splits_stream() {
        let mut wire = masked_frame(Opcode::Text, b"one", [1, 1, 1, 1]);
        wire.extend(masked_frame(Opcode::Text, b"two", [2, 2, 2, 2]));
        let (head, tail) = wire.split_at(wire.len() - 2);

        let mut buffer = FrameBuffer::new();
        buffer.extend(head);
        assert_eq!(buffer.next_frame().unwrap().unwrap().as_text(), Some("one"));
        assert!(buffer.next_frame().unwrap().is_none());

        buffer.extend(tail);
        assert_eq!(buffer.next_frame().unwrap().unwrap().as_text(), Some("two"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_buffer_rejects_oversized_and_clears() {
        let mut buffer = FrameBuffer::with_limit(10);
        buffer.extend(&encode(&[0; 20], Opcode::Binary));
        assert!(matches!(
            buffer.next_frame(),
            Err(Error::FrameTooLarge { size: 20, limit: 10 })
        ));
        assert!(buffer.is_empty());
    }
}
