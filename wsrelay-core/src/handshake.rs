//! Protocol upgrade handling.
//!
//! A connection starts with a plain HTTP request header. When it asks for an
//! upgrade, [`response`] renders the `101 Switching Protocols` answer; either
//! way [`parse_identity`] pulls the caller's identity out of the request
//! line's query string.

use base64::Engine;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Fixed GUID appended to the client key before hashing.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Marks the end of the request header.
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Identity supplied by a client through its connection URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Device/browser hash used to count unique visitors.
    pub fingerprint: Option<String>,
    /// Opaque credential.
    pub auth_token: Option<String>,
    /// Numeric user identity.
    pub user_id: Option<i64>,
}

/// Computes the `Sec-WebSocket-Accept` value for a client key.
///
/// ```
/// use wsrelay_core::handshake::accept_key;
///
/// assert_eq!(
///     accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Looks up a header value, ignoring the name's case.
pub fn header_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header
        .split("\r\n")
        .skip(1)
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim())
}

/// Returns `true` when the request asks for a websocket upgrade.
pub fn is_upgrade_request(header: &str) -> bool {
    header_value(header, "upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Renders the upgrade response, or `None` when the request has no key.
pub fn response(header: &str) -> Option<String> {
    let key = header_value(header, "sec-websocket-key").filter(|k| !k.is_empty())?;

    Some(format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    ))
}

/// Parses `fingerprint`, `trongateToken` and `user_id` from the request line.
pub fn parse_identity(header: &str) -> Identity {
    let mut identity = Identity::default();

    let Some(query) = header
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|target| target.split_once('?'))
        .map(|(_, query)| query)
    else {
        return identity;
    };

    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = decode_component(value);
        match key {
            "fingerprint" => identity.fingerprint = Some(value),
            "trongateToken" => identity.auth_token = Some(value),
            "user_id" => identity.user_id = value.parse().ok(),
            _ => {}
        }
    }

    identity
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

/// Position just past the header terminator, if present.
pub fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &str = "GET /?fingerprint=abc123&trongateToken=t%2Fok&user_id=42 HTTP/1.1\r\n\
        Host: localhost:8085\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    #[test]
    fn test_rfc_accept_key() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_response_contains_accept() {
        let response = response(REQUEST).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_header_names_are_case_insensitive() {
        let lower = REQUEST.replace("Sec-WebSocket-Key", "sec-websocket-key");
        assert!(response(&lower).is_some());
        assert!(is_upgrade_request(&lower.replace("Upgrade: websocket", "upgrade: WebSocket")));
    }

    #[test]
    fn test_missing_key_yields_no_response() {
        let header = "GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        assert!(response(header).is_none());
        assert!(!is_upgrade_request(header));
    }

    #[test]
    fn test_parse_identity() {
        let identity = parse_identity(REQUEST);
        assert_eq!(identity.fingerprint.as_deref(), Some("abc123"));
        assert_eq!(identity.auth_token.as_deref(), Some("t/ok"));
        assert_eq!(identity.user_id, Some(42));
    }

    #[test]
    fn test_parse_identity_without_query() {
        assert_eq!(parse_identity("GET / HTTP/1.1\r\n\r\n"), Identity::default());
    }

    #[test]
    fn test_invalid_user_id_is_dropped() {
        let identity = parse_identity("GET /?fingerprint=a+b&user_id=abc HTTP/1.1\r\n\r\n");
        assert_eq!(identity.fingerprint.as_deref(), Some("a b"));
        assert_eq!(identity.user_id, None);
    }

    #[test]
    fn test_header_end() {
        assert_eq!(header_end(b"GET / HTTP/1.1\r\n\r\nrest"), Some(18));
        assert_eq!(header_end(b"GET / HTTP/1.1\r\n"), None);
    }
}
