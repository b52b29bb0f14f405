//! This module does the opening handshake on the game socket: read the
//! upgrade request, verify it, answer with the computed accept key. Any
//! failure path answers HTTP 400 and the caller closes the socket.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// The fixed GUID every conforming peer concatenates to the client key.
const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
/// Upper bound for the request head.
const MAX_REQUEST_BYTES: usize = 8 * 1024;
/// How often we poll for more header bytes before giving up.
const READ_ATTEMPTS: u32 = 10;
/// Pause between polling attempts.
const READ_PAUSE: Duration = Duration::from_millis(20);

/// What we keep from a valid upgrade request.
#[derive(Debug, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub key: String,
    pub path: String,
}

/// Computes `Sec-WebSocket-Accept` for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(ACCEPT_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Validates the request head. The path is irrelevant for the game socket
/// but kept for logging.
pub fn parse_upgrade_request(head: &str) -> Result<UpgradeRequest, String> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("/").to_string();
    if !method.eq_ignore_ascii_case("GET") {
        return Err(format!("method {method:?} is not GET"));
    }

    let mut upgrade_ok = false;
    let mut connection_ok = false;
    let mut version_ok = false;
    let mut key = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();
        match name.as_str() {
            "upgrade" => upgrade_ok = value.eq_ignore_ascii_case("websocket"),
            "connection" => {
                connection_ok = value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
            }
            "sec-websocket-key" => key = Some(value.to_string()),
            "sec-websocket-version" => version_ok = value.trim() == "13",
            _ => {}
        }
    }

    if !upgrade_ok {
        return Err("missing Upgrade: websocket".into());
    }
    if !connection_ok {
        return Err("Connection header does not include Upgrade".into());
    }
    if !version_ok {
        return Err("unsupported protocol version".into());
    }
    let Some(key) = key else {
        return Err("missing Sec-WebSocket-Key".into());
    };
    Ok(UpgradeRequest { key, path })
}

/// Reads the request head, bounded by size and polling attempts, then sends
/// the 101 answer. Returns `None` after answering 400 on any failure.
pub async fn perform_handshake(stream: &mut TcpStream) -> Option<UpgradeRequest> {
    let mut buffer = BytesMut::with_capacity(1024);
    let mut attempts = 0;
    let head_end = loop {
        if let Some(position) = find_terminator(&buffer) {
            break position;
        }
        if buffer.len() > MAX_REQUEST_BYTES {
            tracing::warn!("Handshake request exceeded the size bound.");
            reject(stream).await;
            return None;
        }
        attempts += 1;
        if attempts > READ_ATTEMPTS {
            tracing::warn!("Handshake request did not complete in time.");
            reject(stream).await;
            return None;
        }
        match tokio::time::timeout(READ_PAUSE, stream.read_buf(&mut buffer)).await {
            Ok(Ok(0)) => {
                // Peer went away before the head was complete.
                return None;
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                tracing::warn!(?err, "Read error during handshake.");
                return None;
            }
            // Timeout, count it as one polling attempt.
            Err(_) => {}
        }
    };

    let head = String::from_utf8_lossy(&buffer[..head_end]).into_owned();
    let request = match parse_upgrade_request(&head) {
        Ok(request) => request,
        Err(reason) => {
            tracing::warn!(reason, "Rejecting bad upgrade request.");
            reject(stream).await;
            return None;
        }
    };

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(&request.key)
    );
    if let Err(err) = stream.write_all(response.as_bytes()).await {
        tracing::warn!(?err, "Could not send handshake response.");
        return None;
    }
    Some(request)
}

fn find_terminator(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

async fn reject(stream: &mut TcpStream) {
    let _ = stream
        .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_the_reference_vector() {
        // The worked example from RFC 6455.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    fn valid_head() -> String {
        "GET /game HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: keep-alive, Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n"
            .to_string()
    }

    #[test]
    fn a_proper_request_passes() {
        let request = parse_upgrade_request(&valid_head()).unwrap();
        assert_eq!(request.key, "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(request.path, "/game");
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let head = valid_head()
            .replace("Upgrade: websocket", "UPGRADE: WebSocket")
            .replace("Sec-WebSocket-Key", "SEC-WEBSOCKET-KEY");
        assert!(parse_upgrade_request(&head).is_ok());
    }

    #[test]
    fn missing_key_is_rejected() {
        let head = valid_head().replace("Sec-WebSocket-Key", "X-Key");
        assert!(parse_upgrade_request(&head).is_err());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let head = valid_head().replace("Version: 13", "Version: 8");
        assert!(parse_upgrade_request(&head).is_err());
    }

    #[test]
    fn post_is_rejected() {
        let head = valid_head().replace("GET", "POST");
        assert!(parse_upgrade_request(&head).is_err());
    }
}
