//! WebSocket upgrade handshake
//!
//! HTTP/1.1-style opening exchange. The server validates the upgrade
//! request and answers 101 Switching Protocols with the accept token
//! `base64(SHA1(key + GUID))`; the client sends the request and
//! verifies the token it gets back. A failed handshake closes the
//! connection without ever surfacing an Open event.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::BytesMut;
use rand::RngCore;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{GateError, ProtocolError};

/// Fixed GUID appended to the client key before hashing, per RFC 6455.
const WS_MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the upgrade request/response size.
const MAX_HANDSHAKE_SIZE: usize = 8192;

const HEADER_UPGRADE: &str = "upgrade";
const HEADER_VERSION: &str = "sec-websocket-version";
const HEADER_KEY: &str = "sec-websocket-key";
const HEADER_ACCEPT: &str = "sec-websocket-accept";

/// Compute the accept token for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_MAGIC_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Generate the random base64 key a client sends.
pub fn generate_client_key() -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    BASE64.encode(nonce)
}

/// Parsed upgrade request/response: the request line plus lowercased
/// header names mapped to trimmed values.
struct HandshakeText {
    request_line: String,
    headers: HashMap<String, String>,
}

impl HandshakeText {
    fn parse(text: &str) -> Self {
        let mut headers = HashMap::new();
        let mut request_line = String::new();
        for (index, line) in text.split("\r\n").enumerate() {
            match line.find(':') {
                Some(colon) => {
                    headers.insert(
                        line[..colon].trim().to_ascii_lowercase(),
                        line[colon + 1..].trim().to_string(),
                    );
                }
                None if index == 0 => request_line = line.to_string(),
                None => {}
            }
        }
        Self {
            request_line,
            headers,
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Request path from a `GET /path HTTP/1.1` request line.
    fn path(&self) -> Option<String> {
        let mut parts = self.request_line.split(' ');
        let (_method, path, _version) = (parts.next()?, parts.next()?, parts.next()?);
        Some(path.to_string())
    }
}

/// Read from the stream until the blank line ending the handshake.
/// Bytes that arrived past the terminator belong to the first frames;
/// they are returned so the caller can feed them to the frame reader.
async fn read_handshake<S>(stream: &mut S) -> Result<(String, BytesMut), GateError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        let read = stream.read_buf(&mut buf).await?;
        if read == 0 {
            return Err(
                ProtocolError::MalformedHandshake("peer closed during handshake".into()).into(),
            );
        }
        if let Some(end) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
            let leftover = buf.split_off(end + 4);
            return Ok((String::from_utf8_lossy(&buf).into_owned(), leftover));
        }
        if buf.len() > MAX_HANDSHAKE_SIZE {
            return Err(ProtocolError::MalformedHandshake("handshake too large".into()).into());
        }
    }
}

/// Server side: validate the client's upgrade request and answer 101.
/// Returns the request path and any over-read frame bytes. Any failed
/// check is fatal; the caller closes the socket without emitting an
/// Open event.
pub async fn accept<S>(stream: &mut S) -> Result<(String, BytesMut), GateError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (text, leftover) = read_handshake(stream).await?;
    let parsed = HandshakeText::parse(&text);

    if parsed.header(HEADER_UPGRADE).map(str::to_ascii_lowercase) != Some("websocket".into()) {
        return Err(ProtocolError::NotAnUpgrade.into());
    }
    if parsed.header(HEADER_VERSION) != Some("13") {
        return Err(ProtocolError::UnsupportedVersion(
            parsed.header(HEADER_VERSION).map(str::to_string),
        )
        .into());
    }
    let client_key = parsed.header(HEADER_KEY).ok_or(ProtocolError::MissingKey)?;

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(client_key)
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    Ok((parsed.path().unwrap_or_else(|| "/".to_string()), leftover))
}

/// Client side: send the upgrade request and verify the server's
/// accept token against the locally computed expectation. Returns any
/// over-read frame bytes.
pub async fn connect<S>(stream: &mut S, host: &str, path: &str) -> Result<BytesMut, GateError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_key = generate_client_key();
    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Host: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: {}\r\n\r\n",
        path, host, client_key
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let (text, leftover) = read_handshake(stream).await?;
    let parsed = HandshakeText::parse(&text);
    match parsed.header(HEADER_ACCEPT) {
        None => Err(ProtocolError::MalformedHandshake("no accept token".into()).into()),
        Some(token) if token != accept_key(&client_key) => {
            Err(ProtocolError::AcceptMismatch.into())
        }
        Some(_) => Ok(leftover),
    }
}
