//! HTTP request handling on a fresh TCP connection: WebSocket upgrade with
//! permessage-deflate negotiation, or the NIP-11 metadata hijack.
//!
//! The caller owns a read buffer that persists across calls so pipelined
//! bytes (another GET, or the first WebSocket frames) are never lost.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::nip11::Nip11Bytes;

const WS_ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_HEAD_BYTES: usize = 8 * 1024;
const MAX_HEADERS: usize = 32;

/// Negotiated permessage-deflate parameters. Absent when the client did not
/// offer the extension (or offered it with parameters we cannot honour).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeflateConfig {
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The connection is now a WebSocket; frames may already be waiting in
    /// the caller's read buffer.
    Upgraded(Option<DeflateConfig>),
    /// A metadata document was served; keep reading requests on this
    /// connection.
    Hijacked,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("connection closed before a complete request head")]
    UnexpectedEof,
    #[error("request head larger than {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,
    #[error("malformed http request")]
    BadRequest,
    #[error("not a websocket upgrade and not a metadata request")]
    Unsupported,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Extracted, owned view of one request head.
#[derive(Debug, Default)]
struct RequestHead {
    get: bool,
    upgrade_websocket: bool,
    key: Option<String>,
    version_13: bool,
    extensions: String,
    accept: String,
    accept_encoding: String,
}

/// Reads one HTTP request from `stream` (continuing from `buf`) and either
/// upgrades it to a WebSocket or serves the metadata document. Consumed head
/// bytes are drained from `buf`; the remainder is left for the caller.
pub async fn accept<S>(
    stream: &mut S,
    buf: &mut Vec<u8>,
    nip11: &Nip11Bytes,
    nip11_unconditional: bool,
) -> Result<Outcome, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (head, head_len) = read_head(stream, buf).await?;
    buf.drain(..head_len);

    if !head.get {
        return Err(HandshakeError::BadRequest);
    }

    if head.upgrade_websocket {
        let key = head.key.as_deref().ok_or(HandshakeError::BadRequest)?;
        if !head.version_13 {
            return Err(HandshakeError::BadRequest);
        }
        let deflate = negotiate_deflate(&head.extensions);
        let response = upgrade_response(key, deflate);
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await?;
        return Ok(Outcome::Upgraded(deflate));
    }

    if nip11_unconditional || head.accept.contains("application/nostr+json") {
        let gzip = head
            .accept_encoding
            .split(',')
            .any(|enc| enc.trim().eq_ignore_ascii_case("gzip"));
        let body = if gzip { &nip11.gzip } else { &nip11.plain };
        let mut response = format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: application/nostr+json\r\n\
             Access-Control-Allow-Origin: *\r\n\
             Connection: keep-alive\r\n\
             Content-Length: {}\r\n",
            body.len()
        );
        if gzip {
            response.push_str("Content-Encoding: gzip\r\n");
        }
        response.push_str("\r\n");
        stream.write_all(response.as_bytes()).await?;
        stream.write_all(body).await?;
        stream.flush().await?;
        return Ok(Outcome::Hijacked);
    }

    Err(HandshakeError::Unsupported)
}

async fn read_head<S>(
    stream: &mut S,
    buf: &mut Vec<u8>,
) -> Result<(RequestHead, usize), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    loop {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                return Ok((extract_head(&req), head_len));
            }
            Ok(httparse::Status::Partial) => {}
            Err(_) => return Err(HandshakeError::BadRequest),
        }
        if buf.len() >= MAX_HEAD_BYTES {
            return Err(HandshakeError::HeadTooLarge);
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(HandshakeError::UnexpectedEof);
        }
    }
}

fn extract_head(req: &httparse::Request<'_, '_>) -> RequestHead {
    let mut head = RequestHead {
        get: req.method == Some("GET"),
        ..RequestHead::default()
    };
    for header in req.headers.iter() {
        let value = String::from_utf8_lossy(header.value);
        if header.name.eq_ignore_ascii_case("upgrade") {
            head.upgrade_websocket = value.trim().eq_ignore_ascii_case("websocket");
        } else if header.name.eq_ignore_ascii_case("sec-websocket-key") {
            head.key = Some(value.trim().to_owned());
        } else if header.name.eq_ignore_ascii_case("sec-websocket-version") {
            head.version_13 = value.trim() == "13";
        } else if header.name.eq_ignore_ascii_case("sec-websocket-extensions") {
            if !head.extensions.is_empty() {
                head.extensions.push(',');
            }
            head.extensions.push_str(&value);
        } else if header.name.eq_ignore_ascii_case("accept") {
            head.accept = value.into_owned();
        } else if header.name.eq_ignore_ascii_case("accept-encoding") {
            head.accept_encoding = value.into_owned();
        }
    }
    head
}

/// Picks the first permessage-deflate offer we can satisfy. Offers asking
/// for a reduced server window are skipped (the compressor runs with the
/// full 15-bit window); all other extensions are declined outright.
fn negotiate_deflate(offers: &str) -> Option<DeflateConfig> {
    for offer in offers.split(',') {
        let mut parts = offer.split(';').map(str::trim);
        if parts.next() != Some("permessage-deflate") {
            continue;
        }
        let mut cfg = DeflateConfig::default();
        let mut acceptable = true;
        for param in parts {
            let name = param.split('=').next().unwrap_or(param).trim();
            match name {
                "client_no_context_takeover" => cfg.client_no_context_takeover = true,
                "server_no_context_takeover" => cfg.server_no_context_takeover = true,
                // The client constraining its own window does not affect us.
                "client_max_window_bits" => {}
                _ => {
                    acceptable = false;
                    break;
                }
            }
        }
        if acceptable {
            return Some(cfg);
        }
    }
    None
}

fn upgrade_response(key: &str, deflate: Option<DeflateConfig>) -> String {
    let accept = accept_key(key);
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n"
    );
    if let Some(cfg) = deflate {
        response.push_str("Sec-WebSocket-Extensions: permessage-deflate");
        if cfg.server_no_context_takeover {
            response.push_str("; server_no_context_takeover");
        }
        if cfg.client_no_context_takeover {
            response.push_str("; client_no_context_takeover");
        }
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    response
}

fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_ACCEPT_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tokio::io::duplex;

    fn nip11_fixture() -> Nip11Bytes {
        let plain = br#"{"name":"test"}"#.to_vec();
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut encoder, &plain).unwrap();
        Nip11Bytes {
            plain,
            gzip: encoder.finish().unwrap(),
        }
    }

    async fn read_response(client: &mut tokio::io::DuplexStream) -> String {
        // Reads until the response head is complete; 101 responses have no body.
        let mut buf = Vec::new();
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            assert!(client.read_buf(&mut buf).await.unwrap() > 0, "eof");
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Reads one full response with a Content-Length body; returns (head, body).
    async fn read_response_with_body(client: &mut tokio::io::DuplexStream) -> (String, Vec<u8>) {
        let mut buf = Vec::new();
        let body_start = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            assert!(client.read_buf(&mut buf).await.unwrap() > 0, "eof");
        };
        let head = String::from_utf8_lossy(&buf[..body_start]).into_owned();
        let length_line = head
            .lines()
            .find(|l| l.to_ascii_lowercase().starts_with("content-length:"))
            .expect("content-length header");
        let length: usize = length_line
            .split(':')
            .nth(1)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        while buf.len() < body_start + length {
            assert!(client.read_buf(&mut buf).await.unwrap() > 0, "eof");
        }
        (head, buf[body_start..body_start + length].to_vec())
    }

    #[test]
    fn rfc6455_accept_key_vector() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn deflate_negotiation() {
        assert_eq!(negotiate_deflate(""), None);
        assert_eq!(
            negotiate_deflate("permessage-deflate"),
            Some(DeflateConfig::default())
        );
        assert_eq!(
            negotiate_deflate(
                "permessage-deflate; client_no_context_takeover; server_no_context_takeover"
            ),
            Some(DeflateConfig {
                client_no_context_takeover: true,
                server_no_context_takeover: true,
            })
        );
        // A reduced server window cannot be honoured; the plain fallback
        // offer is picked instead.
        assert_eq!(
            negotiate_deflate("permessage-deflate; server_max_window_bits=10, permessage-deflate"),
            Some(DeflateConfig::default())
        );
        assert_eq!(negotiate_deflate("x-webkit-deflate-frame"), None);
    }

    #[tokio::test]
    async fn websocket_upgrade_completes() {
        let (mut client, mut server) = duplex(8192);
        let nip11 = nip11_fixture();
        let task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let outcome = accept(&mut server, &mut buf, &nip11, false).await.unwrap();
            (outcome, buf)
        });
        client
            .write_all(
                b"GET / HTTP/1.1\r\n\
                  Host: localhost\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\
                  Sec-WebSocket-Extensions: permessage-deflate\r\n\r\n",
            )
            .await
            .unwrap();
        let response = read_response(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 101"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert!(response.contains("Sec-WebSocket-Extensions: permessage-deflate"));
        let (outcome, leftover) = task.await.unwrap();
        assert_eq!(outcome, Outcome::Upgraded(Some(DeflateConfig::default())));
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn metadata_hijack_keeps_the_connection_and_serves_gzip_next() {
        let (mut client, mut server) = duplex(8192);
        let nip11 = nip11_fixture();
        let plain_expected = nip11.plain.clone();
        let gzip_expected = nip11.gzip.clone();
        let task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let first = accept(&mut server, &mut buf, &nip11, false).await.unwrap();
            let second = accept(&mut server, &mut buf, &nip11, false).await.unwrap();
            (first, second)
        });

        client
            .write_all(b"GET / HTTP/1.1\r\nAccept: application/nostr+json\r\n\r\n")
            .await
            .unwrap();
        let (head, body) = read_response_with_body(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200"));
        assert!(head.contains("Content-Type: application/nostr+json"));
        assert_eq!(body, plain_expected);

        client
            .write_all(
                b"GET / HTTP/1.1\r\nAccept: application/nostr+json\r\nAccept-Encoding: gzip\r\n\r\n",
            )
            .await
            .unwrap();
        let (head, body) = read_response_with_body(&mut client).await;
        assert!(head.contains("Content-Encoding: gzip"));
        assert_eq!(body, gzip_expected);
        let mut decoder = GzDecoder::new(body.as_slice());
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, br#"{"name":"test"}"#);

        let (first, second) = task.await.unwrap();
        assert_eq!(first, Outcome::Hijacked);
        assert_eq!(second, Outcome::Hijacked);
    }

    #[tokio::test]
    async fn plain_get_without_accept_is_rejected() {
        let (mut client, mut server) = duplex(8192);
        let nip11 = nip11_fixture();
        let task = tokio::spawn(async move {
            let mut buf = Vec::new();
            accept(&mut server, &mut buf, &nip11, false).await
        });
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        assert!(matches!(
            task.await.unwrap(),
            Err(HandshakeError::Unsupported)
        ));
    }

    #[tokio::test]
    async fn unconditional_mode_serves_any_get() {
        let (mut client, mut server) = duplex(8192);
        let nip11 = nip11_fixture();
        let task = tokio::spawn(async move {
            let mut buf = Vec::new();
            accept(&mut server, &mut buf, &nip11, true).await.unwrap()
        });
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let response = read_response(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert_eq!(task.await.unwrap(), Outcome::Hijacked);
    }
}
