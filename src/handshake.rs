//! Server-side HTTP Upgrade handshake.
//!
//! The teacher's version of this (`handshake.rs::perform_handshake`) is
//! client-oriented and scans for `Sec-WebSocket-Key:` by hand with
//! `str::find`. Parsing here is server-oriented and built on `httparse`
//! instead, the way `request.rs::HttpRequest::parse_http_request` builds
//! its own request model, but without that file's hand-rolled line
//! reader. The accept-key algorithm itself is unchanged from `utils.rs::
//! generate_websocket_accept_value`.

use crate::error::Error;
use base64::prelude::*;
use sha1::{Digest, Sha1};
use std::collections::HashMap;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_HEADER_BYTES: usize = 16 * 1024;

/// A parsed HTTP/1.1 request line plus headers, folded to lowercase keys.
pub struct HandshakeRequest {
    pub method: String,
    pub path: String,
    pub version: u8,
    pub headers: HashMap<String, String>,
}

impl HandshakeRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.header(name)
            .map(|value| value.split(',').any(|part| part.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }
}

pub enum HandshakeOutcome {
    Accepted {
        response: Vec<u8>,
        selected_protocol: Option<String>,
    },
    Rejected {
        status: u16,
        response: Vec<u8>,
    },
}

/// Parses a buffered HTTP request. Returns `Ok(None)` if the header block
/// isn't complete yet; the caller should read more bytes and retry.
pub fn parse_request(buf: &[u8]) -> Result<Option<(HandshakeRequest, usize)>, Error> {
    if buf.len() > MAX_HEADER_BYTES {
        return Err(Error::Handshake("request header exceeds size limit".into()));
    }

    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut header_storage);

    match req.parse(buf).map_err(|e| Error::Handshake(e.to_string()))? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(consumed) => {
            let method = req.method.unwrap_or_default().to_string();
            let path = req.path.unwrap_or_default().to_string();
            let version = req.version.unwrap_or(0);
            let mut headers = HashMap::new();
            for header in req.headers.iter() {
                let value = String::from_utf8_lossy(header.value).trim().to_string();
                headers.insert(header.name.to_ascii_lowercase(), value);
            }
            Ok(Some((HandshakeRequest { method, path, version, headers }, consumed)))
        }
    }
}

/// Validates an upgrade request and builds either a 101 response or an
/// HTTP error response. `select_protocol` is handed the client's
/// requested subprotocols (already split on commas) and may pick one to
/// echo back in `Sec-WebSocket-Protocol`.
pub fn respond(
    request: &HandshakeRequest,
    select_protocol: impl Fn(&[&str]) -> Option<String>,
) -> HandshakeOutcome {
    if !request.method.eq_ignore_ascii_case("GET") {
        return reject(405, "Method Not Allowed", &[]);
    }

    if request.version < 1 {
        return reject(400, "Bad Request", &[]);
    }

    if request.header("host").map(str::is_empty).unwrap_or(true) {
        return reject(400, "Bad Request", &[]);
    }

    if !request.header_has_token("connection", "upgrade") {
        return reject(400, "Bad Request", &[]);
    }
    if !request
        .header("upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return reject(400, "Bad Request", &[]);
    }

    match request.header("sec-websocket-version") {
        Some("13") => {}
        _ => return reject(426, "Upgrade Required", &[("Sec-WebSocket-Version", "13")]),
    }

    let key = match request.header("sec-websocket-key") {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => return reject(400, "Bad Request", &[]),
    };

    let selected_protocol = request.header("sec-websocket-protocol").and_then(|raw| {
        let candidates: Vec<&str> = raw.split(',').map(str::trim).collect();
        select_protocol(&candidates)
    });

    let accept = accept_key(&key);

    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {accept}\r\n"
    );
    if let Some(protocol) = &selected_protocol {
        response.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
    }
    response.push_str("\r\n");

    HandshakeOutcome::Accepted {
        response: response.into_bytes(),
        selected_protocol,
    }
}

fn reject(status: u16, reason: &str, extra_headers: &[(&str, &str)]) -> HandshakeOutcome {
    let mut response = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in extra_headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("Content-Length: 0\r\n\r\n");
    HandshakeOutcome::Rejected {
        status,
        response: response.into_bytes(),
    }
}

pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_upgrade_request() -> Vec<u8> {
        b"GET /chat HTTP/1.1\r\n\
          Host: server.example.com\r\n\
          Upgrade: websocket\r\n\
          Connection: Upgrade\r\n\
          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
          Sec-WebSocket-Version: 13\r\n\r\n"
            .to_vec()
    }

    #[test]
    fn accept_key_matches_rfc_example() {
        // The worked example from RFC 6455 section 1.3.
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn accepts_valid_upgrade_request() {
        let raw = valid_upgrade_request();
        let (request, _) = parse_request(&raw).unwrap().unwrap();
        match respond(&request, |_| None) {
            HandshakeOutcome::Accepted { response, selected_protocol } => {
                let text = String::from_utf8(response).unwrap();
                assert!(text.contains("101 Switching Protocols"));
                assert!(text.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
                assert!(selected_protocol.is_none());
            }
            HandshakeOutcome::Rejected { .. } => panic!("expected acceptance"),
        }
    }

    #[test]
    fn rejects_missing_key() {
        let raw = b"GET /chat HTTP/1.1\r\nHost: server.example.com\r\nUpgrade: websocket\r\n\
                    Connection: Upgrade\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let (request, _) = parse_request(raw).unwrap().unwrap();
        match respond(&request, |_| None) {
            HandshakeOutcome::Rejected { status, .. } => assert_eq!(status, 400),
            HandshakeOutcome::Accepted { .. } => panic!("expected rejection"),
        }
    }

    #[test]
    fn rejects_missing_host() {
        let raw = b"GET /chat HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let (request, _) = parse_request(raw).unwrap().unwrap();
        match respond(&request, |_| None) {
            HandshakeOutcome::Rejected { status, .. } => assert_eq!(status, 400),
            HandshakeOutcome::Accepted { .. } => panic!("expected rejection"),
        }
    }

    #[test]
    fn rejects_http_1_0() {
        let raw = b"GET /chat HTTP/1.0\r\nHost: server.example.com\r\nUpgrade: websocket\r\n\
                    Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                    Sec-WebSocket-Version: 13\r\n\r\n";
        let (request, _) = parse_request(raw).unwrap().unwrap();
        assert_eq!(request.version, 0);
        match respond(&request, |_| None) {
            HandshakeOutcome::Rejected { status, .. } => assert_eq!(status, 400),
            HandshakeOutcome::Accepted { .. } => panic!("expected rejection"),
        }
    }

    #[test]
    fn rejects_wrong_version_with_426() {
        let raw = b"GET /chat HTTP/1.1\r\nHost: server.example.com\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 8\r\n\r\n";
        let (request, _) = parse_request(raw).unwrap().unwrap();
        match respond(&request, |_| None) {
            HandshakeOutcome::Rejected { status, response } => {
                assert_eq!(status, 426);
                assert!(String::from_utf8(response).unwrap().contains("Sec-WebSocket-Version: 13"));
            }
            HandshakeOutcome::Accepted { .. } => panic!("expected rejection"),
        }
    }

    #[test]
    fn selects_subprotocol_when_offered() {
        let raw = b"GET /chat HTTP/1.1\r\nHost: server.example.com\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\
                    Sec-WebSocket-Protocol: chat, superchat\r\n\r\n";
        let (request, _) = parse_request(raw).unwrap().unwrap();
        match respond(&request, |offered| offered.iter().find(|p| **p == "superchat").map(|s| s.to_string())) {
            HandshakeOutcome::Accepted { selected_protocol, .. } => {
                assert_eq!(selected_protocol.as_deref(), Some("superchat"));
            }
            HandshakeOutcome::Rejected { .. } => panic!("expected acceptance"),
        }
    }

    #[test]
    fn partial_request_returns_none() {
        let raw = b"GET /chat HTTP/1.1\r\nUpgrade: web";
        assert!(parse_request(raw).unwrap().is_none());
    }

    #[test]
    fn case_insensitive_connection_token_list() {
        let raw = b"GET / HTTP/1.1\r\nHost: server.example.com\r\nConnection: keep-alive, Upgrade\r\n\
                    Upgrade: WebSocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                    Sec-WebSocket-Version: 13\r\n\r\n";
        let (request, _) = parse_request(raw).unwrap().unwrap();
        assert!(matches!(respond(&request, |_| None), HandshakeOutcome::Accepted { .. }));
    }
}
