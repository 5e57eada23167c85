//! WebSocket HTTP upgrade handshake, server side (RFC 6455 Section 4.2).
//!
//! [`Upgrader::upgrade`] reads the HTTP request from a freshly accepted
//! socket, validates it, negotiates subprotocol and compression, writes the
//! `101 Switching Protocols` response and hands back a [`Connection`].
//! Every rejection writes an HTTP error response and returns
//! [`WsError::Handshake`] carrying the status that was sent.

use std::fmt;
use std::io::BufReader;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

use crate::conn::{Connection, ConnectionConfig, DEFAULT_BUFFER_SIZE};
use crate::deflate;
use crate::error::{HandshakeError, WsError};
use crate::frame::Role;
use crate::http::{self, Headers, RequestHead};

/// RFC 6455 magic GUID concatenated with the client key for Sec-WebSocket-Accept.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute `base64(sha1(key || GUID))`.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// The parsed upgrade request, kept after the handshake for its headers.
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub method: String,
    pub target: String,
    pub headers: Headers,
    pub peer_addr: Option<SocketAddr>,
}

impl HandshakeRequest {
    fn from_head(head: RequestHead, peer_addr: Option<SocketAddr>) -> Self {
        HandshakeRequest {
            method: head.method,
            target: head.target,
            headers: head.headers,
            peer_addr,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Host of the request, from the `Host` header.
    pub fn host(&self) -> Option<&str> {
        self.header("Host")
    }
}

/// Origin predicate. Returning `false` rejects the handshake with 403.
pub type OriginCheck = Arc<dyn Fn(&HandshakeRequest) -> bool + Send + Sync>;

/// Accepts a missing `Origin`, or one whose host equals the `Host` header.
pub fn same_host_origin(req: &HandshakeRequest) -> bool {
    let origin = match req.header("Origin") {
        None => return true,
        Some(o) => o,
    };
    let host = match origin.split_once("://") {
        Some((_, rest)) => rest.split('/').next().unwrap_or_default(),
        None => return false,
    };
    match req.host() {
        Some(h) => h.eq_ignore_ascii_case(host),
        None => false,
    }
}

/// Server-side handshake settings.
#[derive(Clone)]
pub struct Upgrader {
    /// Deadline for reading the request and writing the response.
    /// `None` waits forever.
    pub handshake_timeout: Option<Duration>,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    /// Supported subprotocols, in server preference order.
    pub subprotocols: Vec<String>,
    pub enable_compression: bool,
    pub compression_level: i32,
    /// `None` uses [`same_host_origin`].
    pub check_origin: Option<OriginCheck>,
}

impl Default for Upgrader {
    fn default() -> Self {
        Upgrader {
            handshake_timeout: None,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
            subprotocols: Vec::new(),
            enable_compression: false,
            compression_level: deflate::DEFAULT_COMPRESSION_LEVEL,
            check_origin: None,
        }
    }
}

impl fmt::Debug for Upgrader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgrader")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("subprotocols", &self.subprotocols)
            .field("enable_compression", &self.enable_compression)
            .field("custom_origin_check", &self.check_origin.is_some())
            .finish()
    }
}

/// What the validated request asked for.
struct Negotiated {
    accept: String,
    subprotocol: Option<String>,
    compress: bool,
}

impl Upgrader {
    /// Run the handshake on an accepted socket.
    pub fn upgrade(&self, stream: TcpStream) -> Result<(Connection, HandshakeRequest), WsError> {
        self.upgrade_with(stream, &Headers::new())
    }

    /// Like [`upgrade`](Self::upgrade), with extra response headers chosen by
    /// the application. A `Sec-WebSocket-Protocol` among them is used when
    /// no configured subprotocol matches; `Sec-WebSocket-Extensions` is
    /// reserved for the upgrader and rejected with 500.
    pub fn upgrade_with(
        &self,
        stream: TcpStream,
        response_headers: &Headers,
    ) -> Result<(Connection, HandshakeRequest), WsError> {
        stream.set_read_timeout(self.handshake_timeout)?;
        stream.set_write_timeout(self.handshake_timeout)?;
        let peer_addr = stream.peer_addr().ok();

        let mut reader = BufReader::new(stream.try_clone()?);
        let head = match http::read_request_head(&mut reader) {
            Ok(head) => head,
            Err(WsError::Handshake(e)) => return Err(self.reject(&stream, e)),
            Err(other) => return Err(other),
        };
        let leftover = reader.buffer().to_vec();
        drop(reader);

        let request = HandshakeRequest::from_head(head, peer_addr);
        let negotiated = match self.negotiate(&request, response_headers) {
            Ok(n) => n,
            Err(e) => return Err(self.reject(&stream, e)),
        };

        let mut response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n",
            negotiated.accept
        );
        if let Some(p) = &negotiated.subprotocol {
            response.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", p));
        }
        if negotiated.compress {
            response.push_str(&format!(
                "Sec-WebSocket-Extensions: {}\r\n",
                deflate::NO_CONTEXT_TAKEOVER_RESPONSE
            ));
        }
        for (name, value) in response_headers.iter() {
            if !name.eq_ignore_ascii_case("Sec-WebSocket-Protocol") {
                response.push_str(&format!("{}: {}\r\n", name, value));
            }
        }
        response.push_str("\r\n");
        (&stream).write_all(response.as_bytes())?;

        let config = ConnectionConfig {
            read_buffer_size: self.read_buffer_size,
            write_buffer_size: self.write_buffer_size,
            subprotocol: negotiated.subprotocol,
            compression_negotiated: negotiated.compress,
            compression_level: self.compression_level,
        };
        // Connection::new clears the handshake timeouts.
        let conn = Connection::new(stream, Role::Server, config, leftover)?;
        tracing::debug!(
            target: "ws",
            conn_id = %conn.id(),
            peer = ?request.peer_addr,
            compress = conn.compression_negotiated(),
            "upgraded"
        );
        Ok((conn, request))
    }

    fn negotiate(&self, req: &HandshakeRequest, response_headers: &Headers) -> Result<Negotiated, HandshakeError> {
        let h = &req.headers;
        if req.method != "GET" {
            return Err(HandshakeError::new(405, "request method is not GET"));
        }
        if !h.has_token("Connection", "upgrade") {
            return Err(HandshakeError::new(
                400,
                "'upgrade' token not found in 'Connection' header",
            ));
        }
        if !h.has_token("Upgrade", "websocket") {
            return Err(HandshakeError::new(
                400,
                "'websocket' token not found in 'Upgrade' header",
            ));
        }
        if h.get("Sec-WebSocket-Version").map(str::trim) != Some("13") {
            return Err(HandshakeError::new(400, "unsupported version: 13 not found in 'Sec-Websocket-Version' header"));
        }
        let key = match h.get("Sec-WebSocket-Key").map(str::trim) {
            Some(k) if !k.is_empty() => k,
            _ => return Err(HandshakeError::new(400, "'Sec-WebSocket-Key' header is missing or blank")),
        };
        if response_headers.contains("Sec-WebSocket-Extensions") {
            return Err(HandshakeError::new(500, "application specific 'Sec-WebSocket-Extensions' headers are unsupported"));
        }
        let allowed = match &self.check_origin {
            Some(check) => check(req),
            None => same_host_origin(req),
        };
        if !allowed {
            return Err(HandshakeError::new(403, "request origin not allowed by Upgrader.check_origin"));
        }

        let subprotocol = self
            .select_subprotocol(req)
            .or_else(|| response_headers.get("Sec-WebSocket-Protocol").map(str::to_string));

        let compress = self.enable_compression
            && deflate::offers_deflate(&deflate::parse_extensions(h.get_all("Sec-WebSocket-Extensions")));

        Ok(Negotiated {
            accept: compute_accept_key(key),
            subprotocol,
            compress,
        })
    }

    /// First server-configured subprotocol the client also offered.
    fn select_subprotocol(&self, req: &HandshakeRequest) -> Option<String> {
        let offered: Vec<&str> = req.headers.tokens("Sec-WebSocket-Protocol").collect();
        self.subprotocols
            .iter()
            .find(|p| offered.iter().any(|o| o == p))
            .cloned()
    }

    fn reject(&self, stream: &TcpStream, err: HandshakeError) -> WsError {
        tracing::debug!(target: "ws", status = err.status, reason = %err.message, "handshake rejected");
        let mut w = stream;
        let _ = http::write_error_response(&mut w, &err);
        WsError::Handshake(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, Read};
    use std::net::TcpListener;
    use std::thread;

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    #[test]
    fn accept_key_rfc_example() {
        assert_eq!(compute_accept_key(KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    fn valid_request(extra: &str) -> String {
        format!(
            "GET /ws HTTP/1.1\r\n\
             Host: example.com\r\n\
             Upgrade: websocket\r\n\
             Connection: keep-alive, Upgrade\r\n\
             Sec-WebSocket-Key: {KEY}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             {extra}\r\n"
        )
    }

    /// Send `request` to `upgrader` over a real socket; returns the
    /// server-side result and the raw response text.
    fn run(
        upgrader: Upgrader,
        response_headers: Headers,
        request: String,
    ) -> (Result<(Connection, HandshakeRequest), WsError>, String) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || {
            let mut s = TcpStream::connect(addr).unwrap();
            s.write_all(request.as_bytes()).unwrap();
            let mut reader = BufReader::new(s);
            let mut response = String::new();
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 || line == "\r\n" {
                    response.push_str(&line);
                    break;
                }
                response.push_str(&line);
            }
            if !response.starts_with("HTTP/1.1 101") {
                let mut rest = String::new();
                let _ = reader.read_to_string(&mut rest);
                response.push_str(&rest);
            }
            response
        });
        let (stream, _) = listener.accept().unwrap();
        let result = upgrader.upgrade_with(stream, &response_headers);
        if let Ok((conn, _)) = &result {
            conn.close();
        }
        let response = client.join().unwrap();
        (result, response)
    }

    fn status_of(result: &Result<(Connection, HandshakeRequest), WsError>) -> Option<u16> {
        match result {
            Err(WsError::Handshake(e)) => Some(e.status),
            _ => None,
        }
    }

    #[test]
    fn successful_upgrade() {
        let (result, response) = run(Upgrader::default(), Headers::new(), valid_request(""));
        let (conn, req) = result.unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(!response.contains("Sec-WebSocket-Extensions"));
        assert_eq!(req.target, "/ws");
        assert_eq!(conn.subprotocol(), None);
        assert!(!conn.compression_negotiated());
    }

    #[test]
    fn rejects_non_get() {
        let request = valid_request("").replacen("GET", "POST", 1);
        let (result, response) = run(Upgrader::default(), Headers::new(), request);
        assert_eq!(status_of(&result), Some(405));
        assert!(response.starts_with("HTTP/1.1 405"));
    }

    #[test]
    fn rejects_missing_headers() {
        let key_line = format!("Sec-WebSocket-Key: {KEY}");
        let cases = [
            ("Connection: keep-alive, Upgrade", "Connection: keep-alive"),
            ("Upgrade: websocket", "Upgrade: h2c"),
            ("Sec-WebSocket-Version: 13", "Sec-WebSocket-Version: 8"),
            (key_line.as_str(), "Sec-WebSocket-Key: "),
        ];
        for (from, to) in cases {
            let request = valid_request("").replace(from, to);
            let (result, response) = run(Upgrader::default(), Headers::new(), request);
            assert_eq!(status_of(&result), Some(400), "replacing {from:?}");
            assert!(response.contains("Sec-WebSocket-Version: 13"));
        }
    }

    #[test]
    fn default_origin_policy() {
        let (result, _) = run(Upgrader::default(), Headers::new(), valid_request("Origin: https://example.com\r\n"));
        assert!(result.is_ok());

        let (result, response) =
            run(Upgrader::default(), Headers::new(), valid_request("Origin: https://evil.test\r\n"));
        assert_eq!(status_of(&result), Some(403));
        assert!(response.starts_with("HTTP/1.1 403 Forbidden"));

        let permissive = Upgrader {
            check_origin: Some(Arc::new(|_| true)),
            ..Upgrader::default()
        };
        let (result, _) = run(permissive, Headers::new(), valid_request("Origin: https://evil.test\r\n"));
        assert!(result.is_ok());
    }

    #[test]
    fn application_extensions_header_is_server_error() {
        let mut headers = Headers::new();
        headers.push("Sec-WebSocket-Extensions", "x-custom");
        let (result, _) = run(Upgrader::default(), headers, valid_request(""));
        assert_eq!(status_of(&result), Some(500));
    }

    #[test]
    fn subprotocol_follows_server_preference() {
        let upgrader = Upgrader {
            subprotocols: vec!["v2.fns".into(), "v1.fns".into()],
            ..Upgrader::default()
        };
        let (result, response) = run(
            upgrader,
            Headers::new(),
            valid_request("Sec-WebSocket-Protocol: v1.fns, v2.fns\r\n"),
        );
        let (conn, _) = result.unwrap();
        assert_eq!(conn.subprotocol(), Some("v2.fns"));
        assert!(response.contains("Sec-WebSocket-Protocol: v2.fns\r\n"));
    }

    #[test]
    fn subprotocol_falls_back_to_response_header() {
        let mut headers = Headers::new();
        headers.push("Sec-WebSocket-Protocol", "app.v9");
        let (result, response) = run(
            Upgrader::default(),
            headers,
            valid_request("Sec-WebSocket-Protocol: app.v9\r\n"),
        );
        assert_eq!(result.unwrap().0.subprotocol(), Some("app.v9"));
        assert_eq!(response.matches("Sec-WebSocket-Protocol").count(), 1);
    }

    #[test]
    fn compression_requires_both_sides() {
        let offer = "Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits\r\n";

        let (result, response) = run(Upgrader::default(), Headers::new(), valid_request(offer));
        assert!(!result.unwrap().0.compression_negotiated());
        assert!(!response.contains("permessage-deflate"));

        let upgrader = Upgrader {
            enable_compression: true,
            ..Upgrader::default()
        };
        let (result, response) = run(upgrader.clone(), Headers::new(), valid_request(offer));
        assert!(result.unwrap().0.compression_negotiated());
        assert!(response.contains(
            "Sec-WebSocket-Extensions: permessage-deflate; server_no_context_takeover; client_no_context_takeover\r\n"
        ));

        let (result, _) = run(upgrader, Headers::new(), valid_request(""));
        assert!(!result.unwrap().0.compression_negotiated());
    }

    #[test]
    fn unsupported_deflate_parameters_are_declined() {
        let upgrader = Upgrader {
            enable_compression: true,
            ..Upgrader::default()
        };
        let offer = "Sec-WebSocket-Extensions: permessage-deflate; server_max_window_bits=10\r\n";
        let (result, response) = run(upgrader.clone(), Headers::new(), valid_request(offer));
        assert!(!result.unwrap().0.compression_negotiated());
        assert!(!response.contains("Sec-WebSocket-Extensions"));

        let offer = "Sec-WebSocket-Extensions: permessage-deflate; server_max_window_bits=10, \
                     permessage-deflate; client_no_context_takeover\r\n";
        let (result, response) = run(upgrader, Headers::new(), valid_request(offer));
        assert!(result.unwrap().0.compression_negotiated());
        assert!(response.contains(deflate::NO_CONTEXT_TAKEOVER_RESPONSE));
    }

    #[test]
    fn same_host_origin_cases() {
        let mut headers = Headers::new();
        headers.push("Host", "gw.local:8080");
        let mut req = HandshakeRequest {
            method: "GET".into(),
            target: "/".into(),
            headers,
            peer_addr: None,
        };
        assert!(same_host_origin(&req));
        req.headers.push("Origin", "http://GW.local:8080/app");
        assert!(same_host_origin(&req));

        let mut other = req.clone();
        other.headers = Headers::new();
        other.headers.push("Host", "gw.local:8080");
        other.headers.push("Origin", "null");
        assert!(!same_host_origin(&other));
    }
}
