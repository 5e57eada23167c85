//! Client side of the opening handshake.

use std::io::{BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::conn::{Connection, ConnectionConfig, DEFAULT_BUFFER_SIZE};
use crate::deflate;
use crate::error::{HandshakeError, WsError};
use crate::frame::Role;
use crate::handshake::compute_accept_key;
use crate::http::{self, Headers, ResponseHead};

/// Opens client-role connections.
#[derive(Debug, Clone)]
pub struct Dialer {
    pub handshake_timeout: Option<Duration>,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub subprotocols: Vec<String>,
    pub enable_compression: bool,
    /// Extra request headers, e.g. `Origin` or device headers.
    pub headers: Headers,
}

impl Default for Dialer {
    fn default() -> Self {
        Dialer {
            handshake_timeout: Some(Duration::from_secs(45)),
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
            subprotocols: Vec::new(),
            enable_compression: false,
            headers: Headers::new(),
        }
    }
}

/// Split `ws://host[:port][/path]` into `(host:port, path)`.
fn parse_url(url: &str) -> Result<(String, String), WsError> {
    let rest = url
        .strip_prefix("ws://")
        .ok_or_else(|| WsError::Handshake(HandshakeError::new(400, "url scheme must be ws")))?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return Err(WsError::Handshake(HandshakeError::new(400, "url has no host")));
    }
    let authority = if authority.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
        authority.to_string()
    } else {
        format!("{}:80", authority)
    };
    Ok((authority, path.to_string()))
}

impl Dialer {
    /// Connect to `url` and perform the handshake.
    pub fn dial(&self, url: &str) -> Result<(Connection, ResponseHead), WsError> {
        let (authority, path) = parse_url(url)?;
        let addr = authority
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| WsError::Handshake(HandshakeError::new(400, "host did not resolve")))?;
        let stream = match self.handshake_timeout {
            Some(t) => TcpStream::connect_timeout(&addr, t)?,
            None => TcpStream::connect(addr)?,
        };
        self.handshake(stream, &authority, &path)
    }

    /// Perform the handshake over an already connected stream.
    pub fn handshake(
        &self,
        stream: TcpStream,
        host: &str,
        path: &str,
    ) -> Result<(Connection, ResponseHead), WsError> {
        stream.set_read_timeout(self.handshake_timeout)?;
        stream.set_write_timeout(self.handshake_timeout)?;

        let key = BASE64.encode(rand::random::<[u8; 16]>());
        let mut request = format!(
            "GET {path} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: 13\r\n"
        );
        if !self.subprotocols.is_empty() {
            request.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", self.subprotocols.join(", ")));
        }
        if self.enable_compression {
            request.push_str("Sec-WebSocket-Extensions: permessage-deflate; server_no_context_takeover; client_no_context_takeover\r\n");
        }
        for (name, value) in self.headers.iter() {
            request.push_str(&format!("{}: {}\r\n", name, value));
        }
        request.push_str("\r\n");
        (&stream).write_all(request.as_bytes())?;

        let mut reader = BufReader::new(stream.try_clone()?);
        let response = http::read_response_head(&mut reader)?;
        let leftover = reader.buffer().to_vec();
        drop(reader);

        let fail = |msg: &str| WsError::Handshake(HandshakeError::new(response.status, msg));
        if response.status != 101 {
            return Err(fail("bad handshake"));
        }
        if !response.headers.has_token("Upgrade", "websocket")
            || !response.headers.has_token("Connection", "upgrade")
        {
            return Err(fail("missing upgrade headers"));
        }
        if response.headers.get("Sec-WebSocket-Accept") != Some(compute_accept_key(&key).as_str()) {
            return Err(fail("bad Sec-WebSocket-Accept"));
        }
        let compression_negotiated = deflate::offers_deflate(&deflate::parse_extensions(
            response.headers.get_all("Sec-WebSocket-Extensions"),
        ));
        if compression_negotiated && !self.enable_compression {
            return Err(fail("server selected an extension that was not offered"));
        }

        let config = ConnectionConfig {
            read_buffer_size: self.read_buffer_size,
            write_buffer_size: self.write_buffer_size,
            subprotocol: response.headers.get("Sec-WebSocket-Protocol").map(str::to_string),
            compression_negotiated,
            compression_level: deflate::DEFAULT_COMPRESSION_LEVEL,
        };
        let conn = Connection::new(stream, Role::Client, config, leftover)?;
        Ok((conn, response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::OpCode;
    use crate::handshake::Upgrader;
    use crate::MessageKind;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn url_parsing() {
        assert_eq!(
            parse_url("ws://127.0.0.1:9000/ws").unwrap(),
            ("127.0.0.1:9000".to_string(), "/ws".to_string())
        );
        assert_eq!(
            parse_url("ws://example.com").unwrap(),
            ("example.com:80".to_string(), "/".to_string())
        );
        assert!(parse_url("http://example.com").is_err());
        assert!(parse_url("ws:///x").is_err());
    }

    #[test]
    fn dial_and_echo_through_upgrader() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let upgrader = Upgrader {
                enable_compression: true,
                subprotocols: vec!["fns".into()],
                ..Upgrader::default()
            };
            let (conn, req) = upgrader.upgrade(stream).unwrap();
            assert_eq!(req.header("X-Fns-Device-Id"), Some("dev-1"));
            let (kind, data) = conn.read_message().unwrap();
            conn.write_message(kind.opcode(), &data).unwrap();
        });

        let mut headers = Headers::new();
        headers.push("X-Fns-Device-Id", "dev-1");
        let dialer = Dialer {
            enable_compression: true,
            subprotocols: vec!["fns".into()],
            headers,
            ..Dialer::default()
        };
        let (conn, response) = dialer.dial(&format!("ws://{}/ws", addr)).unwrap();
        assert_eq!(response.status, 101);
        assert!(conn.compression_negotiated());
        assert_eq!(conn.subprotocol(), Some("fns"));

        conn.write_message(OpCode::Text, b"{\"hello\":\"world\"}").unwrap();
        let (kind, data) = conn.read_message().unwrap();
        assert_eq!(kind, MessageKind::Text);
        assert_eq!(data, b"{\"hello\":\"world\"}");
        server.join().unwrap();
    }

    #[test]
    fn rejected_handshake_reports_status() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let upgrader = Upgrader {
                check_origin: Some(std::sync::Arc::new(|_| false)),
                ..Upgrader::default()
            };
            assert!(upgrader.upgrade(stream).is_err());
        });
        let err = Dialer::default().dial(&format!("ws://{}/", addr)).unwrap_err();
        match err {
            WsError::Handshake(e) => assert_eq!(e.status, 403),
            other => panic!("unexpected {other:?}"),
        }
        server.join().unwrap();
    }
}
