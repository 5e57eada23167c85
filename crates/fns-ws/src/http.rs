//! Minimal HTTP/1.1 head parsing for the opening handshake.

use std::io::{self, BufRead, Read, Write};

use crate::error::{HandshakeError, WsError};

/// Upper bound for a request or response head (start line + headers).
pub const MAX_HEAD_SIZE: usize = 8 * 1024;
const MAX_HEADERS: usize = 100;

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Comma-separated tokens across every value of `name`, trimmed.
    pub fn tokens<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// True if any token of `name` equals `token`, ignoring ASCII case.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.tokens(name).any(|t| t.eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Headers(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Headers,
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

fn bad_request(msg: &str) -> WsError {
    WsError::Handshake(HandshakeError::new(400, msg))
}

/// Read start line and header lines up to the blank line.
fn read_head_lines<R: BufRead>(reader: &mut R) -> Result<(String, Headers), WsError> {
    let mut budget = MAX_HEAD_SIZE;
    let mut next_line = |reader: &mut R| -> Result<String, WsError> {
        let mut line = String::new();
        let n = reader.by_ref().take(budget as u64).read_line(&mut line)?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        if !line.ends_with('\n') {
            if n < budget {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            return Err(WsError::Handshake(HandshakeError::new(
                431,
                "request head too large",
            )));
        }
        budget -= n;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    };

    let start = next_line(reader)?;
    let mut headers = Headers::new();
    loop {
        let line = next_line(reader)?;
        if line.is_empty() {
            break;
        }
        if headers.0.len() >= MAX_HEADERS {
            return Err(bad_request("too many headers"));
        }
        match line.split_once(':') {
            Some((name, value)) if !name.trim().is_empty() => {
                headers.push(name.trim(), value.trim());
            }
            _ => return Err(bad_request("malformed header line")),
        }
    }
    Ok((start, headers))
}

pub fn read_request_head<R: BufRead>(reader: &mut R) -> Result<RequestHead, WsError> {
    let (start, headers) = read_head_lines(reader)?;
    let mut parts = start.split(' ').filter(|p| !p.is_empty());
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version), None) if version.starts_with("HTTP/") => {
            Ok(RequestHead {
                method: method.to_string(),
                target: target.to_string(),
                version: version.to_string(),
                headers,
            })
        }
        _ => Err(bad_request("malformed request line")),
    }
}

pub fn read_response_head<R: BufRead>(reader: &mut R) -> Result<ResponseHead, WsError> {
    let (start, headers) = read_head_lines(reader)?;
    let mut parts = start.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let status = parts.next().and_then(|s| s.parse::<u16>().ok());
    match status {
        Some(status) if version.starts_with("HTTP/") => Ok(ResponseHead {
            status,
            reason: parts.next().unwrap_or_default().to_string(),
            headers,
        }),
        _ => Err(WsError::Handshake(HandshakeError::new(
            502,
            "malformed status line",
        ))),
    }
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        400 => "Bad Request",
        403 => "Forbidden",
        405 => "Method Not Allowed",
        426 => "Upgrade Required",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Error",
    }
}

/// Write a plain-text error response for a rejected handshake.
pub fn write_error_response<W: Write>(writer: &mut W, err: &HandshakeError) -> io::Result<()> {
    let body = status_text(err.status);
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Sec-WebSocket-Version: 13\r\n\
         X-Content-Type-Options: nosniff\r\n",
        err.status, body
    );
    if err.status == 405 {
        head.push_str("Allow: GET\r\n");
    }
    let text = format!("{}\n", err.message);
    head.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        text.len()
    ));
    writer.write_all(head.as_bytes())?;
    writer.write_all(text.as_bytes())?;
    writer.flush()
}
