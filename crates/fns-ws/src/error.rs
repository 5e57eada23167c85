//! Error types for the WebSocket layer.
//!
//! Protocol-level variants carry the close code the peer should observe
//! (see [`WsError::close_code`]); I/O variants keep the original
//! [`std::io::Error`] so callers can tell timeouts from resets.

use std::fmt;
use std::io;

use crate::close::CloseCode;

/// A close frame received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseError {
    pub code: u16,
    pub text: String,
}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.text.is_empty() {
            write!(f, "close {}", self.code)
        } else {
            write!(f, "close {} ({})", self.code, self.text)
        }
    }
}

/// A failed opening handshake. `status` is the HTTP status sent (server
/// role) or received (client role).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeError {
    pub status: u16,
    pub message: String,
}

impl HandshakeError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        HandshakeError {
            status,
            message: message.into(),
        }
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "websocket: {} ({})", self.message, self.status)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("websocket: io: {0}")]
    Io(#[from] io::Error),

    #[error("websocket: protocol error: {0}")]
    Protocol(String),

    #[error("websocket: invalid payload data: {0}")]
    InvalidData(String),

    #[error("websocket: read limit exceeded")]
    ReadLimit,

    #[error("websocket: {0}")]
    Close(CloseError),

    #[error("websocket: close sent")]
    CloseSent,

    #[error("websocket: write timeout")]
    WriteTimeout,

    #[error("websocket: concurrent reader")]
    ReaderBusy,

    #[error("websocket: bad message type")]
    BadMessageType,

    #[error("websocket: invalid control frame")]
    InvalidControlFrame,

    #[error("websocket: invalid compression level {0}")]
    InvalidCompressionLevel(i32),

    #[error("{0}")]
    Handshake(HandshakeError),
}

impl WsError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        WsError::Protocol(msg.into())
    }

    /// The close code implied by this error when it is reported to the peer.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            WsError::Protocol(_) => Some(CloseCode::PROTOCOL_ERROR),
            WsError::InvalidData(_) => Some(CloseCode::INVALID_DATA),
            WsError::ReadLimit => Some(CloseCode::MESSAGE_TOO_BIG),
            WsError::Close(c) => Some(c.code),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            WsError::WriteTimeout => true,
            WsError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// True when the peer went away without a close frame.
    pub fn is_eof(&self) -> bool {
        match self {
            WsError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// Recover a `WsError` that travelled through an `io::Read` boundary.
    pub fn from_io(err: io::Error) -> Self {
        if !err.get_ref().map_or(false, |inner| inner.is::<WsError>()) {
            return WsError::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<WsError>()) {
            Some(Ok(ws)) => *ws,
            _ => WsError::protocol("unrecognized wrapped error"),
        }
    }

    /// Wrap into an `io::Error` for use inside `Read`/`Write` impls.
    /// Plain I/O errors pass through untouched so their kind survives.
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            WsError::Io(e) => e,
            other => {
                let kind = if other.is_timeout() {
                    io::ErrorKind::TimedOut
                } else {
                    io::ErrorKind::Other
                };
                io::Error::new(kind, other)
            }
        }
    }
}
