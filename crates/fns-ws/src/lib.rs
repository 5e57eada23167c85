//! RFC 6455 WebSocket for blocking sockets.
//!
//! - [`frame`]: frame header codec and masking
//! - [`close`]: close codes and close payloads
//! - [`deflate`]: permessage-deflate, no-context-takeover
//! - [`Connection`]: message-level reads/writes, deadlines, control handlers
//! - [`Upgrader`]: server handshake
//! - [`Dialer`]: client handshake

pub mod client;
pub mod close;
pub mod conn;
pub mod deflate;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod http;
pub mod stream;

pub use client::Dialer;
pub use close::CloseCode;
pub use conn::{
    CloseHandler, Connection, ConnectionConfig, ConnectionId, ControlHandler, MessageKind, MessageReader,
    MessageWriter,
};
pub use error::{CloseError, HandshakeError, WsError};
pub use frame::{OpCode, Role};
pub use handshake::{same_host_origin, HandshakeRequest, OriginCheck, Upgrader};
pub use http::Headers;
