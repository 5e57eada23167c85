//! One live WebSocket: message-level reads and writes over a `TcpStream`.
//!
//! # Concurrency
//!
//! A [`Connection`] is shared (`Arc<Connection>`) between the task that reads
//! it and any number of writers. Reading is single-consumer: at most one
//! [`MessageReader`] exists at a time, and a second `next_reader` call fails
//! with [`WsError::ReaderBusy`]. Writing goes through two locks:
//!
//! - the *writer slot*, held for a whole data message so fragments of two
//!   messages never interleave;
//! - the *write semaphore*, held for each frame so frames are written
//!   atomically. Control frames take only this lock and can therefore slip
//!   between the fragments of a data message.
//!
//! Both locks are acquired with the current write deadline; when the
//! deadline passes first the write fails with [`WsError::WriteTimeout`].
//!
//! # Failure latching
//!
//! The first fatal write error is latched and returned by every later
//! write. Writing a close frame latches [`WsError::CloseSent`]. Read errors
//! are not latched.

use std::fmt;
use std::io::{self, BufReader, Chain, Cursor, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::close::{build_close_payload, parse_close_payload, CloseCode};
use crate::deflate::{self, decompress_reader, Decompressor, MessageCompressor};
use crate::error::WsError;
use crate::frame::{self, apply_mask, apply_mask_at, encode_frame, OpCode, Role};
use crate::stream::{write_all_until, Deadline, DeadlineReader};

/// How long default handlers wait to write a pong or close echo.
pub const CONTROL_WRITE_WAIT: Duration = Duration::from_secs(1);

pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Unique 128-bit connection id, minted when the connection is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(ConnectionId)
    }
}

/// Data message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

impl MessageKind {
    pub fn opcode(self) -> OpCode {
        match self {
            MessageKind::Text => OpCode::Text,
            MessageKind::Binary => OpCode::Binary,
        }
    }

    fn from_opcode(op: OpCode) -> Option<Self> {
        match op {
            OpCode::Text => Some(MessageKind::Text),
            OpCode::Binary => Some(MessageKind::Binary),
            _ => None,
        }
    }
}

/// Ping and pong handlers receive the control payload.
pub type ControlHandler = Arc<dyn Fn(&Connection, &[u8]) -> Result<(), WsError> + Send + Sync>;
/// Close handlers receive the peer's code and reason.
pub type CloseHandler = Arc<dyn Fn(&Connection, u16, &str) -> Result<(), WsError> + Send + Sync>;

#[derive(Clone)]
struct Handlers {
    ping: ControlHandler,
    pong: ControlHandler,
    close: CloseHandler,
}

impl Default for Handlers {
    fn default() -> Self {
        Handlers {
            ping: Arc::new(reply_pong),
            pong: Arc::new(|_, _| Ok(())),
            close: Arc::new(default_close),
        }
    }
}

/// The default ping handler: answer with a pong carrying the same payload.
/// A close already sent or a pong that cannot be written in time is not an
/// error.
pub fn reply_pong(conn: &Connection, payload: &[u8]) -> Result<(), WsError> {
    let deadline = Instant::now() + CONTROL_WRITE_WAIT;
    match conn.write_control(OpCode::Pong, payload, Some(deadline)) {
        Err(WsError::CloseSent) => Ok(()),
        Err(e) if e.is_timeout() => Ok(()),
        other => other,
    }
}

fn default_close(conn: &Connection, code: u16, _text: &str) -> Result<(), WsError> {
    let deadline = Instant::now() + CONTROL_WRITE_WAIT;
    let _ = conn.write_control(OpCode::Close, &build_close_payload(code, ""), Some(deadline));
    Ok(())
}

/// Options fixed at construction. Produced by the upgrader or dialer.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub subprotocol: Option<String>,
    pub compression_negotiated: bool,
    pub compression_level: i32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
            subprotocol: None,
            compression_negotiated: false,
            compression_level: deflate::DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

type ReadStream = BufReader<Chain<Cursor<Vec<u8>>, DeadlineReader>>;

struct ReadState {
    stream: ReadStream,
    /// Unread payload bytes of the current data frame.
    frame_remaining: u64,
    /// FIN of the current data frame.
    frame_final: bool,
    mask: Option<[u8; 4]>,
    mask_pos: usize,
    /// A non-final data frame was seen; continuations are expected.
    in_message: bool,
    message_len: u64,
    message_compressed: bool,
}

#[derive(Debug, Clone)]
enum Latched {
    CloseSent,
    Timeout,
    Io(io::ErrorKind, String),
}

impl Latched {
    fn to_error(&self) -> WsError {
        match self {
            Latched::CloseSent => WsError::CloseSent,
            Latched::Timeout => WsError::WriteTimeout,
            Latched::Io(kind, msg) => WsError::Io(io::Error::new(*kind, msg.clone())),
        }
    }
}

struct WriteState {
    stream: TcpStream,
    latched: Option<Latched>,
}

fn lock_until<T>(m: &Mutex<T>, at: Option<Instant>) -> Option<MutexGuard<'_, T>> {
    match at {
        Some(at) => m.try_lock_until(at),
        None => Some(m.lock()),
    }
}

pub struct Connection {
    id: ConnectionId,
    role: Role,
    subprotocol: Option<String>,
    compression_negotiated: bool,
    peer_addr: Option<SocketAddr>,
    socket: TcpStream,

    read: Mutex<ReadState>,
    read_deadline: Arc<Deadline>,
    read_limit: AtomicU64,

    writer_slot: Mutex<()>,
    write: Mutex<WriteState>,
    write_deadline: Deadline,
    write_buffer_size: usize,
    write_compression: AtomicBool,
    compression_level: AtomicI32,

    handlers: RwLock<Handlers>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer_addr", &self.peer_addr)
            .field("subprotocol", &self.subprotocol)
            .field("compression", &self.compression_negotiated)
            .finish()
    }
}

impl Connection {
    /// Wrap an established stream. `leftover` holds bytes that were read
    /// past the end of the HTTP head and belong to the first frames.
    pub fn new(
        stream: TcpStream,
        role: Role,
        config: ConnectionConfig,
        leftover: Vec<u8>,
    ) -> io::Result<Connection> {
        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;
        let _ = stream.set_nodelay(true);

        let read_deadline = Arc::new(Deadline::default());
        let reader = DeadlineReader::new(stream.try_clone()?, Arc::clone(&read_deadline));
        let read_buffer = config.read_buffer_size.max(frame::MAX_FRAME_HEADER_SIZE);

        Ok(Connection {
            id: ConnectionId::new(),
            role,
            subprotocol: config.subprotocol,
            compression_negotiated: config.compression_negotiated,
            peer_addr: stream.peer_addr().ok(),
            read: Mutex::new(ReadState {
                stream: BufReader::with_capacity(read_buffer, Cursor::new(leftover).chain(reader)),
                frame_remaining: 0,
                frame_final: true,
                mask: None,
                mask_pos: 0,
                in_message: false,
                message_len: 0,
                message_compressed: false,
            }),
            read_deadline,
            read_limit: AtomicU64::new(0),
            writer_slot: Mutex::new(()),
            write: Mutex::new(WriteState {
                stream: stream.try_clone()?,
                latched: None,
            }),
            write_deadline: Deadline::default(),
            write_buffer_size: config.write_buffer_size.max(1),
            write_compression: AtomicBool::new(config.compression_negotiated),
            compression_level: AtomicI32::new(config.compression_level),
            handlers: RwLock::new(Handlers::default()),
            socket: stream,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    pub fn compression_negotiated(&self) -> bool {
        self.compression_negotiated
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    // -- settings --------------------------------------------------------

    pub fn set_read_deadline(&self, at: Option<Instant>) {
        self.read_deadline.set(at);
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        self.read_deadline.get()
    }

    pub fn set_write_deadline(&self, at: Option<Instant>) {
        self.write_deadline.set(at);
    }

    pub fn write_deadline(&self) -> Option<Instant> {
        self.write_deadline.get()
    }

    /// Maximum size of an incoming data message; 0 means unlimited.
    pub fn set_read_limit(&self, limit: u64) {
        self.read_limit.store(limit, Ordering::Relaxed);
    }

    /// Toggle compression of outgoing messages. Has no effect unless the
    /// peer negotiated permessage-deflate.
    pub fn enable_write_compression(&self, enable: bool) {
        self.write_compression.store(enable, Ordering::Relaxed);
    }

    pub fn set_compression_level(&self, level: i32) -> Result<(), WsError> {
        if !deflate::is_valid_level(level) {
            return Err(WsError::InvalidCompressionLevel(level));
        }
        self.compression_level.store(level, Ordering::Relaxed);
        Ok(())
    }

    /// `None` restores the default (reply with a pong).
    pub fn set_ping_handler(&self, handler: Option<ControlHandler>) {
        self.handlers.write().ping = handler.unwrap_or_else(|| Arc::new(reply_pong));
    }

    /// `None` restores the default (ignore).
    pub fn set_pong_handler(&self, handler: Option<ControlHandler>) {
        self.handlers.write().pong = handler.unwrap_or_else(|| Arc::new(|_, _| Ok(())));
    }

    /// `None` restores the default (echo the close code).
    pub fn set_close_handler(&self, handler: Option<CloseHandler>) {
        self.handlers.write().close = handler.unwrap_or_else(|| Arc::new(default_close));
    }

    // -- reading ---------------------------------------------------------

    /// Wait for the next data message and return a reader over its body.
    /// Control frames that arrive first are dispatched to their handlers.
    pub fn next_reader(&self) -> Result<MessageReader<'_>, WsError> {
        let mut state = self.read.try_lock().ok_or(WsError::ReaderBusy)?;
        loop {
            let op = self.advance_frame(&mut state)?;
            if let Some(kind) = MessageKind::from_opcode(op) {
                let compressed = state.message_compressed;
                let frames = FrameReader { conn: self, state };
                let inner = if compressed {
                    ReaderInner::Deflate(Box::new(decompress_reader(frames)))
                } else {
                    ReaderInner::Plain(frames)
                };
                return Ok(MessageReader { kind, inner });
            }
        }
    }

    /// Read a whole data message into memory.
    pub fn read_message(&self) -> Result<(MessageKind, Vec<u8>), WsError> {
        let mut reader = self.next_reader()?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data).map_err(WsError::from_io)?;
        Ok((reader.kind(), data))
    }

    /// Read the next frame header, apply the connection-level checks and
    /// handle control frames. For data frames the payload is left unread.
    fn advance_frame(&self, st: &mut ReadState) -> Result<OpCode, WsError> {
        if st.frame_remaining > 0 {
            let skipped = io::copy(&mut (&mut st.stream).take(st.frame_remaining), &mut io::sink())?;
            st.frame_remaining -= skipped;
            if st.frame_remaining > 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }

        let header = frame::read_header(&mut st.stream).map_err(|e| self.fail_read(e))?;
        self.check_header(st, &header).map_err(|e| self.fail_read(e))?;

        if header.opcode.is_control() {
            let mut payload = vec![0u8; header.payload_len as usize];
            st.stream.read_exact(&mut payload)?;
            if let Some(key) = header.mask {
                apply_mask(&mut payload, &key);
            }
            let handlers = self.handlers.read().clone();
            match header.opcode {
                OpCode::Ping => (handlers.ping)(self, &payload)?,
                OpCode::Pong => (handlers.pong)(self, &payload)?,
                _ => {
                    let close = parse_close_payload(&payload).map_err(|e| self.fail_read(e))?;
                    tracing::debug!(target: "ws", conn_id = %self.id, code = close.code, "peer sent close");
                    (handlers.close)(self, close.code, &close.text)?;
                    return Err(WsError::Close(close));
                }
            }
            return Ok(header.opcode);
        }

        if header.opcode != OpCode::Continuation {
            st.message_len = 0;
            st.message_compressed = header.rsv1;
        }
        st.message_len = st.message_len.saturating_add(header.payload_len);
        let limit = self.read_limit.load(Ordering::Relaxed);
        if limit > 0 && st.message_len > limit {
            self.write_close_best_effort(CloseCode::MESSAGE_TOO_BIG, "");
            return Err(WsError::ReadLimit);
        }

        st.frame_remaining = header.payload_len;
        st.frame_final = header.fin;
        st.mask = header.mask;
        st.mask_pos = 0;
        st.in_message = !header.fin;
        Ok(header.opcode)
    }

    fn check_header(&self, st: &ReadState, header: &frame::FrameHeader) -> Result<(), WsError> {
        if header.rsv1 && !(self.compression_negotiated && header.opcode.is_data()) {
            return Err(WsError::protocol("unexpected RSV1 bit"));
        }
        match header.opcode {
            OpCode::Continuation if !st.in_message => {
                return Err(WsError::protocol("continuation after final frame"));
            }
            OpCode::Text | OpCode::Binary if st.in_message => {
                return Err(WsError::protocol("data frame before final frame of message"));
            }
            _ => {}
        }
        match (self.role, header.mask.is_some()) {
            (Role::Server, false) => Err(WsError::protocol("unmasked client frame")),
            (Role::Client, true) => Err(WsError::protocol("masked server frame")),
            _ => Ok(()),
        }
    }

    /// Protocol errors are answered with a 1002 close before being returned.
    fn fail_read(&self, err: WsError) -> WsError {
        if let WsError::Protocol(msg) = &err {
            tracing::debug!(target: "ws", conn_id = %self.id, error = %msg, "protocol error");
            self.write_close_best_effort(CloseCode::PROTOCOL_ERROR, msg);
        }
        err
    }

    // -- writing ---------------------------------------------------------

    fn frame_mask(&self) -> Option<[u8; 4]> {
        match self.role {
            Role::Client => Some(rand::random::<[u8; 4]>()),
            Role::Server => None,
        }
    }

    /// Write one encoded frame under the write semaphore.
    fn write_frame_bytes(&self, bytes: &[u8], at: Option<Instant>, closing: bool) -> Result<(), WsError> {
        let mut w = lock_until(&self.write, at).ok_or(WsError::WriteTimeout)?;
        if let Some(latched) = &w.latched {
            return Err(latched.to_error());
        }
        if let Err(e) = write_all_until(&mut w.stream, bytes, at) {
            let latched = if e.kind() == io::ErrorKind::TimedOut {
                Latched::Timeout
            } else {
                Latched::Io(e.kind(), e.to_string())
            };
            tracing::debug!(target: "ws", conn_id = %self.id, error = %e, "write failed");
            let err = latched.to_error();
            w.latched = Some(latched);
            return Err(err);
        }
        if closing {
            w.latched = Some(Latched::CloseSent);
        }
        Ok(())
    }

    /// Write a control frame in one piece. `payload` must not exceed 125
    /// bytes. Writing a close frame makes every later write fail with
    /// [`WsError::CloseSent`].
    pub fn write_control(&self, op: OpCode, payload: &[u8], deadline: Option<Instant>) -> Result<(), WsError> {
        if !op.is_control() {
            return Err(WsError::BadMessageType);
        }
        if payload.len() > frame::MAX_CONTROL_PAYLOAD {
            return Err(WsError::InvalidControlFrame);
        }
        let bytes = encode_frame(op, payload, true, false, self.frame_mask());
        self.write_frame_bytes(&bytes, deadline, op == OpCode::Close)
    }

    /// Send a close frame with `code` and `text` (truncated to fit).
    pub fn write_close(&self, code: u16, text: &str, deadline: Option<Instant>) -> Result<(), WsError> {
        self.write_control(OpCode::Close, &build_close_payload(code, text), deadline)
    }

    fn write_close_best_effort(&self, code: u16, text: &str) {
        let _ = self.write_close(code, text, Some(Instant::now() + CONTROL_WRITE_WAIT));
    }

    /// Start a data message. The returned writer holds the writer slot until
    /// it is closed or dropped.
    pub fn next_writer(&self, kind: MessageKind) -> Result<MessageWriter<'_>, WsError> {
        self.next_writer_until(kind, self.write_deadline.get())
    }

    /// Like [`next_writer`](Self::next_writer) with an explicit deadline in
    /// place of the connection's write deadline.
    pub fn next_writer_until(&self, kind: MessageKind, deadline: Option<Instant>) -> Result<MessageWriter<'_>, WsError> {
        let slot = lock_until(&self.writer_slot, deadline).ok_or(WsError::WriteTimeout)?;
        if let Some(latched) = &self.write.lock().latched {
            return Err(latched.to_error());
        }
        let compressor = if self.compression_negotiated && self.write_compression.load(Ordering::Relaxed) {
            Some(MessageCompressor::new(self.compression_level.load(Ordering::Relaxed)))
        } else {
            None
        };
        Ok(MessageWriter {
            conn: self,
            _slot: slot,
            opcode: kind.opcode(),
            compressed: compressor.is_some(),
            compressor,
            buf: Vec::with_capacity(self.write_buffer_size + frame::MAX_FRAME_HEADER_SIZE),
            frame_size: self.write_buffer_size,
            deadline,
            done: false,
        })
    }

    /// Write a whole message. Control opcodes go through
    /// [`write_control`](Self::write_control) with the write deadline.
    pub fn write_message(&self, op: OpCode, data: &[u8]) -> Result<(), WsError> {
        self.write_message_until(op, data, self.write_deadline.get())
    }

    pub fn write_message_until(&self, op: OpCode, data: &[u8], deadline: Option<Instant>) -> Result<(), WsError> {
        let kind = match op {
            OpCode::Text => MessageKind::Text,
            OpCode::Binary => MessageKind::Binary,
            OpCode::Continuation => return Err(WsError::BadMessageType),
            _ => return self.write_control(op, data, deadline),
        };
        let mut w = self.next_writer_until(kind, deadline)?;
        w.push(data)?;
        w.close()
    }

    // -- socket ----------------------------------------------------------

    /// Stop reading: a blocked reader wakes up with EOF. Writes still work.
    pub fn shutdown_read(&self) {
        let _ = self.socket.shutdown(Shutdown::Read);
    }

    /// Close the underlying socket in both directions.
    pub fn close(&self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

/// Reads the payload of one data message frame by frame.
pub struct FrameReader<'a> {
    conn: &'a Connection,
    state: MutexGuard<'a, ReadState>,
}

impl Read for FrameReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let st = &mut *self.state;
            if st.frame_remaining > 0 {
                let want = (buf.len() as u64).min(st.frame_remaining) as usize;
                let n = st.stream.read(&mut buf[..want])?;
                if n == 0 && want > 0 {
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
                }
                st.frame_remaining -= n as u64;
                if let Some(key) = st.mask {
                    st.mask_pos = apply_mask_at(&mut buf[..n], &key, st.mask_pos);
                }
                return Ok(n);
            }
            if st.frame_final || buf.is_empty() {
                return Ok(0);
            }
            self.conn
                .advance_frame(&mut self.state)
                .map_err(WsError::into_io)?;
        }
    }
}

enum ReaderInner<'a> {
    Plain(FrameReader<'a>),
    Deflate(Box<Decompressor<FrameReader<'a>>>),
}

/// Body of one incoming data message. Errors crossing the `Read` boundary
/// can be recovered with [`WsError::from_io`].
pub struct MessageReader<'a> {
    kind: MessageKind,
    inner: ReaderInner<'a>,
}

impl MessageReader<'_> {
    pub fn kind(&self) -> MessageKind {
        self.kind
    }
}

impl Read for MessageReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            ReaderInner::Plain(r) => r.read(buf),
            ReaderInner::Deflate(r) => r.read(buf),
        }
    }
}

/// Writes one data message, fragmenting it into frames of at most
/// `write_buffer_size` payload bytes. Call [`close`](Self::close) to send
/// the final frame; dropping the writer finishes it best-effort.
pub struct MessageWriter<'a> {
    conn: &'a Connection,
    _slot: MutexGuard<'a, ()>,
    opcode: OpCode,
    compressed: bool,
    compressor: Option<MessageCompressor>,
    buf: Vec<u8>,
    frame_size: usize,
    deadline: Option<Instant>,
    done: bool,
}

impl MessageWriter<'_> {
    fn emit(&mut self, start: usize, end: usize, fin: bool) -> Result<(), WsError> {
        let rsv1 = self.compressed && self.opcode != OpCode::Continuation;
        let bytes = encode_frame(self.opcode, &self.buf[start..end], fin, rsv1, self.conn.frame_mask());
        self.opcode = OpCode::Continuation;
        self.conn.write_frame_bytes(&bytes, self.deadline, false)
    }

    /// Send every full frame that is followed by more data. The last frame
    /// stays buffered so that `finish` can mark it final.
    fn emit_full_frames(&mut self) -> Result<(), WsError> {
        let mut start = 0;
        let mut result = Ok(());
        while self.buf.len() - start > self.frame_size {
            result = self.emit(start, start + self.frame_size, false);
            if result.is_err() {
                break;
            }
            start += self.frame_size;
        }
        self.buf.drain(..start);
        result
    }

    fn push(&mut self, data: &[u8]) -> Result<(), WsError> {
        if self.done {
            return Err(WsError::CloseSent);
        }
        let result = self.push_inner(data);
        if result.is_err() {
            self.done = true;
        }
        result
    }

    fn push_inner(&mut self, data: &[u8]) -> Result<(), WsError> {
        match &mut self.compressor {
            Some(c) => {
                c.write(data, &mut self.buf)?;
                self.emit_full_frames()
            }
            None => {
                for chunk in data.chunks(self.frame_size) {
                    self.buf.extend_from_slice(chunk);
                    self.emit_full_frames()?;
                }
                Ok(())
            }
        }
    }

    fn finish(&mut self) -> Result<(), WsError> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        if let Some(c) = self.compressor.take() {
            c.finish(&mut self.buf)?;
        }
        self.emit_full_frames()?;
        self.emit(0, self.buf.len(), true)
    }

    /// Flush buffered data and send the final frame.
    pub fn close(mut self) -> Result<(), WsError> {
        self.finish()
    }
}

impl Write for MessageWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.push(data).map_err(WsError::into_io)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MessageWriter<'_> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}
