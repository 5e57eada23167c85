//! Inter-node RPC.
//!
//! ## Wire Layout
//!
//! Every message is a `u32` big-endian length followed by that many bytes of
//! JSON ([`Wire`]). Frames above [`MAX_RPC_FRAME`] are rejected.
//!
//! ## Handshake
//!
//! ```text
//!   client                         server
//!     |  <------ Hello{nonce} -------  |
//!     |  --- Auth{node, digest} ---->  |   digest = HMAC-SHA256(cookie, nonce)
//!     |  <------ Welcome{node} ------  |   (mismatch: connection dropped)
//!     |  ------- Call{id,...} ------>  |
//!     |  <------ Reply{id,...} ------  |
//! ```
//!
//! A session carries one call at a time. The client keeps idle sessions per
//! remote node and reuses them.

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::context::RequestContext;
use crate::endpoint::Endpoints;
use crate::envelope::Header;
use crate::error::CodeError;
use crate::node::NodeId;
use crate::send::Sender;

type HmacSha256 = Hmac<Sha256>;

/// Largest accepted RPC frame body.
pub const MAX_RPC_FRAME: usize = 16 * 1024 * 1024;

/// Deadline for the server side of the handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("rpc io: {0}")]
    Io(#[from] io::Error),

    #[error("rpc frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rpc frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("rpc authentication failed")]
    AuthFailed,

    #[error("rpc peer is {actual}, expected {expected}")]
    WrongNode { expected: String, actual: String },

    #[error("unexpected rpc message: {0}")]
    Unexpected(String),
}

impl RpcError {
    fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Io(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock))
    }

    /// The peer had already closed the link.
    fn is_closed_link(&self) -> bool {
        matches!(
            self,
            RpcError::Io(e) if matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            )
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Wire {
    Hello {
        nonce: String,
    },
    Auth {
        node: String,
        digest: String,
    },
    Welcome {
        node: String,
    },
    Call {
        id: u64,
        service: String,
        #[serde(rename = "fn")]
        fn_name: String,
        #[serde(default)]
        argument: Value,
        #[serde(default, skip_serializing_if = "Header::is_empty")]
        header: Header,
    },
    Reply {
        id: u64,
        succeed: bool,
        #[serde(default)]
        result: Value,
    },
}

impl Wire {
    fn kind(&self) -> &'static str {
        match self {
            Wire::Hello { .. } => "hello",
            Wire::Auth { .. } => "auth",
            Wire::Welcome { .. } => "welcome",
            Wire::Call { .. } => "call",
            Wire::Reply { .. } => "reply",
        }
    }
}

pub fn write_wire<W: Write>(w: &mut W, msg: &Wire) -> Result<(), RpcError> {
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_RPC_FRAME {
        return Err(RpcError::FrameTooLarge(body.len()));
    }
    w.write_all(&(body.len() as u32).to_be_bytes())?;
    w.write_all(&body)?;
    w.flush()?;
    Ok(())
}

pub fn read_wire<R: Read>(r: &mut R) -> Result<Wire, RpcError> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_RPC_FRAME {
        return Err(RpcError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

fn cookie_digest(cookie: &str, nonce: &str) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(cookie.as_bytes()).ok()?;
    mac.update(nonce.as_bytes());
    Some(mac)
}

/// Base64 HMAC-SHA256 of `nonce` keyed by `cookie`.
pub fn sign_nonce(cookie: &str, nonce: &str) -> String {
    cookie_digest(cookie, nonce)
        .map(|mac| BASE64.encode(mac.finalize().into_bytes()))
        .unwrap_or_default()
}

/// Constant-time check of a digest produced by [`sign_nonce`].
pub fn verify_nonce(cookie: &str, nonce: &str, digest: &str) -> bool {
    let Ok(bytes) = BASE64.decode(digest) else {
        return false;
    };
    cookie_digest(cookie, nonce).is_some_and(|mac| mac.verify_slice(&bytes).is_ok())
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

struct ServerShared {
    node: NodeId,
    cookie: String,
    endpoints: Arc<Endpoints>,
    sender: Sender,
    shutdown: AtomicBool,
    sessions: Mutex<FxHashMap<u64, TcpStream>>,
    next_session: AtomicU64,
}

/// Accepts sessions from other nodes and dispatches their calls into the
/// local endpoints with `internal = true`.
pub struct RpcServer {
    shared: Arc<ServerShared>,
    local_addr: std::net::SocketAddr,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl RpcServer {
    pub fn start(
        listener: TcpListener,
        node: NodeId,
        cookie: String,
        endpoints: Arc<Endpoints>,
        sender: Sender,
    ) -> io::Result<RpcServer> {
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        let shared = Arc::new(ServerShared {
            node,
            cookie,
            endpoints,
            sender,
            shutdown: AtomicBool::new(false),
            sessions: Mutex::new(FxHashMap::default()),
            next_session: AtomicU64::new(1),
        });
        let accept_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("fns-rpc-accept-{}", local_addr.port()))
            .spawn(move || accept_loop(listener, accept_shared))?;
        info!(target: "rpc", node = %shared.node, addr = %local_addr, "rpc listener started");
        Ok(RpcServer {
            shared,
            local_addr,
            accept: Mutex::new(Some(handle)),
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Stop accepting, drop every open session and wait for the accept
    /// thread. Idempotent.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept.lock().take() {
            let _ = handle.join();
        }
        for (_, stream) in self.shared.sessions.lock().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>) {
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }

        match listener.accept() {
            Ok((stream, addr)) => {
                let session = Arc::clone(&shared);
                let spawned = std::thread::Builder::new()
                    .name("fns-rpc-session".to_string())
                    .spawn(move || run_session(stream, session));
                if let Err(e) = spawned {
                    warn!(target: "rpc", peer = %addr, error = %e, "failed to spawn rpc session");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                debug!(target: "rpc", error = %e, "rpc accept error");
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

fn run_session(stream: TcpStream, shared: Arc<ServerShared>) {
    let session_id = shared.next_session.fetch_add(1, Ordering::Relaxed);
    let peer = stream.peer_addr().ok();
    if let Err(e) = stream.set_nonblocking(false) {
        debug!(target: "rpc", error = %e, "rpc session setup failed");
        return;
    }
    match stream.try_clone() {
        Ok(handle) => {
            shared.sessions.lock().insert(session_id, handle);
        }
        Err(e) => {
            debug!(target: "rpc", error = %e, "rpc session setup failed");
            return;
        }
    }
    // Register before checking the flag so stop() either sees the session or
    // the session sees the flag.
    if !shared.shutdown.load(Ordering::SeqCst) {
        match serve_session(&stream, &shared) {
            Ok(remote) => debug!(target: "rpc", remote = %remote, "rpc session closed"),
            Err(RpcError::AuthFailed) => {
                warn!(target: "rpc", peer = ?peer, "rpc peer failed cookie authentication")
            }
            Err(e) => debug!(target: "rpc", peer = ?peer, error = %e, "rpc session ended"),
        }
    }
    shared.sessions.lock().remove(&session_id);
    let _ = stream.shutdown(Shutdown::Both);
}

/// Authenticate the peer, then serve calls until it hangs up.
fn serve_session(stream: &TcpStream, shared: &ServerShared) -> Result<String, RpcError> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream.try_clone()?);

    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    let nonce = BASE64.encode(rand::random::<[u8; 32]>());
    write_wire(&mut writer, &Wire::Hello { nonce: nonce.clone() })?;
    let remote = match read_wire(&mut reader)? {
        Wire::Auth { node, digest } => {
            if !verify_nonce(&shared.cookie, &nonce, &digest) {
                return Err(RpcError::AuthFailed);
            }
            node
        }
        other => return Err(RpcError::Unexpected(other.kind().to_string())),
    };
    write_wire(
        &mut writer,
        &Wire::Welcome {
            node: shared.node.to_string(),
        },
    )?;
    stream.set_read_timeout(None)?;
    debug!(target: "rpc", remote = %remote, "rpc session authenticated");

    loop {
        let msg = match read_wire(&mut reader) {
            Ok(msg) => msg,
            Err(RpcError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(remote),
            Err(e) => return Err(e),
        };
        let (id, service, fn_name, argument, header) = match msg {
            Wire::Call {
                id,
                service,
                fn_name,
                argument,
                header,
            } => (id, service, fn_name, argument, header),
            other => return Err(RpcError::Unexpected(other.kind().to_string())),
        };

        let mut ctx = RequestContext::new(true).with_sender(shared.sender.clone());
        ctx.header = header;
        let reply = match shared.endpoints.dispatch(&ctx, &service, &fn_name, argument) {
            Ok(result) => Wire::Reply {
                id,
                succeed: true,
                result: result.unwrap_or(Value::Null),
            },
            Err(err) => {
                debug!(target: "rpc", service = %service, function = %fn_name, error = %err, "rpc call failed");
                Wire::Reply {
                    id,
                    succeed: false,
                    result: serde_json::to_value(&err)?,
                }
            }
        };
        write_wire(&mut writer, &reply)?;
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct Session {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Session {
    fn open(client: &RpcClient, target: &NodeId) -> Result<Session, RpcError> {
        let addr = target
            .rpc_addr()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RpcError::Unexpected(format!("{} did not resolve", target.rpc_addr())))?;
        let stream = TcpStream::connect_timeout(&addr, client.timeout)?;
        stream.set_read_timeout(Some(client.timeout))?;
        stream.set_write_timeout(Some(client.timeout))?;
        stream.set_nodelay(true)?;
        let mut session = Session {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
        };

        let nonce = match read_wire(&mut session.reader)? {
            Wire::Hello { nonce } => nonce,
            other => return Err(RpcError::Unexpected(other.kind().to_string())),
        };
        write_wire(
            &mut session.writer,
            &Wire::Auth {
                node: client.node.to_string(),
                digest: sign_nonce(&client.cookie, &nonce),
            },
        )?;
        match read_wire(&mut session.reader) {
            Ok(Wire::Welcome { node }) if node == target.to_string() => Ok(session),
            Ok(Wire::Welcome { node }) => Err(RpcError::WrongNode {
                expected: target.to_string(),
                actual: node,
            }),
            Ok(other) => Err(RpcError::Unexpected(other.kind().to_string())),
            // The server drops the link on a bad digest.
            Err(RpcError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Err(RpcError::AuthFailed),
            Err(e) => Err(e),
        }
    }

    /// An idle session is usable if nothing is waiting to be read: no EOF
    /// from a peer that went away and no stray bytes.
    fn is_idle_and_open(&self) -> bool {
        if !self.reader.buffer().is_empty() {
            return false;
        }
        let stream = self.reader.get_ref();
        if stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut byte = [0u8; 1];
        let open = matches!(stream.peek(&mut byte), Err(e) if e.kind() == io::ErrorKind::WouldBlock);
        stream.set_nonblocking(false).is_ok() && open
    }

    fn call(&mut self, call: &Wire, id: u64) -> Result<(bool, Value), RpcError> {
        write_wire(&mut self.writer, call)?;
        match read_wire(&mut self.reader)? {
            Wire::Reply {
                id: reply_id,
                succeed,
                result,
            } if reply_id == id => Ok((succeed, result)),
            other => Err(RpcError::Unexpected(other.kind().to_string())),
        }
    }
}

/// Calls endpoints on other nodes.
pub struct RpcClient {
    node: NodeId,
    cookie: String,
    timeout: Duration,
    idle: Mutex<FxHashMap<NodeId, Vec<Session>>>,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(node: NodeId, cookie: impl Into<String>, timeout: Duration) -> Self {
        RpcClient {
            node,
            cookie: cookie.into(),
            timeout,
            idle: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Invoke `service.fn_name(argument)` on `target`, exactly once.
    /// A pooled session the peer has since closed is replaced by a new one.
    ///
    /// A failed reply returns the remote error unchanged. Transport failures
    /// become [`CodeError::UNAVAILABLE`] (or [`CodeError::TIMEOUT`]).
    pub fn call(
        &self,
        target: &NodeId,
        service: &str,
        fn_name: &str,
        argument: Value,
        header: Header,
    ) -> Result<Value, CodeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let call = Wire::Call {
            id,
            service: service.to_string(),
            fn_name: fn_name.to_string(),
            argument,
            header,
        };

        let (mut session, reused) = match self.take_idle(target) {
            Some(session) => (session, true),
            None => (Session::open(self, target).map_err(|e| transport_error(target, e))?, false),
        };

        let mut outcome = session.call(&call, id);
        if reused && matches!(&outcome, Err(e) if e.is_closed_link()) {
            // The peer closed this pooled link before the call reached it.
            debug!(target: "rpc", node = %target, "pooled rpc session was closed, reconnecting");
            session = Session::open(self, target).map_err(|e| transport_error(target, e))?;
            outcome = session.call(&call, id);
        }

        match outcome {
            Ok((succeed, result)) => {
                self.idle.lock().entry(target.clone()).or_default().push(session);
                if succeed {
                    Ok(result)
                } else {
                    Err(serde_json::from_value(result.clone())
                        .unwrap_or_else(|_| CodeError::service_error(result.to_string())))
                }
            }
            Err(e) => Err(transport_error(target, e)),
        }
    }

    /// Pop a pooled session for `target`, discarding any the peer closed.
    fn take_idle(&self, target: &NodeId) -> Option<Session> {
        let mut idle = self.idle.lock();
        let pool = idle.get_mut(target)?;
        while let Some(session) = pool.pop() {
            if session.is_idle_and_open() {
                return Some(session);
            }
            debug!(target: "rpc", node = %target, "dropping closed pooled rpc session");
        }
        None
    }

    /// Drop every pooled session.
    pub fn close_idle(&self) {
        self.idle.lock().clear();
    }
}

fn transport_error(target: &NodeId, err: RpcError) -> CodeError {
    debug!(target: "rpc", node = %target, error = %err, "rpc transport failure");
    let base = if err.is_timeout() {
        CodeError::timeout(format!("rpc to {} timed out", target))
    } else {
        CodeError::unavailable(format!("node {} is unavailable", target))
    };
    base.with_meta("node", target.to_string())
        .with_cause(CodeError::service_error(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{fn_not_found, Endpoint};
    use crate::registry::{MemoryStore, Registry};
    use crate::table::ConnTable;
    use serde_json::json;
    use std::io::Cursor;

    struct Adder;

    impl Endpoint for Adder {
        fn name(&self) -> &str {
            "math"
        }

        fn internal(&self) -> bool {
            true
        }

        fn handle(&self, ctx: &RequestContext, fn_name: &str, argument: Value) -> Result<Option<Value>, CodeError> {
            match fn_name {
                "add" => {
                    let a = argument["a"].as_i64().unwrap_or_default();
                    let b = argument["b"].as_i64().unwrap_or_default();
                    Ok(Some(json!(a + b)))
                }
                "internal" => Ok(Some(json!(ctx.internal))),
                "header" => Ok(ctx.header.get("Trace").map(|v| json!(v))),
                other => Err(fn_not_found("math", other)),
            }
        }
    }

    fn server(cookie: &str) -> (RpcServer, NodeId) {
        server_on(TcpListener::bind("127.0.0.1:0").unwrap(), cookie)
    }

    fn server_on(listener: TcpListener, cookie: &str) -> (RpcServer, NodeId) {
        let node = NodeId::new("srv", "127.0.0.1", listener.local_addr().unwrap().port());
        let endpoints = Arc::new(Endpoints::new());
        endpoints.register(Arc::new(Adder)).unwrap();
        let client = Arc::new(RpcClient::new(node.clone(), cookie, Duration::from_secs(2)));
        let registry = Arc::new(Registry::new(Arc::new(MemoryStore::new()), "ws:", Duration::from_secs(60)));
        let sender = Sender::new(
            node.clone(),
            registry,
            Arc::new(ConnTable::new()),
            client,
            Duration::from_secs(1),
        );
        let server = RpcServer::start(listener, node.clone(), cookie.to_string(), endpoints, sender).unwrap();
        (server, node)
    }

    fn client(cookie: &str) -> RpcClient {
        RpcClient::new(NodeId::new("cli", "127.0.0.1", 1), cookie, Duration::from_secs(2))
    }

    #[test]
    fn wire_framing() {
        let mut buf = Vec::new();
        let msg = Wire::Reply {
            id: 7,
            succeed: true,
            result: json!({"x": 1}),
        };
        write_wire(&mut buf, &msg).unwrap();
        assert_eq!(u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize, buf.len() - 4);
        assert_eq!(read_wire(&mut Cursor::new(&buf)).unwrap(), msg);

        let mut huge = Vec::new();
        huge.extend_from_slice(&(MAX_RPC_FRAME as u32 + 1).to_be_bytes());
        assert!(matches!(read_wire(&mut Cursor::new(huge)), Err(RpcError::FrameTooLarge(_))));
    }

    #[test]
    fn call_wire_shape() {
        let call = Wire::Call {
            id: 1,
            service: "websockets".into(),
            fn_name: "send".into(),
            argument: json!({}),
            header: Header::new(),
        };
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value, json!({"type": "call", "id": 1, "service": "websockets", "fn": "send", "argument": {}}));
    }

    #[test]
    fn cookie_digest_verifies() {
        let digest = sign_nonce("secret", "abc");
        assert!(verify_nonce("secret", "abc", &digest));
        assert!(!verify_nonce("other", "abc", &digest));
        assert!(!verify_nonce("secret", "abd", &digest));
        assert!(!verify_nonce("secret", "abc", "not base64!"));
    }

    #[test]
    fn calls_remote_endpoint_and_reuses_session() {
        let (server, node) = server("secret");
        let client = client("secret");

        let sum = client.call(&node, "math", "add", json!({"a": 2, "b": 3}), Header::new()).unwrap();
        assert_eq!(sum, json!(5));
        assert_eq!(client.idle.lock().get(&node).map(Vec::len), Some(1));

        let internal = client.call(&node, "math", "internal", Value::Null, Header::new()).unwrap();
        assert_eq!(internal, json!(true));
        assert_eq!(client.idle.lock().get(&node).map(Vec::len), Some(1));

        let mut header = Header::new();
        header.add("Trace", "t-1");
        assert_eq!(client.call(&node, "math", "header", Value::Null, header).unwrap(), json!("t-1"));
        server.stop();
    }

    #[test]
    fn remote_errors_pass_through_unchanged() {
        let (server, node) = server("secret");
        let client = client("secret");
        let err = client.call(&node, "math", "mul", Value::Null, Header::new()).unwrap_err();
        assert_eq!(err, fn_not_found("math", "mul"));
        let err = client.call(&node, "nope", "x", Value::Null, Header::new()).unwrap_err();
        assert_eq!(err.code, CodeError::NOT_FOUND);
        server.stop();
    }

    #[test]
    fn wrong_cookie_is_unavailable() {
        let (server, node) = server("secret");
        let client = client("wrong");
        let err = client.call(&node, "math", "add", Value::Null, Header::new()).unwrap_err();
        assert_eq!(err.code, CodeError::UNAVAILABLE);
        assert!(err.cause.unwrap().message.contains("authentication"));
        server.stop();
    }

    #[test]
    fn unreachable_node_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let client = client("secret");
        let err = client
            .call(&NodeId::new("gone", "127.0.0.1", port), "math", "add", Value::Null, Header::new())
            .unwrap_err();
        assert_eq!(err.code, CodeError::UNAVAILABLE);
        assert_eq!(err.meta["node"], json!(format!("gone@127.0.0.1:{}", port)));
    }

    #[test]
    fn restarted_peer_gets_a_fresh_session() {
        let (server, node) = server("secret");
        let client = client("secret");
        client.call(&node, "math", "add", json!({"a": 1, "b": 1}), Header::new()).unwrap();
        assert_eq!(client.idle.lock().get(&node).map(Vec::len), Some(1));
        server.stop();

        let listener = TcpListener::bind(("127.0.0.1", node.port())).unwrap();
        let (restarted, _) = server_on(listener, "secret");
        let sum = client.call(&node, "math", "add", json!({"a": 2, "b": 2}), Header::new()).unwrap();
        assert_eq!(sum, json!(4));
        assert_eq!(client.idle.lock().get(&node).map(Vec::len), Some(1));
        restarted.stop();
    }

    #[test]
    fn closed_link_is_detected_on_the_wire() {
        let (server, node) = server("secret");
        let client = client("secret");
        let mut session = Session::open(&client, &node).unwrap();
        server.stop();
        let call = Wire::Call {
            id: 1,
            service: "math".into(),
            fn_name: "add".into(),
            argument: Value::Null,
            header: Header::new(),
        };
        let err = session.call(&call, 1).unwrap_err();
        assert!(err.is_closed_link(), "got {err:?}");
        assert!(!session.is_idle_and_open());
    }

    #[test]
    fn stop_drops_sessions() {
        let (server, node) = server("secret");
        let client = client("secret");
        client.call(&node, "math", "add", json!({"a": 1, "b": 1}), Header::new()).unwrap();
        server.stop();
        // The pooled session is now dead and the listener gone.
        let err = client.call(&node, "math", "add", Value::Null, Header::new()).unwrap_err();
        assert!(err.code == CodeError::UNAVAILABLE || err.code == CodeError::TIMEOUT);
    }
}
