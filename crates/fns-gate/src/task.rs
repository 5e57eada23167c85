//! The read-dispatch loop run for every accepted connection.
//!
//! ```text
//!   mount
//!     |
//!     v
//!   +-> refresh read deadline -> next message -> parse -> endpoint -> reply -+
//!   |                                                                          |
//!   +--------------------------------------------------------------------------+
//!     |
//!     v  (eof, error, abort, peer close)
//!   close frame -> socket close -> unmount
//! ```
//!
//! The loop is serial: replies go out in the order requests were read.
//! Pushes from [`Sender`](crate::send::Sender) interleave between messages.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fns_ws::conn::{reply_pong, CONTROL_WRITE_WAIT};
use fns_ws::{CloseCode, Connection, ControlHandler, HandshakeRequest, MessageKind, OpCode, WsError};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::context::{RequestContext, DEVICE_ID_HEADER, DEVICE_IP_HEADER};
use crate::endpoint::{endpoint_not_found, Endpoints};
use crate::envelope::{Request, Response};
use crate::service::WebsocketsService;

/// Limits applied by the loop.
#[derive(Debug, Clone)]
pub struct TaskSettings {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_request_message_size: u64,
    pub registry_ttl: Duration,
}

/// `None` for a zero duration, which disables the deadline.
fn deadline_after(d: Duration) -> Option<Instant> {
    if d.is_zero() {
        None
    } else {
        Some(Instant::now() + d)
    }
}

/// Tracks when the registry entry was last set.
struct Lease {
    last: Mutex<Instant>,
    every: Duration,
}

impl Lease {
    fn new(ttl: Duration) -> Self {
        Lease {
            last: Mutex::new(Instant::now()),
            every: ttl / 2,
        }
    }

    /// True at most once per half-TTL.
    fn due(&self) -> bool {
        let mut last = self.last.lock();
        if last.elapsed() >= self.every {
            *last = Instant::now();
            true
        } else {
            false
        }
    }
}

/// Why the loop ended.
#[derive(Debug, PartialEq)]
enum Exit {
    /// Send a close frame with this code and reason.
    Close(u16, String),
    /// The peer's close was already answered.
    PeerClosed,
}

impl Exit {
    fn close(code: u16, reason: impl Into<String>) -> Exit {
        Exit::Close(code, reason.into())
    }
}

pub struct ConnectionTask {
    conn: Arc<Connection>,
    request: HandshakeRequest,
    service: Arc<WebsocketsService>,
    endpoints: Arc<Endpoints>,
    settings: TaskSettings,
    abort: Arc<AtomicBool>,
    lease: Arc<Lease>,
}

impl ConnectionTask {
    pub fn new(
        conn: Arc<Connection>,
        request: HandshakeRequest,
        service: Arc<WebsocketsService>,
        endpoints: Arc<Endpoints>,
        settings: TaskSettings,
        abort: Arc<AtomicBool>,
    ) -> Self {
        let lease = Arc::new(Lease::new(settings.registry_ttl));
        ConnectionTask {
            conn,
            request,
            service,
            endpoints,
            settings,
            abort,
            lease,
        }
    }

    /// Run until the connection ends. Mounts first and unmounts exactly once
    /// on the way out.
    pub fn run(self) {
        let id = self.conn.id();
        if let Err(err) = self.service.mount(Arc::clone(&self.conn)) {
            warn!(target: "gateway", conn_id = %id, error = %err, "mount failed");
            let _ = self.conn.write_close(
                CloseCode::INTERNAL_ERROR,
                "mount failed",
                Some(Instant::now() + CONTROL_WRITE_WAIT),
            );
            self.conn.close();
            return;
        }

        self.conn.set_read_limit(self.settings.max_request_message_size);
        self.install_keepalive();

        let exit = self.serve();
        if let Exit::Close(code, reason) = &exit {
            debug!(target: "gateway", conn_id = %id, code, reason = %reason, "closing connection");
            let _ = self
                .conn
                .write_close(*code, reason, Some(Instant::now() + CONTROL_WRITE_WAIT));
        }
        self.conn.close();
        let _ = self.service.unmount(&id);
    }

    /// Ping and pong both count as activity: they push the read deadline out
    /// and may refresh the registry entry.
    fn install_keepalive(&self) {
        let read_timeout = self.settings.read_timeout;
        let service = Arc::downgrade(&self.service);
        let lease = Arc::clone(&self.lease);
        let touch = move |conn: &Connection| {
            conn.set_read_deadline(deadline_after(read_timeout));
            let Some(service) = service.upgrade() else {
                return;
            };
            if lease.due() {
                if let Err(err) = service.refresh(&conn.id()) {
                    warn!(target: "registry", conn_id = %conn.id(), error = %err, "ttl refresh failed");
                }
            }
        };
        let touch = Arc::new(touch);

        let on_ping = Arc::clone(&touch);
        let ping: ControlHandler = Arc::new(move |conn: &Connection, payload: &[u8]| {
            (*on_ping)(conn);
            reply_pong(conn, payload)
        });
        let pong: ControlHandler = Arc::new(move |conn: &Connection, _: &[u8]| {
            (*touch)(conn);
            Ok(())
        });
        self.conn.set_ping_handler(Some(ping));
        self.conn.set_pong_handler(Some(pong));
    }

    fn serve(&self) -> Exit {
        let id = self.conn.id();
        loop {
            if self.abort.load(Ordering::Acquire) {
                return Exit::close(CloseCode::ABNORMAL, "node shutdown");
            }
            if self.lease.due() {
                if let Err(err) = self.service.refresh(&id) {
                    warn!(target: "registry", conn_id = %id, error = %err, "ttl refresh failed");
                }
            }

            self.conn.set_read_deadline(deadline_after(self.settings.read_timeout));
            let raw = match self.read_request() {
                Ok(raw) => raw,
                Err(exit) => return exit,
            };
            let reply = match self.dispatch(&raw) {
                Ok(reply) => reply,
                Err(exit) => return exit,
            };

            self.conn.set_write_deadline(deadline_after(self.settings.write_timeout));
            if let Err(err) = self.conn.write_message(OpCode::Text, &reply) {
                debug!(target: "gateway", conn_id = %id, error = %err, "reply write failed");
                let reason = if err.is_timeout() {
                    "write timeout".to_string()
                } else {
                    err.to_string()
                };
                return Exit::Close(CloseCode::ABNORMAL, reason);
            }
        }
    }

    /// Read one text message of at most `max_request_message_size` bytes.
    fn read_request(&self) -> Result<Vec<u8>, Exit> {
        let mut reader = self.conn.next_reader().map_err(|e| self.read_failed(e))?;
        if reader.kind() == MessageKind::Binary {
            return Err(Exit::close(CloseCode::INVALID_DATA, "binary messages are not supported"));
        }
        let limit = self.settings.max_request_message_size;
        let mut raw = Vec::new();
        (&mut reader)
            .take(limit.saturating_add(1))
            .read_to_end(&mut raw)
            .map_err(|e| self.read_failed(WsError::from_io(e)))?;
        if raw.len() as u64 > limit {
            return Err(Exit::close(CloseCode::MESSAGE_TOO_BIG, "message too big"));
        }
        Ok(raw)
    }

    fn read_failed(&self, err: WsError) -> Exit {
        let id = self.conn.id();
        if self.abort.load(Ordering::Acquire) {
            return Exit::close(CloseCode::ABNORMAL, "node shutdown");
        }
        if let WsError::Close(close) = &err {
            debug!(target: "gateway", conn_id = %id, code = close.code, "peer closed");
            return Exit::PeerClosed;
        }
        if let Some(code) = err.close_code() {
            debug!(target: "gateway", conn_id = %id, error = %err, "protocol violation");
            return Exit::Close(code, err.to_string());
        }
        if err.is_eof() {
            return Exit::close(CloseCode::NORMAL, "");
        }
        if err.is_timeout() {
            return Exit::close(CloseCode::ABNORMAL, "read timeout");
        }
        debug!(target: "gateway", conn_id = %id, error = %err, "read failed");
        Exit::Close(CloseCode::ABNORMAL, err.to_string())
    }

    /// Decode and run one request. `Ok` holds the reply text.
    fn dispatch(&self, raw: &[u8]) -> Result<Vec<u8>, Exit> {
        let text = std::str::from_utf8(raw).map_err(|_| Exit::close(CloseCode::INVALID_DATA, "invalid utf-8"))?;
        let request = Request::decode(text.as_bytes()).map_err(|e| {
            debug!(target: "gateway", conn_id = %self.conn.id(), error = %e, "bad request");
            Exit::Close(e.close_code(), e.to_string())
        })?;

        let endpoint = match self.endpoints.lookup(&request.service, false) {
            Some(endpoint) => endpoint,
            None => return Ok(Response::failed(&endpoint_not_found(&request.service)).encode()),
        };
        let ctx = self.context(&request);
        let reply = match endpoint.handle(&ctx, &request.fn_name, request.payload) {
            Ok(Some(result)) => Response::succeed(result).encode(),
            Ok(None) => b"null".to_vec(),
            Err(err) => {
                debug!(target: "gateway", request_id = %ctx.request_id, error = %err, "endpoint failed");
                Response::failed(&err).encode()
            }
        };
        Ok(reply)
    }

    fn context(&self, request: &Request) -> RequestContext {
        let mut ctx = RequestContext::new(false).with_sender(self.service.sender().clone());
        ctx.connection_id = Some(self.conn.id());
        ctx.device_id = self.request.header(DEVICE_ID_HEADER).unwrap_or_default().to_string();
        ctx.device_ip = match self.request.header(DEVICE_IP_HEADER) {
            Some(ip) => ip.to_string(),
            None => self
                .request
                .peer_addr
                .map(|addr| addr.ip().to_string())
                .unwrap_or_default(),
        };
        ctx.header = request.header.clone();
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_duration_disables_deadline() {
        assert_eq!(deadline_after(Duration::ZERO), None);
        assert!(deadline_after(Duration::from_secs(1)).unwrap() > Instant::now());
    }

    #[test]
    fn lease_is_due_once_per_half_ttl() {
        let lease = Lease::new(Duration::from_millis(40));
        assert!(!lease.due());
        std::thread::sleep(Duration::from_millis(25));
        assert!(lease.due());
        assert!(!lease.due());
    }

    #[test]
    fn exit_close_reason() {
        assert_eq!(Exit::close(1006, "read timeout"), Exit::Close(1006, "read timeout".to_string()));
    }
}
