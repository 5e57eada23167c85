//! Push a message to a connection by id, wherever in the cluster it lives.
//!
//! 1. Encode the payload as JSON.
//! 2. Ask the registry for the owning node.
//! 3. Own node: write one text frame to the connection from the table.
//! 4. Other node: one `websockets.send` RPC carrying the encoded text. The
//!    receiving node only ever writes locally.

use std::sync::Arc;
use std::time::{Duration, Instant};

use fns_ws::{ConnectionId, OpCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::envelope::Header;
use crate::error::CodeError;
use crate::node::NodeId;
use crate::registry::Registry;
use crate::rpc::RpcClient;
use crate::service::SERVICE_NAME;
use crate::table::ConnTable;

/// Argument of the `websockets.send` function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendArgs {
    pub connection_id: ConnectionId,
    /// The already encoded JSON text, written to the socket as is.
    pub message: String,
}

struct SenderInner {
    node: NodeId,
    registry: Arc<Registry>,
    table: Arc<ConnTable>,
    rpc: Arc<RpcClient>,
    write_timeout: Duration,
}

/// Cheap to clone; every clone shares the same registry and table.
#[derive(Clone)]
pub struct Sender {
    inner: Arc<SenderInner>,
}

impl Sender {
    pub fn new(
        node: NodeId,
        registry: Arc<Registry>,
        table: Arc<ConnTable>,
        rpc: Arc<RpcClient>,
        write_timeout: Duration,
    ) -> Self {
        Sender {
            inner: Arc::new(SenderInner {
                node,
                registry,
                table,
                rpc,
                write_timeout,
            }),
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.inner.node
    }

    pub fn send<T: Serialize + ?Sized>(&self, id: ConnectionId, payload: &T) -> Result<(), CodeError> {
        let message = serde_json::to_string(payload)
            .map_err(|e| CodeError::bad_request(format!("payload is not encodable: {}", e)))?;
        self.send_encoded(id, message)
    }

    /// Route pre-encoded JSON text to `id`.
    pub fn send_encoded(&self, id: ConnectionId, message: String) -> Result<(), CodeError> {
        let inner = &self.inner;
        let node = inner.registry.get(&id)?.ok_or_else(|| {
            CodeError::warning("connection not found in registry").with_meta("connectionId", id.to_string())
        })?;
        if node == inner.node {
            return self.send_local(id, message.as_bytes());
        }

        debug!(target: "gateway", conn_id = %id, node = %node, "forwarding send");
        let argument = serde_json::to_value(SendArgs {
            connection_id: id,
            message,
        })
        .map_err(|e| CodeError::service_error(e.to_string()))?;
        inner
            .rpc
            .call(&node, SERVICE_NAME, "send", argument, Header::new())?;
        Ok(())
    }

    /// Write `message` as a single text frame to a connection of this node.
    pub fn send_local(&self, id: ConnectionId, message: &[u8]) -> Result<(), CodeError> {
        let conn = self.inner.table.get(&id).ok_or_else(|| {
            CodeError::warning("connection was not found").with_meta("connectionId", id.to_string())
        })?;
        let deadline = Instant::now() + self.inner.write_timeout;
        conn.write_message_until(OpCode::Text, message, Some(deadline))
            .map_err(|e| CodeError::from(e).with_meta("connectionId", id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryStore;
    use fns_ws::frame::read_frame;
    use fns_ws::{Connection, ConnectionConfig, Role};
    use serde_json::json;
    use std::net::{TcpListener, TcpStream};

    struct Fixture {
        sender: Sender,
        registry: Arc<Registry>,
        table: Arc<ConnTable>,
        node: NodeId,
    }

    fn fixture() -> Fixture {
        let node = NodeId::new("a", "127.0.0.1", 1);
        let registry = Arc::new(Registry::new(Arc::new(MemoryStore::new()), "ws:", Duration::from_secs(60)));
        let table = Arc::new(ConnTable::new());
        let rpc = Arc::new(RpcClient::new(node.clone(), "c", Duration::from_millis(500)));
        let sender = Sender::new(node.clone(), registry.clone(), table.clone(), rpc, Duration::from_secs(1));
        Fixture {
            sender,
            registry,
            table,
            node,
        }
    }

    fn server_conn() -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let conn = Connection::new(stream, Role::Server, ConnectionConfig::default(), Vec::new()).unwrap();
        (Arc::new(conn), peer)
    }

    #[test]
    fn missing_registry_entry_is_a_warning() {
        let f = fixture();
        let err = f.sender.send(ConnectionId::new(), &json!({})).unwrap_err();
        assert!(err.is_warning());
        assert_eq!(err.message, "connection not found in registry");
    }

    #[test]
    fn missing_table_entry_is_a_warning() {
        let f = fixture();
        let id = ConnectionId::new();
        f.registry.set(&id, &f.node, None).unwrap();
        let err = f.sender.send(id, &json!({})).unwrap_err();
        assert!(err.is_warning());
        assert_eq!(err.message, "connection was not found");
    }

    #[test]
    fn local_send_writes_one_text_frame() {
        let f = fixture();
        let (conn, mut peer) = server_conn();
        let id = conn.id();
        f.table.set(conn);
        f.registry.set(&id, &f.node, None).unwrap();

        f.sender.send(id, &json!({"hello": "world"})).unwrap();
        let frame = read_frame(&mut peer).unwrap();
        assert_eq!(frame.opcode, OpCode::Text);
        assert!(frame.fin);
        assert_eq!(frame.payload, br#"{"hello":"world"}"#);
    }

    #[test]
    fn unreachable_owner_surfaces_rpc_error() {
        let f = fixture();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let other = NodeId::new("b", "127.0.0.1", listener.local_addr().unwrap().port());
        drop(listener);
        let id = ConnectionId::new();
        f.registry.set(&id, &other, None).unwrap();
        let err = f.sender.send(id, &json!(1)).unwrap_err();
        assert_eq!(err.code, CodeError::UNAVAILABLE);
    }

    #[test]
    fn send_args_wire_shape() {
        let id: ConnectionId = "8e1c2b0e-8d0e-4c55-9d07-1f0b1a4c1a11".parse().unwrap();
        let args = SendArgs {
            connection_id: id,
            message: "{\"a\":1}".into(),
        };
        assert_eq!(
            serde_json::to_value(&args).unwrap(),
            json!({"connectionId": "8e1c2b0e-8d0e-4c55-9d07-1f0b1a4c1a11", "message": "{\"a\":1}"})
        );
    }
}
