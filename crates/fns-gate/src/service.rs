//! The `websockets` service: owns the connection table and the registry of
//! this node and exposes `mount`, `unmount` and `send` to other nodes.

use std::sync::Arc;
use std::time::Duration;

use fns_ws::{Connection, ConnectionId};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::endpoint::{fn_not_found, Endpoint};
use crate::error::CodeError;
use crate::node::NodeId;
use crate::registry::Registry;
use crate::send::{SendArgs, Sender};
use crate::table::ConnTable;

pub const SERVICE_NAME: &str = "websockets";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MountArgs {
    connection_id: ConnectionId,
    #[serde(default)]
    node_id: Option<NodeId>,
    #[serde(default)]
    ttl_millis: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnmountArgs {
    connection_id: ConnectionId,
}

pub struct WebsocketsService {
    node: NodeId,
    table: Arc<ConnTable>,
    registry: Arc<Registry>,
    sender: Sender,
}

impl WebsocketsService {
    pub fn new(node: NodeId, table: Arc<ConnTable>, registry: Arc<Registry>, sender: Sender) -> Self {
        WebsocketsService {
            node,
            table,
            registry,
            sender,
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn connections(&self) -> &Arc<ConnTable> {
        &self.table
    }

    pub fn registration(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    /// Make `conn` reachable: table first, then registry. A registry failure
    /// takes the table entry back out.
    pub fn mount(&self, conn: Arc<Connection>) -> Result<(), CodeError> {
        let id = conn.id();
        self.table.set(conn);
        if let Err(err) = self.registry.set(&id, &self.node, None) {
            self.table.remove(&id);
            return Err(err);
        }
        debug!(target: "gateway", conn_id = %id, node = %self.node, "mounted");
        Ok(())
    }

    /// Re-set the registry entry of `id`, extending its TTL.
    pub fn refresh(&self, id: &ConnectionId) -> Result<(), CodeError> {
        self.registry.set(id, &self.node, None)
    }

    /// Remove `id` from the table and the registry.
    pub fn unmount(&self, id: &ConnectionId) -> Result<(), CodeError> {
        self.table.remove(id);
        let result = self.registry.remove(id);
        match &result {
            Ok(()) => debug!(target: "gateway", conn_id = %id, "unmounted"),
            Err(err) => warn!(target: "gateway", conn_id = %id, error = %err, "registry removal failed on unmount"),
        }
        result
    }

    fn mount_remote(&self, args: MountArgs) -> Result<(), CodeError> {
        let node = args.node_id.unwrap_or_else(|| self.node.clone());
        let ttl = args.ttl_millis.map(Duration::from_millis);
        self.registry.set(&args.connection_id, &node, ttl)
    }
}

fn parse_args<'de, T: Deserialize<'de>>(fn_name: &str, argument: &'de Value) -> Result<T, CodeError> {
    T::deserialize(argument)
        .map_err(|e| CodeError::bad_request(format!("invalid argument for '{}': {}", fn_name, e)))
}

impl Endpoint for WebsocketsService {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    fn internal(&self) -> bool {
        true
    }

    fn handle(&self, _ctx: &RequestContext, fn_name: &str, argument: Value) -> Result<Option<Value>, CodeError> {
        match fn_name {
            "mount" => {
                self.mount_remote(parse_args(fn_name, &argument)?)?;
                Ok(None)
            }
            "unmount" => {
                let args: UnmountArgs = parse_args(fn_name, &argument)?;
                self.unmount(&args.connection_id)?;
                Ok(None)
            }
            "send" => {
                // Never forwarded again: a registry entry pointing elsewhere
                // is reported as not found.
                let args: SendArgs = parse_args(fn_name, &argument)?;
                self.sender.send_local(args.connection_id, args.message.as_bytes())?;
                Ok(None)
            }
            other => Err(fn_not_found(SERVICE_NAME, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryStore;
    use crate::rpc::RpcClient;
    use fns_ws::frame::read_frame;
    use fns_ws::{ConnectionConfig, OpCode, Role};
    use serde_json::json;
    use std::net::{TcpListener, TcpStream};

    fn service() -> WebsocketsService {
        let node = NodeId::new("a", "127.0.0.1", 1);
        let registry = Arc::new(Registry::new(Arc::new(MemoryStore::new()), "ws:", Duration::from_secs(60)));
        let table = Arc::new(ConnTable::new());
        let rpc = Arc::new(RpcClient::new(node.clone(), "", Duration::from_millis(200)));
        let sender = Sender::new(node.clone(), registry.clone(), table.clone(), rpc, Duration::from_secs(1));
        WebsocketsService::new(node, table, registry, sender)
    }

    fn conn() -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let conn = Connection::new(stream, Role::Server, ConnectionConfig::default(), Vec::new()).unwrap();
        (Arc::new(conn), peer)
    }

    #[test]
    fn mount_and_unmount_touch_table_and_registry() {
        let svc = service();
        let (c, _peer) = conn();
        let id = c.id();
        svc.mount(c).unwrap();
        assert!(svc.connections().get(&id).is_some());
        assert_eq!(svc.registration().get(&id).unwrap().as_ref(), Some(svc.node()));

        svc.unmount(&id).unwrap();
        assert!(svc.connections().get(&id).is_none());
        assert_eq!(svc.registration().get(&id).unwrap(), None);
    }

    #[test]
    fn endpoint_send_writes_locally() {
        let svc = service();
        let (c, mut peer) = conn();
        let id = c.id();
        svc.mount(c).unwrap();

        let ctx = RequestContext::new(true);
        let arg = json!({"connectionId": id, "message": "{\"hello\":\"world\"}"});
        assert_eq!(svc.handle(&ctx, "send", arg).unwrap(), None);
        let frame = read_frame(&mut peer).unwrap();
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload, br#"{"hello":"world"}"#);
    }

    #[test]
    fn endpoint_send_never_forwards() {
        let svc = service();
        let id = ConnectionId::new();
        svc.registration()
            .set(&id, &NodeId::new("b", "127.0.0.1", 2), None)
            .unwrap();
        let ctx = RequestContext::new(true);
        let err = svc
            .handle(&ctx, "send", json!({"connectionId": id, "message": "1"}))
            .unwrap_err();
        assert!(err.is_warning());
        assert_eq!(err.message, "connection was not found");
    }

    #[test]
    fn endpoint_mount_registers_given_node() {
        let svc = service();
        let id = ConnectionId::new();
        let ctx = RequestContext::new(true);
        svc.handle(
            &ctx,
            "mount",
            json!({"connectionId": id, "nodeId": "b@10.0.0.2:9100", "ttlMillis": 1000}),
        )
        .unwrap();
        assert_eq!(svc.registration().get(&id).unwrap().unwrap().to_string(), "b@10.0.0.2:9100");

        svc.handle(&ctx, "unmount", json!({"connectionId": id})).unwrap();
        assert_eq!(svc.registration().get(&id).unwrap(), None);
    }

    #[test]
    fn bad_arguments_and_unknown_fns() {
        let svc = service();
        let ctx = RequestContext::new(true);
        assert_eq!(svc.handle(&ctx, "send", json!({"message": "x"})).unwrap_err().code, 400);
        assert_eq!(svc.handle(&ctx, "mount", json!({"connectionId": "nope"})).unwrap_err().code, 400);
        assert_eq!(svc.handle(&ctx, "broadcast", Value::Null).unwrap_err().code, 404);
        assert!(svc.internal());
    }
}
