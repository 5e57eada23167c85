//! Distributed WebSocket gateway.
//!
//! Clients connect to any node; each text message is a JSON request
//! dispatched to a local endpoint. Any node can push to any connection by id:
//! the cluster registry names the owning node and the push is forwarded
//! there over node RPC.
//!
//! - [`Gateway`]: listeners, accept loop, shutdown
//! - [`task`]: per-connection read-dispatch loop
//! - [`Sender`]: cross-node send
//! - [`WebsocketsService`]: connection table + registry, `mount`/`unmount`/`send`
//! - [`Registry`]: connection id -> node, over a [`KvStore`]
//! - [`rpc`]: authenticated inter-node calls

pub mod config;
pub mod context;
pub mod echo;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod node;
pub mod registry;
pub mod rpc;
pub mod send;
pub mod service;
pub mod table;
pub mod task;

pub use config::{ConfigError, GatewayConfig, LogFormat, LogSettings};
pub use context::RequestContext;
pub use echo::EchoService;
pub use endpoint::{Endpoint, Endpoints};
pub use envelope::{Header, Request, Response};
pub use error::CodeError;
pub use gateway::{Gateway, GatewayBuilder, GatewayError};
pub use node::NodeId;
pub use registry::{KvStore, MemoryStore, NodeStore, Registry};
pub use rpc::{RpcClient, RpcServer};
pub use send::Sender;
pub use service::WebsocketsService;
pub use table::ConnTable;
