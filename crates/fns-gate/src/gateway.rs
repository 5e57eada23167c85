//! Gateway node wiring: listeners, services and shutdown.
//!
//! ```text
//!   GatewayBuilder::start
//!     |
//!     +-- bind RPC listener (node id takes the bound port)
//!     +-- pick the registry store; serve it as `kv` when it is local
//!     +-- build registry, conn table, sender, `websockets` service
//!     +-- RpcServer (thread)
//!     +-- WS accept loop (thread)
//!           |
//!           +-- per connection (thread): handshake -> admission -> ConnectionTask
//! ```

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use fns_ws::conn::CONTROL_WRITE_WAIT;
use fns_ws::{CloseCode, OriginCheck, Upgrader};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, GatewayConfig, RegistryBackend};
use crate::endpoint::{Endpoint, EndpointAlreadyRegistered, Endpoints};
use crate::node::NodeId;
use crate::registry::{KvService, KvStore, MemoryStore, NodeStore, Registry};
use crate::rpc::{RpcClient, RpcServer};
use crate::send::Sender;
use crate::service::WebsocketsService;
use crate::table::ConnTable;
use crate::task::{ConnectionTask, TaskSettings};

/// Grace used when a running gateway is dropped.
const DROP_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Endpoint(#[from] EndpointAlreadyRegistered),

    #[error("gateway io: {0}")]
    Io(#[from] io::Error),
}

pub struct GatewayBuilder {
    config: GatewayConfig,
    endpoints: Vec<Arc<dyn Endpoint>>,
    store: Option<Arc<dyn KvStore>>,
    check_origin: Option<OriginCheck>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        GatewayBuilder {
            config,
            endpoints: Vec::new(),
            store: None,
            check_origin: None,
        }
    }

    /// Add an application endpoint reachable by clients (or only by nodes,
    /// if it reports itself internal).
    pub fn register(mut self, endpoint: Arc<dyn Endpoint>) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Use `store` for the registry instead of the configured backend.
    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the configured origin policy.
    pub fn check_origin(mut self, check: OriginCheck) -> Self {
        self.check_origin = Some(check);
        self
    }

    pub fn start(self) -> Result<Gateway, GatewayError> {
        let config = self.config;
        config.validate()?;

        let configured = config.node_id()?;
        let rpc_listener = bind(&configured.rpc_addr())?;
        let node = configured.with_port(rpc_listener.local_addr()?.port());

        let endpoints = Arc::new(Endpoints::new());
        for endpoint in self.endpoints {
            endpoints.register(endpoint)?;
        }

        let rpc_client = Arc::new(RpcClient::new(
            node.clone(),
            config.cluster.cookie.clone(),
            config.cluster.rpc_timeout(),
        ));

        let (store, local_store): (Arc<dyn KvStore>, bool) = match (self.store, config.registry.backend) {
            (Some(store), backend) => (store, backend == RegistryBackend::Memory),
            (None, RegistryBackend::Memory) => (Arc::new(MemoryStore::new()), true),
            (None, RegistryBackend::Node) => {
                let target: NodeId = config
                    .registry
                    .store_node
                    .as_deref()
                    .unwrap_or_default()
                    .parse()
                    .map_err(ConfigError::Invalid)?;
                if target == node {
                    (Arc::new(MemoryStore::new()), true)
                } else {
                    (Arc::new(NodeStore::new(Arc::clone(&rpc_client), target)), false)
                }
            }
        };
        if local_store {
            endpoints.register(Arc::new(KvService::new(Arc::clone(&store))))?;
        }

        let registry = Arc::new(Registry::new(store, config.registry.prefix.clone(), config.registry.ttl()));
        let table = Arc::new(ConnTable::new());
        let sender = Sender::new(
            node.clone(),
            Arc::clone(&registry),
            Arc::clone(&table),
            Arc::clone(&rpc_client),
            config.websocket.write_timeout(),
        );
        let service = Arc::new(WebsocketsService::new(node.clone(), table, registry, sender.clone()));
        endpoints.register(Arc::clone(&service) as Arc<dyn Endpoint>)?;

        let rpc_server = RpcServer::start(
            rpc_listener,
            node.clone(),
            config.cluster.cookie.clone(),
            Arc::clone(&endpoints),
            sender,
        )?;

        let ws_listener = bind(&config.listen)?;
        let local_addr = ws_listener.local_addr()?;
        ws_listener.set_nonblocking(true)?;

        let abort = Arc::new(AtomicBool::new(false));
        let stop_accept = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);

        let acceptor = Acceptor {
            listener: ws_listener,
            upgrader: config.websocket.upgrader(self.check_origin),
            settings: TaskSettings {
                read_timeout: config.websocket.read_timeout(),
                write_timeout: config.websocket.write_timeout(),
                max_request_message_size: config.websocket.max_request_message_size,
                registry_ttl: config.registry.ttl(),
            },
            max_connections: config.websocket.max_connections,
            active: Arc::new(AtomicUsize::new(0)),
            service: Arc::clone(&service),
            endpoints: Arc::clone(&endpoints),
            abort: Arc::clone(&abort),
            stop: Arc::clone(&stop_accept),
            done: done_tx,
        };
        let accept_thread = std::thread::Builder::new()
            .name(format!("fns-ws-accept-{}", local_addr.port()))
            .spawn(move || acceptor.run())?;

        info!(target: "gateway", node = %node, addr = %local_addr, "gateway started");
        Ok(Gateway {
            node,
            local_addr,
            endpoints,
            service,
            rpc_client,
            rpc_server,
            abort,
            stop_accept,
            accept_thread: Mutex::new(Some(accept_thread)),
            done: done_rx,
            stopped: AtomicBool::new(false),
        })
    }
}

fn bind(addr: &str) -> Result<TcpListener, GatewayError> {
    TcpListener::bind(addr).map_err(|source| GatewayError::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// A running gateway node.
pub struct Gateway {
    node: NodeId,
    local_addr: SocketAddr,
    endpoints: Arc<Endpoints>,
    service: Arc<WebsocketsService>,
    rpc_client: Arc<RpcClient>,
    rpc_server: RpcServer,
    abort: Arc<AtomicBool>,
    stop_accept: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    /// Disconnects once the acceptor and every connection thread are gone.
    done: Receiver<()>,
    stopped: AtomicBool,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    /// Address of the WebSocket listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// This node's id, with the bound RPC port.
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn sender(&self) -> &Sender {
        self.service.sender()
    }

    pub fn service(&self) -> &Arc<WebsocketsService> {
        &self.service
    }

    pub fn endpoints(&self) -> &Arc<Endpoints> {
        &self.endpoints
    }

    pub fn rpc(&self) -> &Arc<RpcClient> {
        &self.rpc_client
    }

    /// Stop the node: refuse new connections, abort every task (each sends
    /// a 1006 close and unmounts), wait up to `grace`, then drop the
    /// remaining registry entries and the RPC listener. Idempotent.
    pub fn shutdown(&self, grace: Duration) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "gateway", node = %self.node, "gateway shutting down");
        self.abort.store(true, Ordering::Release);
        self.stop_accept.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }

        for conn in self.service.connections().snapshot() {
            conn.shutdown_read();
        }
        let deadline = Instant::now() + grace;
        match self.done.recv_deadline(deadline) {
            Err(RecvTimeoutError::Timeout) => warn!(
                target: "gateway",
                remaining = self.service.connections().len(),
                "connections still open after grace period"
            ),
            Err(RecvTimeoutError::Disconnected) | Ok(()) => {}
        }

        self.service.registration().shutdown();
        self.rpc_server.stop();
        self.rpc_client.close_idle();
        info!(target: "gateway", node = %self.node, "gateway stopped");
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown(DROP_GRACE);
    }
}

/// Owns the WS listener; moved into the accept thread.
struct Acceptor {
    listener: TcpListener,
    upgrader: Upgrader,
    settings: TaskSettings,
    max_connections: usize,
    active: Arc<AtomicUsize>,
    service: Arc<WebsocketsService>,
    endpoints: Arc<Endpoints>,
    abort: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    done: crossbeam_channel::Sender<()>,
}

/// Counts a connection as active until dropped.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    /// Returns the guard and the number of active connections before it.
    fn enter(active: &Arc<AtomicUsize>) -> (ActiveGuard, usize) {
        let before = active.fetch_add(1, Ordering::SeqCst);
        (ActiveGuard(Arc::clone(active)), before)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Acceptor {
    fn run(self) {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }

            match self.listener.accept() {
                Ok((stream, addr)) => self.spawn(stream, addr),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    warn!(target: "gateway", error = %e, "accept error");
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
        debug!(target: "gateway", "accept loop stopped");
    }

    fn spawn(&self, stream: TcpStream, addr: SocketAddr) {
        let (guard, before) = ActiveGuard::enter(&self.active);
        let admitted = before < self.max_connections;
        let upgrader = self.upgrader.clone();
        let settings = self.settings.clone();
        let service = Arc::clone(&self.service);
        let endpoints = Arc::clone(&self.endpoints);
        let abort = Arc::clone(&self.abort);
        let done = self.done.clone();

        let spawned = std::thread::Builder::new()
            .name("fns-ws-conn".to_string())
            .spawn(move || {
                let _guard = guard;
                let _done = done;
                if let Err(e) = stream.set_nonblocking(false) {
                    debug!(target: "gateway", peer = %addr, error = %e, "socket setup failed");
                    return;
                }
                let (conn, request) = match upgrader.upgrade(stream) {
                    Ok(upgraded) => upgraded,
                    Err(e) => {
                        debug!(target: "gateway", peer = %addr, error = %e, "handshake failed");
                        return;
                    }
                };
                if !admitted {
                    warn!(target: "gateway", peer = %addr, "connection limit reached");
                    let _ = conn.write_close(
                        CloseCode::TRY_AGAIN_LATER,
                        "try again later",
                        Some(Instant::now() + CONTROL_WRITE_WAIT),
                    );
                    conn.close();
                    return;
                }
                debug!(target: "gateway", conn_id = %conn.id(), peer = %addr, "connection accepted");
                ConnectionTask::new(Arc::new(conn), request, service, endpoints, settings, abort).run();
            });
        if let Err(e) = spawned {
            warn!(target: "gateway", peer = %addr, error = %e, "failed to spawn connection thread");
        }
    }
}
