//! Cluster-wide connection registry: connection id -> owning node.
//!
//! Entries live in a shared key/value store with a TTL under
//! `<prefix><connection-id>`. The registry remembers which ids this node has
//! set so that [`Registry::shutdown`] can remove them.
//!
//! The map is eventually consistent. A reader may see an entry for a node
//! that has just died; sends to it fail and the caller decides what to do.

use std::sync::Arc;
use std::time::{Duration, Instant};

use fns_ws::ConnectionId;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::endpoint::{fn_not_found, Endpoint};
use crate::envelope::Header;
use crate::error::CodeError;
use crate::node::NodeId;
use crate::rpc::RpcClient;

/// Default TTL of a registry entry.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Name of the internal service that exposes a node's store to its peers.
pub const KV_SERVICE_NAME: &str = "kv";

/// A shared string store with per-key expiry.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CodeError>;

    /// Insert or overwrite `key`; the entry expires `ttl` from now.
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CodeError>;

    fn remove(&self, key: &str) -> Result<(), CodeError>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// How often [`MemoryStore::set`] sweeps out expired entries by default.
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(30);

struct Entry {
    value: String,
    expires_at: Instant,
}

struct Entries {
    map: FxHashMap<String, Entry>,
    last_purge: Instant,
}

impl Entries {
    fn purge(&mut self, now: Instant) -> usize {
        let before = self.map.len();
        self.map.retain(|_, e| e.expires_at > now);
        self.last_purge = now;
        before - self.map.len()
    }
}

/// In-process store. Expired entries are dropped when read, and `set`
/// sweeps the whole map at most once per purge interval, so keys that are
/// never read again do not accumulate.
pub struct MemoryStore {
    entries: Mutex<Entries>,
    purge_interval: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_purge_interval(DEFAULT_PURGE_INTERVAL)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_purge_interval(purge_interval: Duration) -> Self {
        MemoryStore {
            entries: Mutex::new(Entries {
                map: FxHashMap::default(),
                last_purge: Instant::now(),
            }),
            purge_interval,
        }
    }

    /// Remaining lifetime of `key`, if it is live.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.lock();
        let entry = entries.map.get(key)?;
        entry.expires_at.checked_duration_since(Instant::now())
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.entries.lock().purge(Instant::now())
    }

    /// Number of stored entries, expired ones not yet swept included.
    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().map.is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, CodeError> {
        let mut entries = self.entries.lock();
        match entries.map.get(key) {
            Some(e) if e.expires_at > Instant::now() => Ok(Some(e.value.clone())),
            Some(_) => {
                entries.map.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CodeError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if now.saturating_duration_since(entries.last_purge) >= self.purge_interval {
            let purged = entries.purge(now);
            if purged > 0 {
                debug!(target: "registry", purged, "dropped expired entries");
            }
        }
        entries.map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CodeError> {
        self.entries.lock().map.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// NodeStore
// ---------------------------------------------------------------------------

/// The store hosted by another node, reached through its `kv` service.
pub struct NodeStore {
    client: Arc<RpcClient>,
    node: NodeId,
}

impl NodeStore {
    pub fn new(client: Arc<RpcClient>, node: NodeId) -> Self {
        NodeStore { client, node }
    }

    fn call(&self, fn_name: &str, argument: Value) -> Result<Value, CodeError> {
        self.client
            .call(&self.node, KV_SERVICE_NAME, fn_name, argument, Header::new())
    }
}

impl KvStore for NodeStore {
    fn get(&self, key: &str) -> Result<Option<String>, CodeError> {
        match self.call("get", json!({ "key": key }))? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Err(CodeError::service_error(format!("kv get returned {}", other))),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CodeError> {
        self.call(
            "set",
            json!({ "key": key, "value": value, "ttlMillis": ttl.as_millis() as u64 }),
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CodeError> {
        self.call("remove", json!({ "key": key }))?;
        Ok(())
    }
}

/// Serves a local store to other nodes as internal service `kv`.
pub struct KvService {
    store: Arc<dyn KvStore>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KvArgs {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    ttl_millis: Option<u64>,
}

impl KvService {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        KvService { store }
    }
}

impl Endpoint for KvService {
    fn name(&self) -> &str {
        KV_SERVICE_NAME
    }

    fn internal(&self) -> bool {
        true
    }

    fn handle(&self, _ctx: &RequestContext, fn_name: &str, argument: Value) -> Result<Option<Value>, CodeError> {
        let args: KvArgs = serde_json::from_value(argument)
            .map_err(|e| CodeError::bad_request(format!("invalid kv argument: {}", e)))?;
        match fn_name {
            "get" => Ok(self.store.get(&args.key)?.map(Value::String)),
            "set" => {
                let value = args
                    .value
                    .ok_or_else(|| CodeError::bad_request("kv set needs a value"))?;
                let ttl = args.ttl_millis.map(Duration::from_millis).unwrap_or(DEFAULT_TTL);
                self.store.set(&args.key, &value, ttl)?;
                Ok(None)
            }
            "remove" => {
                self.store.remove(&args.key)?;
                Ok(None)
            }
            other => Err(fn_not_found(KV_SERVICE_NAME, other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct Registry {
    store: Arc<dyn KvStore>,
    prefix: String,
    ttl: Duration,
    owned: Mutex<FxHashSet<ConnectionId>>,
}

impl Registry {
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>, ttl: Duration) -> Self {
        Registry {
            store,
            prefix: prefix.into(),
            ttl,
            owned: Mutex::new(FxHashSet::default()),
        }
    }

    /// The default TTL applied by [`set`](Self::set).
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn key(&self, id: &ConnectionId) -> String {
        format!("{}{}", self.prefix, id)
    }

    pub fn get(&self, id: &ConnectionId) -> Result<Option<NodeId>, CodeError> {
        match self.store.get(&self.key(id))? {
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|e: String| CodeError::service_error(format!("registry entry for {} is corrupt: {}", id, e))),
            None => Ok(None),
        }
    }

    /// Record `node` as the owner of `id`. `ttl` defaults to the registry's.
    pub fn set(&self, id: &ConnectionId, node: &NodeId, ttl: Option<Duration>) -> Result<(), CodeError> {
        self.store
            .set(&self.key(id), &node.to_string(), ttl.unwrap_or(self.ttl))?;
        self.owned.lock().insert(*id);
        Ok(())
    }

    /// Remove the entry for `id`. On failure the id stays owned, so
    /// [`shutdown`](Self::shutdown) tries again.
    pub fn remove(&self, id: &ConnectionId) -> Result<(), CodeError> {
        self.store.remove(&self.key(id))?;
        self.owned.lock().remove(id);
        Ok(())
    }

    /// Ids set through this registry and not yet removed.
    pub fn owned(&self) -> Vec<ConnectionId> {
        self.owned.lock().iter().copied().collect()
    }

    /// Best-effort removal of every id this node set. Failures are logged.
    pub fn shutdown(&self) {
        let ids: Vec<ConnectionId> = self.owned.lock().drain().collect();
        let mut failed = 0usize;
        for id in &ids {
            if let Err(err) = self.store.remove(&self.key(id)) {
                failed += 1;
                warn!(target: "registry", conn_id = %id, error = %err, "failed to remove registry entry");
            }
        }
        debug!(target: "registry", removed = ids.len() - failed, failed, "registry shut down");
    }
}
