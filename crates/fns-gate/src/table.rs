//! Per-node map of live connections.
//!
//! Entries have no TTL; they live exactly as long as the connection's task
//! and are added and removed only by the websockets service.

use std::sync::Arc;

use fns_ws::{Connection, ConnectionId};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

#[derive(Default)]
pub struct ConnTable {
    conns: RwLock<FxHashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.conns.read().get(id).cloned()
    }

    /// Insert `conn` under its own id, returning any previous entry.
    pub fn set(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        self.conns.write().insert(conn.id(), conn)
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.conns.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.conns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.read().is_empty()
    }

    /// Clone out every connection; the lock is not held afterwards.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.conns.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fns_ws::{ConnectionConfig, Role};
    use std::net::{TcpListener, TcpStream};

    fn conn() -> Arc<Connection> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        Arc::new(Connection::new(stream, Role::Server, ConnectionConfig::default(), Vec::new()).unwrap())
    }

    #[test]
    fn set_get_remove() {
        let table = ConnTable::new();
        let c = conn();
        let id = c.id();
        assert!(table.set(Arc::clone(&c)).is_none());
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&id).unwrap().id(), id);
        assert!(table.remove(&id).is_some());
        assert!(table.get(&id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn concurrent_access() {
        let table = Arc::new(ConnTable::new());
        let conns: Vec<_> = (0..8).map(|_| conn()).collect();
        let handles: Vec<_> = conns
            .iter()
            .cloned()
            .map(|c| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    let id = c.id();
                    table.set(c);
                    assert!(table.get(&id).is_some());
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(table.snapshot().len(), 8);
    }
}
