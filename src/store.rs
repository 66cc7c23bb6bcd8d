use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;

use crate::connection::Connection;
use crate::message::SessionId;

/// Concurrent registry of per-peer connections.
///
/// At most one connection per peer address. `find` resolves a session id
/// to the connection that established it, through a secondary index
/// maintained via [`ConnectionStore::put_session_id`] when a session is
/// established.
pub trait ConnectionStore: Send + Sync {
    fn put(&self, connection: Arc<Connection>);

    fn get(&self, peer: SocketAddr) -> Option<Arc<Connection>>;

    fn find(&self, session_id: &SessionId) -> Option<Arc<Connection>>;

    fn remove(&self, peer: SocketAddr) -> Option<Arc<Connection>>;

    /// Index `session_id` to the connection at `peer`.
    fn put_session_id(&self, session_id: SessionId, peer: SocketAddr);

    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The default in-memory store. Session resumption is possible only for
/// as long as the process lives; nothing is persisted.
#[derive(Default)]
pub struct InMemoryConnectionStore {
    by_peer: DashMap<SocketAddr, Arc<Connection>>,
    by_session: DashMap<SessionId, SocketAddr>,
}

impl InMemoryConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConnectionStore for InMemoryConnectionStore {
    fn put(&self, connection: Arc<Connection>) {
        self.by_peer.insert(connection.peer_addr(), connection);
    }

    fn get(&self, peer: SocketAddr) -> Option<Arc<Connection>> {
        self.by_peer.get(&peer).map(|e| e.value().clone())
    }

    fn find(&self, session_id: &SessionId) -> Option<Arc<Connection>> {
        let peer = *self.by_session.get(session_id)?.value();
        self.get(peer)
    }

    fn remove(&self, peer: SocketAddr) -> Option<Arc<Connection>> {
        let (_, connection) = self.by_peer.remove(&peer)?;
        self.by_session.retain(|_, addr| *addr != peer);
        Some(connection)
    }

    fn put_session_id(&self, session_id: SessionId, peer: SocketAddr) {
        if session_id.is_empty() {
            return;
        }
        self.by_session.insert(session_id, peer);
    }

    fn clear(&self) {
        self.by_peer.clear();
        self.by_session.clear();
    }

    fn len(&self) -> usize {
        self.by_peer.len()
    }
}
