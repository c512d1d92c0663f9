use crate::config::Peer;
use crate::node::connection::Connection;
use crate::node::connection::ConnectionKey;
use crate::node::connection::ConnectionState;
use std::collections::HashMap;
use std::collections::HashSet;
use tokio::time::Instant;

/// Every piece of shared mutable state, guarded by one
/// `parking_lot::Mutex` on the node. Holding the one lock is what
/// serializes connection state transitions, hop-by-hop issuance and the
/// persistent-peer set against each other.
pub(crate) struct Registry {
    pub connections: HashMap<ConnectionKey, Connection>,
    /// Peers the reconnect worker keeps alive. Additive only.
    pub persistent_peers: HashSet<Peer>,
    pub please_stop: bool,
    pub shutdown_deadline: Option<Instant>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Registry {
            connections: HashMap::new(),
            persistent_peers: HashSet::new(),
            please_stop: false,
            shutdown_deadline: None,
        }
    }

    pub(crate) fn insert(&mut self, connection: Connection) -> ConnectionKey {
        let key = connection.key;
        self.connections.insert(key, connection);
        key
    }

    pub(crate) fn remove(&mut self, key: ConnectionKey) -> Option<Connection> {
        self.connections.remove(&key)
    }

    pub(crate) fn get(&self, key: ConnectionKey) -> Option<&Connection> {
        self.connections.get(&key)
    }

    pub(crate) fn get_mut(&mut self, key: ConnectionKey) -> Option<&mut Connection> {
        self.connections.get_mut(&key)
    }

    pub(crate) fn is_valid(&self, key: ConnectionKey) -> bool {
        self.connections.contains_key(&key)
    }

    /// Only ready connections count for peer lookup.
    pub(crate) fn find_ready_by_peer(&self, peer: &Peer) -> Option<ConnectionKey> {
        self.connections
            .values()
            .find(|conn| conn.state == ConnectionState::Ready && conn.peer.as_ref() == Some(peer))
            .map(|conn| conn.key)
    }

    /// A ready connection advertising `host_id`, other than `excluding`.
    /// This is what the CER election checks against.
    pub(crate) fn find_ready_by_host_id(
        &self,
        host_id: &str,
        excluding: ConnectionKey,
    ) -> Option<ConnectionKey> {
        self.connections
            .values()
            .find(|conn| {
                conn.key != excluding
                    && conn.state == ConnectionState::Ready
                    && conn
                        .host_id
                        .as_deref()
                        .is_some_and(|existing| existing.eq_ignore_ascii_case(host_id))
            })
            .map(|conn| conn.key)
    }

    /// Whether any connection, in any state, is associated with `peer`.
    /// Keeps `initiate_connection` idempotent.
    pub(crate) fn has_connection_to(&self, peer: &Peer) -> bool {
        self.connections
            .values()
            .any(|conn| conn.peer.as_ref() == Some(peer))
    }

    pub(crate) fn ready_count(&self) -> usize {
        self.connections
            .values()
            .filter(|conn| conn.state == ConnectionState::Ready)
            .count()
    }

    pub(crate) fn keys(&self) -> Vec<ConnectionKey> {
        self.connections.keys().copied().collect()
    }
}
