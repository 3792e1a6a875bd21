//! Registry of the connections held by the cluster
//!
//! At most one connection per event loop name. The registry is owned and
//! mutated by the manager's task only; every mutation republishes the set
//! of open connections on a `watch` channel, which is where selectors and
//! diagnostics read from.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;

use crate::connection::{Connection, ConnectionId};
use crate::discovery::EndpointAddress;

/// Point-in-time copy of the open connections.
pub type Snapshot = Arc<Vec<Connection>>;

pub struct ConnectionRegistry {
    entries: HashMap<String, Connection>,
    snapshot: watch::Sender<Snapshot>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            entries: HashMap::new(),
            snapshot,
        }
    }

    /// Receiver for the snapshots published on each change.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    /// Registers `connection` under its endpoint name, returning the entry
    /// it replaced.
    pub fn insert(&mut self, connection: Connection) -> Option<Connection> {
        let previous = self
            .entries
            .insert(connection.endpoint().to_string(), connection);
        self.publish();
        previous
    }

    pub fn remove(&mut self, endpoint: &str) -> Option<Connection> {
        let removed = self.entries.remove(endpoint);
        if removed.is_some() {
            self.publish();
        }
        removed
    }

    /// Removes the entry for `endpoint` only if it is the connection `id`.
    ///
    /// A loss notification may arrive after its connection was already
    /// replaced; it must not remove the replacement.
    pub fn remove_if_current(&mut self, endpoint: &str, id: ConnectionId) -> Option<Connection> {
        match self.entries.get(endpoint) {
            Some(current) if current.id() == id => self.remove(endpoint),
            _ => None,
        }
    }

    /// Removes every entry whose connection has started closing.
    pub fn remove_closed(&mut self) -> Vec<Connection> {
        let closed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, connection)| !connection.is_open())
            .map(|(name, _)| name.clone())
            .collect();
        let removed: Vec<Connection> = closed
            .iter()
            .filter_map(|name| self.entries.remove(name))
            .collect();
        if !removed.is_empty() {
            self.publish();
        }
        removed
    }

    pub fn get(&self, endpoint: &str) -> Option<&Connection> {
        self.entries.get(endpoint)
    }

    pub fn contains(&self, endpoint: &str) -> bool {
        self.entries.contains_key(endpoint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn open_count(&self) -> usize {
        self.entries.values().filter(|c| c.is_open()).count()
    }

    /// Endpoint names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// `(endpoint, address in use)` for every entry.
    pub fn addresses(&self) -> impl Iterator<Item = (&str, &EndpointAddress)> {
        self.entries
            .iter()
            .map(|(name, connection)| (name.as_str(), connection.address()))
    }

    /// Removes every entry.
    pub fn drain(&mut self) -> Vec<Connection> {
        let drained: Vec<Connection> = self.entries.drain().map(|(_, c)| c).collect();
        self.publish();
        drained
    }

    fn publish(&self) {
        let open: Vec<Connection> = self
            .entries
            .values()
            .filter(|c| c.is_open())
            .cloned()
            .collect();
        self.snapshot.send_replace(Arc::new(open));
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}
