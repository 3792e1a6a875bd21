//! Random selection over open connections
//!
//! Selection works on the latest snapshot published by the registry and
//! never waits on the manager's task.

use rackrpc_common::protocol::error::{Result, RpcError};
use rackrpc_common::RpcResult;
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::watch;

use crate::connection::{Connection, ConnectionId};
use crate::discovery::EndpointAddress;
use crate::registry::Snapshot;

/// Diagnostic view of one open connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub endpoint: String,
    pub address: EndpointAddress,
    pub connection_id: ConnectionId,
}

/// Picks connections for outbound calls. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ClientSelector {
    snapshot: watch::Receiver<Snapshot>,
}

impl ClientSelector {
    pub fn new(snapshot: watch::Receiver<Snapshot>) -> Self {
        Self { snapshot }
    }

    fn open_connections(&self) -> Vec<Connection> {
        let snapshot = self.snapshot.borrow().clone();
        snapshot.iter().filter(|c| c.is_open()).cloned().collect()
    }

    /// Returns one open connection, chosen uniformly at random.
    ///
    /// Fails with [`RpcError::NoConnectionsAvailable`] when nothing is open;
    /// retrying is up to the caller.
    pub fn select(&self) -> Result<Connection> {
        self.open_connections()
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(RpcError::NoConnectionsAvailable)
    }

    /// Selects a connection and invokes `command` on it.
    pub async fn call(&self, command: &str, args: serde_json::Value) -> Result<RpcResult> {
        self.select()?.call(command, args).await
    }

    /// Open connections at this instant, sorted by endpoint name.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .open_connections()
            .iter()
            .map(|c| ConnectionInfo {
                endpoint: c.endpoint().to_string(),
                address: c.address().clone(),
                connection_id: c.id(),
            })
            .collect();
        infos.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        infos
    }

    pub fn open_count(&self) -> usize {
        self.open_connections().len()
    }

    /// Waits until at least `count` connections are open.
    ///
    /// Returns an error if the registry is gone before that happens.
    pub async fn wait_for_open(&mut self, count: usize) -> Result<()> {
        self.snapshot
            .wait_for(|snapshot| snapshot.iter().filter(|c| c.is_open()).count() >= count)
            .await
            .map(|_| ())
            .map_err(|_| RpcError::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::open_connection;
    use crate::registry::ConnectionRegistry;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_select_on_empty_registry_fails() {
        let registry = ConnectionRegistry::new();
        let selector = ClientSelector::new(registry.subscribe());

        assert!(matches!(selector.select(), Err(RpcError::NoConnectionsAvailable)));
        assert!(selector.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_select_is_uniform() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut registry = ConnectionRegistry::new();
        let mut peers = Vec::new();
        for (name, host) in [("region1", "10.0.0.1"), ("region2", "10.0.0.2"), ("region3", "10.0.0.3")] {
            let (connection, remote) = open_connection(name, host, tx.clone());
            registry.insert(connection);
            peers.push(remote);
        }
        let selector = ClientSelector::new(registry.subscribe());

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..3000 {
            let connection = selector.select().unwrap();
            *counts.entry(connection.endpoint().to_string()).or_default() += 1;
        }

        assert_eq!(counts.len(), 3);
        for (name, count) in counts {
            // Expected 1000 each; 800..1200 is far beyond 6 standard deviations.
            assert!((800..=1200).contains(&count), "{} selected {} times", name, count);
        }
    }

    #[tokio::test]
    async fn test_select_skips_connections_closed_since_snapshot() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut registry = ConnectionRegistry::new();
        let (a, _ra) = open_connection("region1", "10.0.0.1", tx.clone());
        let (b, _rb) = open_connection("region2", "10.0.0.2", tx);
        registry.insert(a.clone());
        registry.insert(b);
        let selector = ClientSelector::new(registry.subscribe());

        a.close();

        for _ in 0..50 {
            assert_eq!(selector.select().unwrap().endpoint(), "region2");
        }
    }

    #[tokio::test]
    async fn test_snapshot_lists_open_connections() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut registry = ConnectionRegistry::new();
        let (b, _rb) = open_connection("region2", "10.0.0.2", tx.clone());
        let (a, _ra) = open_connection("region1", "10.0.0.1", tx);
        let a_id = a.id();
        registry.insert(b);
        registry.insert(a);
        let selector = ClientSelector::new(registry.subscribe());

        let snapshot = selector.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            snapshot[0],
            ConnectionInfo {
                endpoint: "region1".to_string(),
                address: EndpointAddress::new("10.0.0.1", 5250),
                connection_id: a_id,
            }
        );
        assert_eq!(selector.open_count(), 2);
    }
}
