//! ConnectionManager Integration Tests
//!
//! Tests cover:
//! - Poll outcomes and the interval they choose
//! - Discovery failure leaving the registry untouched
//! - Removal of connections the region closed, and late loss notifications
//! - Calls in both directions over managed connections
//! - Shutdown of a spawned manager

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{tls_context, unreachable_address, EventLoop, ScriptedDiscovery};
use rackrpc_client::{
    ClientConfig, ConnectionManager, DesiredTopology, Discovery, DiscoveryError, IntervalClass,
    PollIntervals,
};
use rackrpc_common::{commands, CommandTable, RemoteError, RpcError, TlsContext};
use rackrpc_server::PeerSet;
use serde_json::json;

fn config() -> ClientConfig {
    ClientConfig {
        intervals: PollIntervals {
            low: Duration::from_millis(50),
            mid: Duration::from_millis(100),
            high: Duration::from_millis(200),
        },
        jitter: 0.0,
        connect_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(5),
        call_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn manager(
    tls: &TlsContext,
    discovery: ScriptedDiscovery,
) -> (ConnectionManager<ScriptedDiscovery>, rackrpc_client::ClientSelector) {
    ConnectionManager::new(
        &config(),
        discovery,
        tls.clone(),
        Arc::new(CommandTable::with_identity("cluster1")),
    )
}

// ============================================================================
// Poll Outcome Tests
// ============================================================================

#[tokio::test]
async fn test_poll_fully_connected_is_high() {
    let tls = tls_context();
    let region = EventLoop::start(&tls, "region1").await;
    let discovery = ScriptedDiscovery::new(DesiredTopology::new().with("region1", vec![region.address()]));
    let (mut manager, selector) = manager(&tls, discovery);

    let (class, delay) = manager.poll_once().await;

    assert_eq!(class, IntervalClass::High);
    assert_eq!(delay, Duration::from_millis(200));
    assert_eq!(manager.last_interval(), Some(IntervalClass::High));
    assert_eq!(selector.snapshot().len(), 1);
}

#[tokio::test]
async fn test_poll_partially_connected_is_mid() {
    let tls = tls_context();
    let region = EventLoop::start(&tls, "region1").await;
    let discovery = ScriptedDiscovery::new(
        DesiredTopology::new()
            .with("region1", vec![region.address()])
            .with("region2", vec![unreachable_address().await]),
    );
    let (mut manager, _selector) = manager(&tls, discovery);

    let (class, _) = manager.poll_once().await;

    assert_eq!(class, IntervalClass::Mid);
}

#[tokio::test]
async fn test_poll_empty_topology_is_low() {
    let tls = tls_context();
    let (mut manager, _selector) = manager(&tls, ScriptedDiscovery::new(DesiredTopology::new()));

    let (class, _) = manager.poll_once().await;

    assert_eq!(class, IntervalClass::Low);
    assert!(manager.registry().is_empty());
}

#[tokio::test]
async fn test_discovery_failure_is_low_and_leaves_registry() {
    let tls = tls_context();
    let region = EventLoop::start(&tls, "region1").await;
    let discovery = ScriptedDiscovery::new(DesiredTopology::new().with("region1", vec![region.address()]));
    let (mut manager, _selector) = manager(&tls, discovery.clone());
    manager.poll_once().await;
    let id = manager.registry().get("region1").unwrap().id();

    discovery.set(None);
    let (class, delay) = manager.poll_once().await;

    assert_eq!(class, IntervalClass::Low);
    assert_eq!(delay, Duration::from_millis(50));
    assert_eq!(manager.registry().len(), 1);
    assert_eq!(manager.registry().get("region1").unwrap().id(), id);
}

#[tokio::test]
async fn test_discovery_failure_on_empty_registry() {
    let tls = tls_context();
    let discovery = ScriptedDiscovery::default();
    let (mut manager, selector) = manager(&tls, discovery);

    let (class, _) = manager.poll_once().await;

    assert_eq!(class, IntervalClass::Low);
    assert!(manager.registry().is_empty());
    assert!(matches!(selector.select(), Err(RpcError::NoConnectionsAvailable)));
}

// ============================================================================
// Connection Loss Tests
// ============================================================================

#[tokio::test]
async fn test_connection_closed_by_region_is_removed() {
    let tls = tls_context();
    let region = EventLoop::start(&tls, "region1").await;
    let discovery = ScriptedDiscovery::new(DesiredTopology::new().with("region1", vec![region.address()]));
    let (mut manager, selector) = manager(&tls, discovery.clone());
    manager.poll_once().await;
    let connection = manager.registry().get("region1").unwrap().clone();

    region.peers.close_all();
    tokio::time::timeout(Duration::from_secs(5), connection.closed())
        .await
        .unwrap();
    assert!(matches!(selector.select(), Err(RpcError::NoConnectionsAvailable)));

    discovery.set(None);
    manager.poll_once().await;
    assert!(manager.registry().is_empty());
}

#[tokio::test]
async fn test_late_loss_of_replaced_connection_is_ignored() {
    let tls = tls_context();
    let old_home = EventLoop::start(&tls, "region1").await;
    let new_home = EventLoop::start(&tls, "region1").await;
    let discovery = ScriptedDiscovery::new(DesiredTopology::new().with("region1", vec![old_home.address()]));
    let (mut manager, _selector) = manager(&tls, discovery.clone());
    manager.poll_once().await;
    let old = manager.registry().get("region1").unwrap().clone();

    discovery.set(Some(DesiredTopology::new().with("region1", vec![new_home.address()])));
    manager.poll_once().await;
    let new_id = manager.registry().get("region1").unwrap().id();
    tokio::time::timeout(Duration::from_secs(5), old.closed())
        .await
        .unwrap();

    // Any loss notification still pending for the old connection is applied here.
    discovery.set(None);
    manager.poll_once().await;

    assert_eq!(manager.registry().len(), 1);
    assert_eq!(manager.registry().get("region1").unwrap().id(), new_id);
    assert!(manager.registry().get("region1").unwrap().is_open());
}

/// Always returns the same topology, but disconnects every peer of an event
/// loop while the second fetch is in flight.
#[derive(Clone)]
struct DisconnectingDiscovery {
    topology: DesiredTopology,
    peers: PeerSet,
    fetches: Arc<AtomicUsize>,
}

impl Discovery for DisconnectingDiscovery {
    async fn fetch(&self) -> Result<DesiredTopology, DiscoveryError> {
        if self.fetches.fetch_add(1, Ordering::SeqCst) == 1 {
            self.peers.close_all();
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        Ok(self.topology.clone())
    }
}

#[tokio::test]
async fn test_connection_lost_during_discovery_is_reconnected_in_same_pass() {
    let tls = tls_context();
    let region = EventLoop::start(&tls, "region1").await;
    let discovery = DisconnectingDiscovery {
        topology: DesiredTopology::new().with("region1", vec![region.address()]),
        peers: region.peers.clone(),
        fetches: Arc::new(AtomicUsize::new(0)),
    };
    let (mut manager, selector) = ConnectionManager::new(
        &config(),
        discovery,
        tls.clone(),
        Arc::new(CommandTable::with_identity("cluster1")),
    );
    manager.poll_once().await;
    let first = manager.registry().get("region1").unwrap().id();

    let (class, _) = manager.poll_once().await;

    assert_eq!(class, IntervalClass::High);
    assert_eq!(manager.registry().len(), 1);
    let current = manager.registry().get("region1").unwrap();
    assert_ne!(current.id(), first);
    assert!(current.is_open());
    assert_eq!(selector.open_count(), 1);
}

// ============================================================================
// Call Tests
// ============================================================================

#[tokio::test]
async fn test_selector_call_reaches_event_loop() {
    let tls = tls_context();
    let region = EventLoop::start(&tls, "region1").await;
    let discovery = ScriptedDiscovery::new(DesiredTopology::new().with("region1", vec![region.address()]));
    let (mut manager, selector) = manager(&tls, discovery);
    manager.poll_once().await;

    let result = selector.call(commands::IDENTIFY, json!({})).await.unwrap();
    assert_eq!(result["ident"], "region1");

    let error = selector.call(commands::POWER_ON, json!({})).await.unwrap_err();
    assert!(matches!(error, RpcError::Remote(ref e) if e.code == "UnhandledCommand"));
}

#[tokio::test]
async fn test_event_loop_calls_into_cluster() {
    let tls = tls_context();
    let region = EventLoop::start(&tls, "region1").await;
    let discovery = ScriptedDiscovery::new(DesiredTopology::new().with("region1", vec![region.address()]));

    let mut table = CommandTable::with_identity("cluster1");
    table.register(commands::DESCRIBE_POWER_TYPES, |_args| async {
        Ok::<_, RemoteError>(json!({"power_types": [{"name": "ipmi"}]}))
    });
    let (mut manager, _selector) =
        ConnectionManager::new(&config(), discovery, tls.clone(), Arc::new(table));
    manager.poll_once().await;

    region.wait_for_peers(1).await;
    let (_, cluster) = region.peers.sessions().pop().unwrap();

    let ident = cluster.call(commands::IDENTIFY, json!({}), None).await.unwrap();
    assert_eq!(ident["ident"], "cluster1");
    let types = cluster
        .call(commands::DESCRIBE_POWER_TYPES, json!({}), None)
        .await
        .unwrap();
    assert_eq!(types["power_types"][0]["name"], "ipmi");
}

// ============================================================================
// Service Loop Tests
// ============================================================================

#[tokio::test]
async fn test_spawned_manager_connects_and_shuts_down() {
    let tls = tls_context();
    let region1 = EventLoop::start(&tls, "region1").await;
    let region2 = EventLoop::start(&tls, "region2").await;
    let discovery = ScriptedDiscovery::new(
        DesiredTopology::new()
            .with("region1", vec![region1.address()])
            .with("region2", vec![region2.address()]),
    );
    let (manager, mut selector) = manager(&tls, discovery);
    let handle = manager.spawn();

    tokio::time::timeout(Duration::from_secs(5), selector.wait_for_open(2))
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.last_interval() != Some(IntervalClass::High) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    handle.shutdown().await;

    assert!(matches!(selector.select(), Err(RpcError::NoConnectionsAvailable)));
    region1.wait_for_peers(0).await;
    region2.wait_for_peers(0).await;
}

#[tokio::test]
async fn test_spawned_manager_reconnects_after_loss() {
    let tls = tls_context();
    let region = EventLoop::start(&tls, "region1").await;
    let discovery = ScriptedDiscovery::new(DesiredTopology::new().with("region1", vec![region.address()]));
    let (manager, mut selector) = manager(&tls, discovery);
    let handle = manager.spawn();

    tokio::time::timeout(Duration::from_secs(5), selector.wait_for_open(1))
        .await
        .unwrap()
        .unwrap();
    let first = selector.select().unwrap();

    region.peers.close_all();
    tokio::time::timeout(Duration::from_secs(5), first.closed())
        .await
        .unwrap();

    let reconnected = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(connection) = selector.select() {
                if connection.id() != first.id() {
                    return connection;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(reconnected.endpoint(), "region1");

    handle.shutdown().await;
}
