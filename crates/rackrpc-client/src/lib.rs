//! rackrpc Client
//!
//! This crate keeps the cluster connected to its region. It discovers the
//! event loops the region publishes, holds one authenticated connection per
//! event loop, and lets the rest of the cluster make calls over whichever of
//! them happens to be open.
//!
//! # Architecture
//!
//! - **Discovery**: [`HttpDiscovery`] fetches the desired topology from the region
//! - **Backoff**: [`BackoffScheduler`] picks the next poll delay from the last outcome
//! - **Connection**: [`Connector`] dials, upgrades to TLS and verifies identity
//! - **Reconciliation**: [`ReconciliationEngine`] drops stale connections and opens missing ones
//! - **Selection**: [`ClientSelector`] picks an open connection at random
//! - **Manager**: [`ConnectionManager`] owns the registry and drives the poll loop
//!
//! Only the manager's task mutates the [`ConnectionRegistry`]. Everything
//! else reads snapshots it publishes.
//!
//! # Example
//!
//! ```no_run
//! use rackrpc_client::{ClientConfig, ConnectionManager};
//! use rackrpc_common::{commands, CommandTable};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ClientConfig::default();
//!     let table = Arc::new(CommandTable::with_identity("cluster1"));
//!     let (manager, selector) = ConnectionManager::from_config(&config, table).unwrap();
//!     let handle = manager.spawn();
//!
//!     let result = selector.call(commands::LIST_BOOT_IMAGES, json!({})).await;
//!     println!("{:?}", result);
//!
//!     handle.shutdown().await;
//! }
//! ```

pub mod backoff;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod manager;
pub mod reconcile;
pub mod registry;
pub mod selector;

pub use backoff::{compute_interval, BackoffScheduler, IntervalClass, PollIntervals};
pub use config::{ClientConfig, TlsPaths};
pub use connection::{
    ConnectFailure, Connection, ConnectionAttempt, ConnectionEvent, ConnectionId, ConnectionState,
    Connector,
};
pub use discovery::{DesiredTopology, Discovery, DiscoveryError, Endpoint, EndpointAddress, HttpDiscovery};
pub use manager::{ConnectionManager, ManagerHandle};
pub use reconcile::{ReconcileOutcome, ReconcilePlan, ReconciliationEngine};
pub use registry::ConnectionRegistry;
pub use selector::{ClientSelector, ConnectionInfo};
