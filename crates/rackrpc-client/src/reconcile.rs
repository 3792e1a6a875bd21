//! Reconciliation of held connections against the desired topology
//!
//! One pass runs in two phases:
//!
//! 1. **Drop**: every entry that is no longer open, whose event loop is gone,
//!    or whose address is no longer advertised for it, is removed from the
//!    registry and closed.
//!    Removal is immediate; the transport is torn down in the background.
//! 2. **Connect**: every advertised event loop without an entry is dialled.
//!    Event loops are connected concurrently; the addresses of one event
//!    loop are tried in order, one at a time.
//!
//! Dropping first means an event loop that moved address is replaced rather
//! than held twice. An event loop that could not be reached is left out
//! until the next pass.

use futures::future::join_all;
use tracing::{info, warn};

use crate::connection::{Connection, Connector};
use crate::discovery::{DesiredTopology, Endpoint, EndpointAddress};
use crate::registry::ConnectionRegistry;

/// Actions one pass will take.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Endpoint names to drop.
    pub drop: Vec<String>,
    /// Endpoints to connect, with their candidate addresses in order.
    pub connect: Vec<Endpoint>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.drop.is_empty() && self.connect.is_empty()
    }
}

/// Computes the actions needed to bring `current` in line with `desired`.
///
/// `current` yields the endpoint name and address in use of each held
/// connection.
pub fn plan<'a>(
    current: impl IntoIterator<Item = (&'a str, &'a EndpointAddress)>,
    desired: &DesiredTopology,
) -> ReconcilePlan {
    let mut kept = Vec::new();
    let mut drop = Vec::new();
    for (name, address) in current {
        if desired.allows(name, address) {
            kept.push(name);
        } else {
            drop.push(name.to_string());
        }
    }
    drop.sort();

    let connect = desired
        .endpoints()
        .filter(|endpoint| !kept.contains(&endpoint.name.as_str()))
        .collect();

    ReconcilePlan { drop, connect }
}

/// What a pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub dropped: Vec<String>,
    pub connected: Vec<String>,
    pub failed: Vec<String>,
}

impl ReconcileOutcome {
    /// Whether the pass neither dropped nor attempted anything.
    pub fn is_noop(&self) -> bool {
        self.dropped.is_empty() && self.connected.is_empty() && self.failed.is_empty()
    }
}

/// Drives connection lifecycles to match the desired topology.
#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    connector: Connector,
}

impl ReconciliationEngine {
    pub fn new(connector: Connector) -> Self {
        Self { connector }
    }

    /// Runs one pass against `registry`.
    ///
    /// Returns once every connection attempt launched by the pass has
    /// settled.
    pub async fn reconcile(
        &self,
        registry: &mut ConnectionRegistry,
        desired: &DesiredTopology,
    ) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();

        // A session may have ended after the last loss event was applied.
        for connection in registry.remove_closed() {
            info!(
                endpoint = %connection.endpoint(),
                addr = %connection.address(),
                connection_id = connection.id(),
                "dropping connection that is no longer open"
            );
            outcome.dropped.push(connection.endpoint().to_string());
        }

        let plan = plan(registry.addresses(), desired);

        for name in plan.drop {
            if let Some(connection) = registry.remove(&name) {
                info!(
                    endpoint = %name,
                    addr = %connection.address(),
                    connection_id = connection.id(),
                    "dropping connection no longer in topology"
                );
                connection.close();
                outcome.dropped.push(name);
            }
        }

        let attempts = plan
            .connect
            .iter()
            .map(|endpoint| self.connect_endpoint(endpoint));
        let results = join_all(attempts).await;

        for (endpoint, result) in plan.connect.into_iter().zip(results) {
            match result {
                Some(connection) => {
                    registry.insert(connection);
                    outcome.connected.push(endpoint.name);
                }
                None => outcome.failed.push(endpoint.name),
            }
        }

        outcome
    }

    /// Tries the addresses of `endpoint` in order.
    ///
    /// Once an address accepts the TCP connection no further address is
    /// tried in this pass, whether or not authentication then succeeds.
    async fn connect_endpoint(&self, endpoint: &Endpoint) -> Option<Connection> {
        if endpoint.addresses.is_empty() {
            warn!(endpoint = %endpoint.name, "event loop advertised without addresses");
            return None;
        }

        for address in &endpoint.addresses {
            info!(endpoint = %endpoint.name, addr = %address, "making connection");
            match self.connector.connect(&endpoint.name, address).await {
                Ok(connection) => return Some(connection),
                Err(failure) if failure.reached_authentication() => {
                    warn!(
                        endpoint = %endpoint.name,
                        addr = %address,
                        error = %failure.error,
                        "authentication failed; retrying next poll"
                    );
                    return None;
                }
                Err(failure) => {
                    warn!(
                        endpoint = %endpoint.name,
                        addr = %address,
                        error = %failure.error,
                        "connection failed"
                    );
                }
            }
        }

        warn!(endpoint = %endpoint.name, "no address reachable; retrying next poll");
        None
    }
}
