//! The connection manager service loop
//!
//! # Architecture
//!
//! The manager owns the [`ConnectionRegistry`] and is the only code that
//! mutates it. Each poll:
//! - Applies pending connection-loss events
//! - Fetches the desired topology, then applies loss events that arrived
//!   while the fetch was in flight
//! - Runs a reconciliation pass and waits for it to settle
//! - Picks the next delay from the number of event loops and open connections
//!
//! Polls never overlap. The delay is measured from the end of the previous
//! pass, and loss events keep being applied while waiting for the next poll.
//! A failed discovery or a panicking pass only shortens the next delay.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use rackrpc_common::protocol::error::Result;
use rackrpc_common::transport::{TlsContext, TlsIdentity};
use rackrpc_common::CommandTable;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::backoff::{BackoffScheduler, IntervalClass};
use crate::config::ClientConfig;
use crate::connection::{ConnectionEvent, Connector};
use crate::discovery::{Discovery, HttpDiscovery};
use crate::reconcile::ReconciliationEngine;
use crate::registry::ConnectionRegistry;
use crate::selector::ClientSelector;

const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Keeps the cluster connected to every event loop the region advertises.
pub struct ConnectionManager<D> {
    discovery: D,
    engine: ReconciliationEngine,
    registry: ConnectionRegistry,
    scheduler: BackoffScheduler,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    last_interval: watch::Sender<Option<IntervalClass>>,
}

impl<D: Discovery> ConnectionManager<D> {
    /// Creates a manager and the selector reading its registry.
    ///
    /// # Arguments
    ///
    /// * `config` - Intervals, jitter and timeouts
    /// * `discovery` - Source of the desired topology
    /// * `tls` - Local identity for the `StartTLS` upgrade
    /// * `table` - Commands the region may call on the cluster
    pub fn new(
        config: &ClientConfig,
        discovery: D,
        tls: TlsContext,
        table: Arc<CommandTable>,
    ) -> (Self, ClientSelector) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connector = Connector::new(tls, table, events_tx).with_timeouts(
            config.connect_timeout,
            config.handshake_timeout,
            config.call_timeout,
        );
        let registry = ConnectionRegistry::new();
        let selector = ClientSelector::new(registry.subscribe());
        let (last_interval, _) = watch::channel(None);

        let manager = Self {
            discovery,
            engine: ReconciliationEngine::new(connector),
            registry,
            scheduler: BackoffScheduler::new(config.intervals, config.jitter),
            events: events_rx,
            last_interval,
        };
        (manager, selector)
    }

    pub fn selector(&self) -> ClientSelector {
        ClientSelector::new(self.registry.subscribe())
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Interval class chosen by the most recent poll.
    pub fn last_interval(&self) -> Option<IntervalClass> {
        self.scheduler.last()
    }

    /// Receiver for the interval class chosen by each poll.
    pub fn interval_watch(&self) -> watch::Receiver<Option<IntervalClass>> {
        self.last_interval.subscribe()
    }

    /// Runs one poll and returns the interval class it chose, together with
    /// the delay until the next poll.
    pub async fn poll_once(&mut self) -> (IntervalClass, Duration) {
        self.apply_events();

        let num_endpoints = match self.discovery.fetch().await {
            Ok(desired) => {
                self.apply_events();
                let pass = AssertUnwindSafe(self.engine.reconcile(&mut self.registry, &desired))
                    .catch_unwind()
                    .await;
                match pass {
                    Ok(outcome) => {
                        if !outcome.is_noop() {
                            info!(
                                dropped = outcome.dropped.len(),
                                connected = outcome.connected.len(),
                                failed = outcome.failed.len(),
                                "reconciliation pass finished"
                            );
                        }
                        Some(desired.len())
                    }
                    Err(_) => {
                        error!("reconciliation pass panicked");
                        None
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "event loop discovery failed");
                None
            }
        };

        self.apply_events();

        let (class, delay) = self.scheduler.schedule(num_endpoints, self.registry.open_count());
        self.last_interval.send_replace(Some(class));
        debug!(
            interval = %class,
            delay_ms = delay.as_millis() as u64,
            endpoints = ?num_endpoints,
            open = self.registry.open_count(),
            "next poll scheduled"
        );
        (class, delay)
    }

    fn apply_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.apply_event(event);
        }
    }

    fn apply_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Lost { endpoint, id } => {
                match self.registry.remove_if_current(&endpoint, id) {
                    Some(connection) => info!(
                        endpoint = %endpoint,
                        addr = %connection.address(),
                        connection_id = id,
                        "connection lost"
                    ),
                    None => debug!(
                        endpoint = %endpoint,
                        connection_id = id,
                        "ignoring loss of connection no longer registered"
                    ),
                }
            }
        }
    }

    /// Polls until `shutdown` resolves, then closes every connection.
    ///
    /// A pass in progress when `shutdown` resolves is abandoned; connections
    /// it had opened are closed rather than registered.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        info!("connection manager started");

        'poll: loop {
            let delay = tokio::select! {
                (_, delay) = self.poll_once() => delay,
                _ = &mut shutdown => break 'poll,
            };

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    Some(event) = self.events.recv() => self.apply_event(event),
                    _ = &mut shutdown => break 'poll,
                }
            }
        }

        self.close_all().await;
        info!("connection manager stopped");
    }

    async fn close_all(&mut self) {
        let connections = self.registry.drain();
        for connection in &connections {
            connection.close();
        }
        let closing = connections
            .iter()
            .map(|c| tokio::time::timeout(CLOSE_GRACE, c.closed()));
        join_all(closing).await;
    }
}

impl<D: Discovery + 'static> ConnectionManager<D> {
    /// Starts the service loop on its own task.
    pub fn spawn(self) -> ManagerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let interval = self.interval_watch();
        let task = tokio::spawn(self.run(async {
            let _ = shutdown_rx.await;
        }));
        ManagerHandle {
            shutdown: shutdown_tx,
            interval,
            task,
        }
    }
}

impl ConnectionManager<HttpDiscovery> {
    /// Builds a manager from configuration, loading the TLS identity from
    /// disk and discovering event loops over HTTP.
    pub fn from_config(config: &ClientConfig, table: Arc<CommandTable>) -> Result<(Self, ClientSelector)> {
        let identity = TlsIdentity::from_pem_files(
            &config.tls.certificate,
            &config.tls.key,
            &config.tls.authorities,
        )?;
        let tls = TlsContext::new(identity, &config.server_name)?;
        let discovery = HttpDiscovery::new(&config.region_url, config.discovery_timeout)?;
        Ok(Self::new(config, discovery, tls, table))
    }
}

/// Handle to a spawned manager.
pub struct ManagerHandle {
    shutdown: oneshot::Sender<()>,
    interval: watch::Receiver<Option<IntervalClass>>,
    task: tokio::task::JoinHandle<()>,
}

impl ManagerHandle {
    /// Interval class chosen by the most recent poll.
    pub fn last_interval(&self) -> Option<IntervalClass> {
        *self.interval.borrow()
    }

    /// Stops the manager and waits for its connections to close.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            error!(error = %e, "connection manager task failed");
        }
    }
}
