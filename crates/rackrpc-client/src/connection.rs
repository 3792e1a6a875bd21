//! Per-endpoint connection lifecycle
//!
//! A connection moves through
//! `Connecting → Authenticating → Open → Closing → Closed`:
//!
//! 1. **Connecting**: TCP dial to one candidate address
//! 2. **Authenticating**: `StartTLS` over plaintext, in-place TLS upgrade as
//!    client, then `Identify` over the secured stream
//! 3. **Open**: the stream is owned by a [`Session`]; calls flow both ways
//! 4. **Closing/Closed**: local close, peer EOF or a transport failure
//!
//! `Identify` is never optional. Under TLS 1.3 a finished client handshake
//! does not prove the region accepted our certificate, so the channel is not
//! trusted until that round-trip has completed. A reply naming a different
//! event loop fails the attempt without the connection ever being exposed.
//!
//! When an open connection's session ends, a [`ConnectionEvent::Lost`] is
//! sent to the owner of the registry carrying the connection id, so that a
//! late notification from a superseded connection can be told apart from
//! one about the current entry.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rackrpc_common::commands::{self, IdentifyResult};
use rackrpc_common::protocol::error::{Result, RpcError};
use rackrpc_common::transport::{BoxedStream, TcpTransport, TlsContext};
use rackrpc_common::{CommandTable, Request, RpcResult, Session};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_CALL_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::discovery::EndpointAddress;

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Whether the connection has not started shutting down.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Authenticating | ConnectionState::Open
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Notification sent to the registry owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The session of an open connection ended.
    Lost { endpoint: String, id: ConnectionId },
}

/// A connection attempt that did not reach `Open`.
#[derive(Error, Debug)]
#[error("{endpoint} at {address}: {phase} failed: {error}")]
pub struct ConnectFailure {
    pub endpoint: String,
    pub address: EndpointAddress,
    /// State the attempt was in when it failed.
    pub phase: ConnectionState,
    #[source]
    pub error: RpcError,
}

impl ConnectFailure {
    /// Whether the address accepted the TCP connection before the attempt failed.
    pub fn reached_authentication(&self) -> bool {
        self.phase == ConnectionState::Authenticating
    }
}

impl From<ConnectFailure> for RpcError {
    fn from(failure: ConnectFailure) -> Self {
        failure.error
    }
}

/// Everything needed to open connections to event loops.
#[derive(Clone)]
pub struct Connector {
    transport: TcpTransport,
    tls: TlsContext,
    table: Arc<CommandTable>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    handshake_timeout: Duration,
    call_timeout: Duration,
}

impl Connector {
    /// Creates a connector with the default timeouts of [`ClientConfig`](crate::ClientConfig).
    ///
    /// # Arguments
    ///
    /// * `tls` - Local identity used for the `StartTLS` upgrade
    /// * `table` - Commands the region may call on us once a connection is open
    /// * `events` - Where loss of an open connection is reported
    pub fn new(
        tls: TlsContext,
        table: Arc<CommandTable>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            transport: TcpTransport::new(),
            tls,
            table,
            events,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, handshake: Duration, call: Duration) -> Self {
        self.transport = TcpTransport::with_connect_timeout(connect);
        self.handshake_timeout = handshake;
        self.call_timeout = call;
        self
    }

    /// Prepares an attempt without starting it, so its state can be
    /// observed from the beginning.
    pub fn attempt(&self, endpoint: &str, address: &EndpointAddress) -> ConnectionAttempt {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        ConnectionAttempt {
            id: next_connection_id(),
            endpoint: endpoint.to_string(),
            address: address.clone(),
            state,
            connector: self.clone(),
        }
    }

    /// Dials `address` and runs the handshake for `endpoint`.
    pub async fn connect(
        &self,
        endpoint: &str,
        address: &EndpointAddress,
    ) -> std::result::Result<Connection, ConnectFailure> {
        self.attempt(endpoint, address).run().await
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("tls", &self.tls)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

/// One run of the handshake against one address.
pub struct ConnectionAttempt {
    id: ConnectionId,
    endpoint: String,
    address: EndpointAddress,
    state: watch::Sender<ConnectionState>,
    connector: Connector,
}

impl ConnectionAttempt {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Runs the handshake to completion.
    ///
    /// The whole of `StartTLS`, the TLS handshake and `Identify` is bounded
    /// by the handshake timeout; the dial has its own connect timeout.
    /// Dropping the future abandons the attempt and releases the stream.
    pub async fn run(self) -> std::result::Result<Connection, ConnectFailure> {
        debug!(
            endpoint = %self.endpoint,
            addr = %self.address,
            connection_id = self.id,
            "connecting"
        );

        let outcome = match self.dial().await {
            Ok(stream) => self.authenticate(stream).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(session) => Ok(self.open(session)),
            Err(error) => {
                let phase = *self.state.borrow();
                if phase == ConnectionState::Authenticating {
                    self.transition(ConnectionState::Closing);
                }
                self.transition(ConnectionState::Closed);
                Err(ConnectFailure {
                    endpoint: self.endpoint,
                    address: self.address,
                    phase,
                    error,
                })
            }
        }
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        debug!(
            endpoint = %self.endpoint,
            addr = %self.address,
            connection_id = self.id,
            from = %previous,
            to = %next,
            "connection state changed"
        );
    }

    async fn dial(&self) -> Result<BoxedStream> {
        let stream = self
            .connector
            .transport
            .connect(&self.address.host, self.address.port)
            .await?;
        self.transition(ConnectionState::Authenticating);
        Ok(BoxedStream::new(stream))
    }

    async fn authenticate(&self, stream: BoxedStream) -> Result<Session> {
        let limit = self.connector.handshake_timeout;
        tokio::time::timeout(limit, self.handshake(stream))
            .await
            .map_err(|_| RpcError::Timeout(limit.as_millis() as u64))?
    }

    async fn handshake(&self, mut stream: BoxedStream) -> Result<Session> {
        let tls = &self.connector.tls;

        let args = serde_json::to_value(tls.start_tls_args())?;
        TcpTransport::send_request(&mut stream, &Request::new(commands::START_TLS, args))
            .await?
            .into_result()?;

        let stream = tls.connect(stream).await?;
        let session = Session::spawn(
            stream,
            self.connector.table.clone(),
            format!("{}@{}", self.endpoint, self.address),
        );

        match Self::identify(&session).await {
            Ok(ident) if ident == self.endpoint => Ok(session),
            Ok(ident) => {
                session.close();
                Err(RpcError::IdentityMismatch {
                    expected: self.endpoint.clone(),
                    actual: ident,
                })
            }
            Err(e) => {
                session.close();
                Err(e)
            }
        }
    }

    async fn identify(session: &Session) -> Result<String> {
        let result = session.call(commands::IDENTIFY, serde_json::json!({}), None).await?;
        let identity: IdentifyResult = serde_json::from_value(result)
            .map_err(|e| RpcError::InvalidResponse(format!("Identify: {}", e)))?;
        Ok(identity.ident)
    }

    fn open(self, session: Session) -> Connection {
        self.transition(ConnectionState::Open);
        info!(
            endpoint = %self.endpoint,
            addr = %self.address,
            connection_id = self.id,
            "connection open"
        );

        let connection = Connection {
            inner: Arc::new(ConnectionInner {
                id: self.id,
                endpoint: self.endpoint,
                address: self.address,
                state: self.state,
                session,
                call_timeout: self.connector.call_timeout,
            }),
        };
        connection.monitor(self.connector.events);
        connection
    }
}

struct ConnectionInner {
    id: ConnectionId,
    endpoint: String,
    address: EndpointAddress,
    state: watch::Sender<ConnectionState>,
    session: Session,
    call_timeout: Duration,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.session.close();
    }
}

/// An authenticated connection to one event loop.
///
/// Cheap to clone; all clones refer to the same connection. The session is
/// closed when the last clone is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wraps a session that has already been authenticated.
    #[cfg(test)]
    pub(crate) fn from_session(
        endpoint: &str,
        address: EndpointAddress,
        session: Session,
        call_timeout: Duration,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Open);
        let connection = Connection {
            inner: Arc::new(ConnectionInner {
                id: next_connection_id(),
                endpoint: endpoint.to_string(),
                address,
                state,
                session,
                call_timeout,
            }),
        };
        connection.monitor(events);
        connection
    }

    /// Watches the session and reports its end.
    ///
    /// The task holds only a weak reference, so it does not keep the
    /// connection alive.
    fn monitor(&self, events: mpsc::UnboundedSender<ConnectionEvent>) {
        let session = self.inner.session.clone();
        let weak = Arc::downgrade(&self.inner);
        let endpoint = self.inner.endpoint.clone();
        let address = self.inner.address.clone();
        let id = self.inner.id;

        tokio::spawn(async move {
            session.closed().await;
            if let Some(inner) = weak.upgrade() {
                inner.state.send_if_modified(|current| {
                    let changed = *current == ConnectionState::Open;
                    if changed {
                        *current = ConnectionState::Closing;
                    }
                    changed
                });
                inner.state.send_replace(ConnectionState::Closed);
            }

            info!(endpoint = %endpoint, addr = %address, connection_id = id, "connection closed");
            if events.send(ConnectionEvent::Lost { endpoint, id }).is_err() {
                debug!(connection_id = id, "no one listening for connection events");
            }
        });
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.inner.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open && !self.inner.session.is_closed()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Invokes `command` on the event loop, bounded by the call timeout.
    pub async fn call(&self, command: &str, args: serde_json::Value) -> Result<RpcResult> {
        if !self.is_open() {
            return Err(RpcError::ConnectionClosed);
        }
        self.inner
            .session
            .call(command, args, Some(self.inner.call_timeout))
            .await
    }

    /// Starts closing the connection. Teardown finishes in the background;
    /// outstanding calls fail with [`RpcError::ConnectionClosed`].
    pub fn close(&self) {
        let started = self.inner.state.send_if_modified(|current| {
            let changed = *current == ConnectionState::Open;
            if changed {
                *current = ConnectionState::Closing;
            }
            changed
        });
        if started {
            debug!(
                endpoint = %self.inner.endpoint,
                addr = %self.inner.address,
                connection_id = self.inner.id,
                "closing connection"
            );
        }
        self.inner.session.close();
    }

    /// Resolves once the connection has reached `Closed`.
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        if state.wait_for(|s| *s == ConnectionState::Closed).await.is_err() {
            warn!(connection_id = self.inner.id, "connection state dropped before close");
        }
    }

    /// Whether `self` and `other` are the same connection.
    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("address", &self.inner.address)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    /// An open connection over an in-memory stream. The peer end is returned
    /// so the caller controls when the connection is lost.
    pub(crate) fn open_connection(
        endpoint: &str,
        host: &str,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> (Connection, DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let session = Session::spawn(BoxedStream::new(local), Arc::new(CommandTable::new()), endpoint);
        let connection = Connection::from_session(
            endpoint,
            EndpointAddress::new(host, 5250),
            session,
            Duration::from_secs(5),
            events,
        );
        (connection, remote)
    }

    #[test]
    fn test_state_liveness() {
        assert!(ConnectionState::Connecting.is_live());
        assert!(ConnectionState::Authenticating.is_live());
        assert!(ConnectionState::Open.is_live());
        assert!(!ConnectionState::Closing.is_live());
        assert!(!ConnectionState::Closed.is_live());
    }

    #[test]
    fn test_connection_ids_unique() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_close_reaches_closed_and_reports_loss() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (connection, _remote) = open_connection("region1", "10.0.0.1", tx);
        assert!(connection.is_open());

        connection.close();
        assert!(!connection.is_open());

        tokio::time::timeout(Duration::from_secs(5), connection.closed())
            .await
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            ConnectionEvent::Lost {
                endpoint: "region1".to_string(),
                id: connection.id()
            }
        );
    }

    #[tokio::test]
    async fn test_peer_eof_reports_loss() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (connection, remote) = open_connection("region1", "10.0.0.1", tx);

        drop(remote);

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, ConnectionEvent::Lost { id, .. } if id == connection.id()));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_call_on_closed_connection_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (connection, _remote) = open_connection("region1", "10.0.0.1", tx);
        connection.close();

        let result = connection.call(commands::LIST_BOOT_IMAGES, serde_json::json!({})).await;
        assert!(matches!(result, Err(RpcError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_dropping_last_handle_closes_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (connection, _remote) = open_connection("region1", "10.0.0.1", tx);
        let id = connection.id();

        drop(connection);

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            ConnectionEvent::Lost {
                endpoint: "region1".to_string(),
                id
            }
        );
    }

    fn tls_context() -> TlsContext {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["maas-region".to_string()]).unwrap();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();
        let identity = rackrpc_common::TlsIdentity::from_pem(&cert.pem(), &key.serialize_pem(), &cert.pem())
            .unwrap();
        TlsContext::new(identity, "maas-region").unwrap()
    }

    #[test]
    fn test_connector_defaults_match_client_config() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let connector = Connector::new(tls_context(), Arc::new(CommandTable::new()), tx);
        let config = crate::ClientConfig::default();

        assert_eq!(connector.transport.connect_timeout(), config.connect_timeout);
        assert_eq!(connector.handshake_timeout, config.handshake_timeout);
        assert_eq!(connector.call_timeout, config.call_timeout);
    }

    #[test]
    fn test_connect_failure_phase() {
        let failure = ConnectFailure {
            endpoint: "region1".to_string(),
            address: EndpointAddress::new("10.0.0.1", 5250),
            phase: ConnectionState::Authenticating,
            error: RpcError::ConnectionClosed,
        };
        assert!(failure.reached_authentication());
        assert_eq!(
            failure.to_string(),
            "region1 at 10.0.0.1:5250: authenticating failed: Connection closed"
        );
    }
}
