//! Cluster-side listener for region peers
//!
//! # Architecture
//!
//! The service:
//! - Listens on a TCP socket and spawns a task per accepted peer
//! - Answers only `StartTLS` until the stream is upgraded; anything else gets `TlsRequired`
//! - Upgrades the stream in place as TLS server, requiring a client certificate
//! - Hands the secured stream to a [`Session`] backed by the shared [`CommandTable`]
//!
//! Accept failures are logged and the listener keeps going.
//!
//! # Example
//!
//! ```no_run
//! use rackrpc_common::{CommandTable, TlsContext, TlsIdentity};
//! use rackrpc_server::ClusterService;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let identity = TlsIdentity::from_pem_files("cluster.crt", "cluster.key", "ca.crt").unwrap();
//!     let tls = TlsContext::new(identity, "maas-region").unwrap();
//!     let table = Arc::new(CommandTable::with_identity("cluster1"));
//!     let service = ClusterService::bind("0.0.0.0:5251".parse().unwrap(), tls, table)
//!         .await
//!         .unwrap();
//!     service.run().await;
//! }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rackrpc_common::commands::{self, StartTlsArgs};
use rackrpc_common::protocol::error::{Result, RpcError};
use rackrpc_common::transport::{BoxedStream, TcpTransport, TlsContext};
use rackrpc_common::{CommandTable, Frame, RemoteError, Response, Session};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Sessions of the peers currently connected to the service.
#[derive(Clone, Default)]
pub struct PeerSet {
    inner: Arc<Mutex<HashMap<SocketAddr, Session>>>,
}

impl PeerSet {
    fn with_peers<T>(&self, f: impl FnOnce(&mut HashMap<SocketAddr, Session>) -> T) -> T {
        let mut peers = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut peers)
    }

    fn insert(&self, addr: SocketAddr, session: Session) {
        self.with_peers(|peers| peers.insert(addr, session));
    }

    fn remove(&self, addr: &SocketAddr) {
        self.with_peers(|peers| peers.remove(addr));
    }

    /// Point-in-time copy of the authenticated peers.
    pub fn sessions(&self) -> Vec<(SocketAddr, Session)> {
        self.with_peers(|peers| {
            peers
                .iter()
                .map(|(addr, session)| (*addr, session.clone()))
                .collect()
        })
    }

    pub fn len(&self) -> usize {
        self.with_peers(|peers| peers.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every peer session.
    pub fn close_all(&self) {
        for (_, session) in self.sessions() {
            session.close();
        }
    }
}

/// Listener that serves the local command table to region peers.
pub struct ClusterService {
    listener: TcpListener,
    tls: TlsContext,
    table: Arc<CommandTable>,
    peers: PeerSet,
    handshake_timeout: Duration,
}

impl ClusterService {
    /// Binds the listener.
    ///
    /// Use port 0 to let the OS pick one; [`local_addr`](Self::local_addr)
    /// reports the result.
    pub async fn bind(addr: SocketAddr, tls: TlsContext, table: Arc<CommandTable>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RpcError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;

        Ok(Self {
            listener,
            tls,
            table,
            peers: PeerSet::default(),
            handshake_timeout: Duration::from_secs(10),
        })
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| RpcError::Transport(format!("Failed to get local address: {}", e)))
    }

    /// Handle to the sessions of connected peers.
    pub fn peers(&self) -> PeerSet {
        self.peers.clone()
    }

    /// Starts the accept loop on its own task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Accept loop. Runs until the task is dropped or aborted.
    pub async fn run(self) {
        if let Ok(addr) = self.local_addr() {
            info!("Cluster service listening on {}", addr);
        }

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);

            let tls = self.tls.clone();
            let table = self.table.clone();
            let peers = self.peers.clone();
            let limit = self.handshake_timeout;
            tokio::spawn(async move {
                let upgraded = tokio::time::timeout(limit, Self::upgrade(stream, addr, &tls))
                    .await
                    .unwrap_or(Err(RpcError::Timeout(limit.as_millis() as u64)));

                let stream = match upgraded {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!(addr = %addr, error = %e, "peer failed to upgrade");
                        return;
                    }
                };

                let session = Session::spawn(stream, table, addr.to_string());
                peers.insert(addr, session.clone());
                info!(addr = %addr, "peer authenticated");

                session.closed().await;
                peers.remove(&addr);
                info!(addr = %addr, "peer disconnected");
            });
        }
    }

    /// Serves the plaintext phase of one peer until it asks for `StartTLS`,
    /// then completes the handshake as TLS server.
    async fn upgrade(mut stream: TcpStream, addr: SocketAddr, tls: &TlsContext) -> Result<BoxedStream> {
        loop {
            let request = match TcpTransport::receive_frame(&mut stream).await? {
                Frame::Request(request) => request,
                Frame::Response(_) => {
                    return Err(RpcError::ProtocolViolation(
                        "response received before TLS".to_string(),
                    ))
                }
            };

            if request.command != commands::START_TLS {
                debug!(addr = %addr, command = %request.command, "refusing command before TLS");
                let refusal = Response::error(request.id, RemoteError::tls_required(&request.command));
                TcpTransport::send_frame(&mut stream, &refusal.into()).await?;
                continue;
            }

            let args = serde_json::Value::Object(request.args);
            match serde_json::from_value::<StartTlsArgs>(args) {
                Ok(args) => {
                    debug!(
                        addr = %addr,
                        authorities = args.authorities.len(),
                        "peer requested TLS"
                    );
                    let ack = Response::success(request.id, serde_json::json!({}));
                    TcpTransport::send_frame(&mut stream, &ack.into()).await?;
                    return tls.accept(BoxedStream::new(stream)).await;
                }
                Err(e) => {
                    let refusal = Response::error(
                        request.id,
                        RemoteError::invalid_arguments(format!("StartTLS: {}", e)),
                    );
                    TcpTransport::send_frame(&mut stream, &refusal.into()).await?;
                }
            }
        }
    }
}

impl std::fmt::Debug for ClusterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterService")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("table", &self.table)
            .field("peers", &self.peers.len())
            .finish()
    }
}
