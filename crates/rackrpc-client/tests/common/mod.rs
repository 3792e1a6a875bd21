//! Shared fixtures for the client integration tests
//!
//! - TLS material from rcgen (one authority, one leaf valid for `maas-region`)
//! - Stand-in region event loops: `rackrpc-server` services on 127.0.0.1:0
//! - Listeners that accept TCP and never answer
//! - A discovery source whose answer the test controls

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rackrpc_client::{DesiredTopology, Discovery, DiscoveryError, EndpointAddress};
use rackrpc_common::transport::{TlsContext, TlsIdentity};
use rackrpc_common::CommandTable;
use rackrpc_server::{ClusterService, PeerSet};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

pub fn tls_context() -> TlsContext {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.distinguished_name.push(DnType::CommonName, "rackrpc test CA");
    let ca = ca_params.self_signed(&ca_key).unwrap();

    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec!["maas-region".to_string()]).unwrap();
    params.distinguished_name.push(DnType::CommonName, "maas-region");
    let cert = params.signed_by(&key, &ca, &ca_key).unwrap();

    let identity = TlsIdentity::from_pem(&cert.pem(), &key.serialize_pem(), &ca.pem()).unwrap();
    TlsContext::new(identity, "maas-region").unwrap()
}

/// A stand-in region event loop answering `Identify` with `ident`.
pub struct EventLoop {
    pub addr: SocketAddr,
    pub peers: PeerSet,
    task: tokio::task::JoinHandle<()>,
}

impl EventLoop {
    pub async fn start(tls: &TlsContext, ident: &str) -> Self {
        let table = Arc::new(CommandTable::with_identity(ident));
        let service = ClusterService::bind("127.0.0.1:0".parse().unwrap(), tls.clone(), table)
            .await
            .unwrap();
        let addr = service.local_addr().unwrap();
        let peers = service.peers();
        let task = service.spawn();
        Self { addr, peers, task }
    }

    pub fn address(&self) -> EndpointAddress {
        EndpointAddress::new(self.addr.ip().to_string(), self.addr.port())
    }

    /// Stops accepting and disconnects every peer.
    pub fn stop(&self) {
        self.task.abort();
        self.peers.close_all();
    }

    pub async fn wait_for_peers(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.peers.len() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accepts TCP connections and never writes to them, so a handshake against
/// it only ends by timing out.
pub struct SilentListener {
    pub addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

impl SilentListener {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        Self { addr, task }
    }

    pub fn address(&self) -> EndpointAddress {
        EndpointAddress::new(self.addr.ip().to_string(), self.addr.port())
    }
}

impl Drop for SilentListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// An address nothing is listening on.
pub async fn unreachable_address() -> EndpointAddress {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    EndpointAddress::new("127.0.0.1", port)
}

/// Discovery returning whatever the test last set; `None` fails the fetch.
#[derive(Clone, Default)]
pub struct ScriptedDiscovery {
    answer: Arc<Mutex<Option<DesiredTopology>>>,
}

impl ScriptedDiscovery {
    pub fn new(topology: DesiredTopology) -> Self {
        let discovery = Self::default();
        discovery.set(Some(topology));
        discovery
    }

    pub fn set(&self, topology: Option<DesiredTopology>) {
        *self.answer.lock().unwrap() = topology;
    }
}

impl Discovery for ScriptedDiscovery {
    async fn fetch(&self) -> Result<DesiredTopology, DiscoveryError> {
        let answer = self.answer.lock().unwrap().clone();
        answer.ok_or_else(|| DiscoveryError::Network("connection refused".to_string()))
    }
}
