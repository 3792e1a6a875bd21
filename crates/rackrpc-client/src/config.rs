use std::path::PathBuf;
use std::time::Duration;

use rackrpc_common::transport::tcp::DEFAULT_CONNECT_TIMEOUT;
use rackrpc_common::transport::tls::DEFAULT_SERVER_NAME;

use crate::backoff::PollIntervals;

/// Limit for `StartTLS`, the TLS handshake and `Identify` together.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Limit for one outbound call on an open connection.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Locations of the cluster's TLS material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub certificate: PathBuf,
    pub key: PathBuf,
    pub authorities: PathBuf,
}

impl Default for TlsPaths {
    fn default() -> Self {
        Self {
            certificate: PathBuf::from("/etc/rackrpc/cluster.crt"),
            key: PathBuf::from("/etc/rackrpc/cluster.key"),
            authorities: PathBuf::from("/etc/rackrpc/ca.crt"),
        }
    }
}

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the region API; discovery is served under `<base>/rpc/`.
    pub region_url: String,
    pub tls: TlsPaths,
    /// Name the region's certificate must be valid for.
    pub server_name: String,
    pub intervals: PollIntervals,
    /// Relative spread applied to each poll delay, in `[0, 1]`.
    pub jitter: f64,
    pub discovery_timeout: Duration,
    pub connect_timeout: Duration,
    /// Limit for `StartTLS`, the TLS handshake and `Identify` together.
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            region_url: "http://localhost:5240/MAAS".to_string(),
            tls: TlsPaths::default(),
            server_name: DEFAULT_SERVER_NAME.to_string(),
            intervals: PollIntervals::default(),
            jitter: 0.1,
            discovery_timeout: Duration::from_secs(10),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}
