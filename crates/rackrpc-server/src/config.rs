use std::net::SocketAddr;
use std::time::Duration;

/// Default port the cluster listens on for region peers.
pub const DEFAULT_PORT: u16 = 5251;

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Name answered to `Identify`.
    pub local_name: String,
    /// Limit for a peer to complete `StartTLS` and the TLS handshake.
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            local_name: "cluster".to_string(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}
