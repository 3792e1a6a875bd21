//! # rackrpc CLI
//!
//! Settings resolution for the `rackrpc` binary.
//!
//! Every setting comes from a command-line flag first, then from an
//! environment variable where one is defined, then from the defaults in
//! [`ClientConfig`] and [`ServerConfig`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rackrpc_client::{ClientConfig, TlsPaths};
use rackrpc_server::ServerConfig;

/// Environment fallback for the region base URL.
pub const REGION_URL_ENV: &str = "RACKRPC_REGION_URL";
/// Environment fallback for the cluster's name.
pub const CLUSTER_NAME_ENV: &str = "RACKRPC_CLUSTER_NAME";

/// Validates that a URL string starts with http:// or https://
pub fn validate_http_url(url: &str, description: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(anyhow!(
            "Invalid {}: '{}' must start with http:// or https://",
            description,
            url
        ))
    }
}

/// Resolves the region URL from the flag or `RACKRPC_REGION_URL`.
pub fn region_url(flag: Option<String>, env: impl Fn(&str) -> Option<String>) -> Result<String> {
    let url = flag
        .or_else(|| env(REGION_URL_ENV))
        .ok_or_else(|| anyhow!("No region URL given; use --region-url or set {}", REGION_URL_ENV))?;
    validate_http_url(&url, "region URL")?;
    Ok(url)
}

/// Flags of `rackrpc run`, before environment fallbacks are applied.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub region_url: Option<String>,
    pub name: Option<String>,
    pub bind: Option<String>,
    pub certificate: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub authorities: Option<PathBuf>,
    pub server_name: Option<String>,
    pub call_timeout_secs: Option<u64>,
}

impl RunOptions {
    /// Builds the client and listener configuration.
    ///
    /// `env` looks up environment variables; pass `|k| std::env::var(k).ok()`
    /// outside tests.
    pub fn resolve(self, env: impl Fn(&str) -> Option<String>) -> Result<(ClientConfig, ServerConfig)> {
        let region_url = region_url(self.region_url, &env)?;
        let name = self
            .name
            .or_else(|| env(CLUSTER_NAME_ENV))
            .ok_or_else(|| anyhow!("No cluster name given; use --name or set {}", CLUSTER_NAME_ENV))?;

        let defaults = TlsPaths::default();
        let tls = TlsPaths {
            certificate: self.certificate.unwrap_or(defaults.certificate),
            key: self.key.unwrap_or(defaults.key),
            authorities: self.authorities.unwrap_or(defaults.authorities),
        };

        let mut client = ClientConfig {
            region_url,
            tls,
            ..Default::default()
        };
        if let Some(server_name) = self.server_name {
            client.server_name = server_name;
        }
        if let Some(secs) = self.call_timeout_secs {
            client.call_timeout = Duration::from_secs(secs);
        }

        let mut server = ServerConfig {
            local_name: name,
            handshake_timeout: client.handshake_timeout,
            ..Default::default()
        };
        if let Some(bind) = self.bind {
            server.bind_addr = bind
                .parse::<SocketAddr>()
                .map_err(|e| anyhow!("Invalid bind address {}: {}", bind, e))?;
        }

        Ok((client, server))
    }
}
