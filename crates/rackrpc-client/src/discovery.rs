//! Event loop discovery
//!
//! The region publishes the event loops it runs as JSON under
//! `<region base URL>/rpc/`:
//!
//! ```text
//! {"eventloops": {"region1:pid=1234": [["10.0.0.1", 5250], ["fd00::1", 5250]]}}
//! ```
//!
//! A missing, null or empty `eventloops` map means the region has not
//! finished starting and yields an empty topology rather than an error.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use rackrpc_common::RpcError;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Ways a discovery fetch can fail.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Invalid region URL: {0}")]
    InvalidUrl(String),

    #[error("Discovery request failed: {0}")]
    Network(String),

    #[error("Discovery returned HTTP {0}")]
    Status(u16),

    #[error("Malformed discovery response: {0}")]
    Malformed(String),
}

impl From<DiscoveryError> for RpcError {
    fn from(err: DiscoveryError) -> Self {
        RpcError::Discovery(err.to_string())
    }
}

/// One candidate address of an event loop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointAddress {
    pub host: String,
    pub port: u16,
}

impl EndpointAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A named event loop and the addresses it can be reached on, in the
/// order they should be tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub addresses: Vec<EndpointAddress>,
}

/// Event loops the region wants us connected to, keyed by name.
///
/// Rebuilt from scratch by every successful fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DesiredTopology {
    endpoints: BTreeMap<String, Vec<EndpointAddress>>,
}

impl DesiredTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, addresses: Vec<EndpointAddress>) {
        self.endpoints.insert(name.into(), addresses);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, addresses: Vec<EndpointAddress>) -> Self {
        self.insert(name, addresses);
        self
    }

    pub fn get(&self, name: &str) -> Option<&[EndpointAddress]> {
        self.endpoints.get(name).map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.endpoints.contains_key(name)
    }

    /// Whether `address` is currently a valid address for `name`.
    pub fn allows(&self, name: &str, address: &EndpointAddress) -> bool {
        self.get(name).is_some_and(|addrs| addrs.contains(address))
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = Endpoint> + '_ {
        self.endpoints.iter().map(|(name, addresses)| Endpoint {
            name: name.clone(),
            addresses: addresses.clone(),
        })
    }
}

impl FromIterator<Endpoint> for DesiredTopology {
    fn from_iter<I: IntoIterator<Item = Endpoint>>(iter: I) -> Self {
        Self {
            endpoints: iter
                .into_iter()
                .map(|endpoint| (endpoint.name, endpoint.addresses))
                .collect(),
        }
    }
}

/// Source of the desired topology.
pub trait Discovery: Send + Sync {
    fn fetch(&self) -> impl Future<Output = Result<DesiredTopology, DiscoveryError>> + Send;
}

/// Discovery over the region's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpDiscovery {
    client: reqwest::Client,
    url: Url,
}

impl HttpDiscovery {
    /// Creates a discovery client for the region at `region_url`.
    ///
    /// # Arguments
    ///
    /// * `region_url` - Base URL of the region API, e.g. `http://region:5240/MAAS`
    /// * `timeout` - Limit for the whole request, including reading the body
    pub fn new(region_url: &str, timeout: Duration) -> Result<Self, DiscoveryError> {
        let url = rpc_info_url(region_url)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DiscoveryError::Network(e.to_string()))?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Discovery for HttpDiscovery {
    async fn fetch(&self) -> Result<DesiredTopology, DiscoveryError> {
        debug!(url = %self.url, "fetching event loops");
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| DiscoveryError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::Status(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| DiscoveryError::Network(e.to_string()))?;
        parse_eventloops(&body)
    }
}

/// Derives the discovery URL from the region base URL: any trailing `/` is
/// stripped from the path and `/rpc/` appended.
pub fn rpc_info_url(region_url: &str) -> Result<Url, DiscoveryError> {
    let mut url = Url::parse(region_url).map_err(|e| DiscoveryError::InvalidUrl(e.to_string()))?;
    let path = format!("{}/rpc/", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

#[derive(Deserialize)]
struct RpcInfo {
    #[serde(default)]
    eventloops: Option<BTreeMap<String, Vec<(String, u16)>>>,
}

/// Parses a discovery response body.
pub fn parse_eventloops(body: &[u8]) -> Result<DesiredTopology, DiscoveryError> {
    let info: RpcInfo =
        serde_json::from_slice(body).map_err(|e| DiscoveryError::Malformed(e.to_string()))?;

    Ok(info
        .eventloops
        .unwrap_or_default()
        .into_iter()
        .map(|(name, addresses)| Endpoint {
            name,
            addresses: addresses
                .into_iter()
                .map(|(host, port)| EndpointAddress { host, port })
                .collect(),
        })
        .collect())
}
