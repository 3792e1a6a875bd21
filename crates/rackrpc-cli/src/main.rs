//! # rackrpc CLI Entry Point
//!
//! Main binary for the cluster side of the region RPC link.
//!
//! ## Usage
//!
//! ```bash
//! # Keep the cluster connected to its region until Ctrl-C
//! rackrpc run --region-url http://region:5240/MAAS --name cluster1
//!
//! # Same, configured from the environment
//! RACKRPC_REGION_URL=http://region:5240/MAAS RACKRPC_CLUSTER_NAME=cluster1 rackrpc run
//!
//! # Print the event loops the region advertises (raw JSON)
//! rackrpc endpoints --region-url http://region:5240/MAAS | jq .
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;
use rackrpc_cli::RunOptions;
use rackrpc_client::{ConnectionManager, Discovery, HttpDiscovery};
use rackrpc_common::{CommandTable, TlsContext, TlsIdentity};
use rackrpc_server::ClusterService;

#[derive(FromArgs)]
/// rackrpc - cluster connection manager for the region RPC link
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Run(RunArgs),
    Endpoints(EndpointsArgs),
}

/// Arguments for running the cluster daemon.
///
/// Starts the listener for region peers and the connection manager, and
/// runs until interrupted.
#[derive(FromArgs)]
#[argh(subcommand, name = "run")]
/// connect to every event loop of the region
struct RunArgs {
    /// base URL of the region API (falls back to RACKRPC_REGION_URL)
    #[argh(option, long = "region-url")]
    region_url: Option<String>,

    /// name this cluster answers to Identify with (falls back to RACKRPC_CLUSTER_NAME)
    #[argh(option, short = 'n')]
    name: Option<String>,

    /// address for the listener accepting region peers
    #[argh(option, short = 'b')]
    bind: Option<String>,

    /// PEM file with the cluster certificate
    #[argh(option, long = "cert")]
    cert: Option<PathBuf>,

    /// PEM file with the cluster private key
    #[argh(option, long = "key")]
    key: Option<PathBuf>,

    /// PEM file with the trusted authorities
    #[argh(option, long = "ca")]
    ca: Option<PathBuf>,

    /// DNS name the region certificate must be valid for
    #[argh(option, long = "server-name")]
    server_name: Option<String>,

    /// timeout for outbound calls in seconds
    #[argh(option, long = "call-timeout")]
    call_timeout_secs: Option<u64>,
}

/// Arguments for printing the discovered topology.
///
/// Outputs raw JSON (no pretty-printing) to stdout so it can be piped
/// into other tools.
#[derive(FromArgs)]
#[argh(subcommand, name = "endpoints")]
/// print the event loops advertised by the region
struct EndpointsArgs {
    /// base URL of the region API (falls back to RACKRPC_REGION_URL)
    #[argh(option, long = "region-url")]
    region_url: Option<String>,

    /// request timeout in milliseconds
    #[argh(option, long = "timeout", default = "10000")]
    timeout_ms: u64,
}

impl From<RunArgs> for RunOptions {
    fn from(args: RunArgs) -> Self {
        RunOptions {
            region_url: args.region_url,
            name: args.name,
            bind: args.bind,
            certificate: args.cert,
            key: args.key,
            authorities: args.ca,
            server_name: args.server_name,
            call_timeout_secs: args.call_timeout_secs,
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // endpoints: keep stdout clean for piping
    if !matches!(cli.command, Commands::Endpoints(_)) {
        // Set default log level to INFO, but allow RUST_LOG env var to override
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Endpoints(args) => endpoints(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let (client_config, server_config) = RunOptions::from(args).resolve(env_var)?;
    tracing::info!("Starting cluster {}", server_config.local_name);
    tracing::info!("Region: {}", client_config.region_url);

    let identity = TlsIdentity::from_pem_files(
        &client_config.tls.certificate,
        &client_config.tls.key,
        &client_config.tls.authorities,
    )?;
    tracing::info!("Loaded TLS identity trusting {} authorities", identity.authority_count());
    let tls = TlsContext::new(identity, &client_config.server_name)?;
    let table = CommandTable::with_identity(server_config.local_name.clone());
    let unhandled = table.unhandled_cluster_commands();
    if !unhandled.is_empty() {
        tracing::warn!("No handler registered for: {}", unhandled.join(", "));
    }
    let table = Arc::new(table);

    let service = ClusterService::bind(server_config.bind_addr, tls.clone(), table.clone())
        .await?
        .with_handshake_timeout(server_config.handshake_timeout);
    let peers = service.peers();
    let listener = service.spawn();

    let discovery = HttpDiscovery::new(&client_config.region_url, client_config.discovery_timeout)?;
    tracing::info!("Discovering event loops at {}", discovery.url());
    let (manager, _selector) = ConnectionManager::new(&client_config, discovery, tls, table);

    manager
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down");
        })
        .await;

    listener.abort();
    peers.close_all();
    Ok(())
}

async fn endpoints(args: EndpointsArgs) -> Result<()> {
    let url = rackrpc_cli::region_url(args.region_url, env_var)?;
    let discovery = HttpDiscovery::new(&url, Duration::from_millis(args.timeout_ms))?;
    let topology = discovery.fetch().await?;

    // Output raw JSON to stdout
    println!("{}", serde_json::to_string(&topology)?);
    Ok(())
}
