//! rackrpc Server
//!
//! This crate provides the [`ClusterService`], the listening half of the
//! cluster RPC link. Region peers that dial the cluster land here: each
//! accepted stream must upgrade to mutual TLS with `StartTLS` before any
//! other command is served, after which it is driven by a
//! [`Session`](rackrpc_common::Session) backed by the local command table.

pub mod config;
pub mod service;

pub use config::ServerConfig;
pub use service::{ClusterService, PeerSet};
