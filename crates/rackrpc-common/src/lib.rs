//! rackrpc Common Types and Transport
//!
//! This crate provides the protocol definitions, framed transport and TLS
//! upgrade used by both ends of the cluster/region RPC link.
//!
//! # Overview
//!
//! A cluster controller keeps one persistent connection to every event loop
//! published by its region controller. Once authenticated the link is
//! symmetric: either side may invoke commands on the other. This crate holds
//! everything both sides share:
//!
//! - **Protocol Layer**: request/response/frame types, command names and the error type
//! - **Transport Layer**: length-framed JSON codec, TCP dialing and in-place TLS upgrade
//! - **Dispatch**: the static command table that answers remote calls
//! - **Session**: the driver that multiplexes calls in both directions over one stream
//!
//! # Architecture
//!
//! The wire protocol:
//! - **Transport**: TCP, upgraded in place to mutual TLS via the `StartTLS` command
//! - **Serialization**: JSON
//! - **Message Format**: `[4-byte length prefix as u32 big-endian] + [JSON data]`
//! - **Max Message Size**: 100 MB (prevents memory exhaustion)
//!
//! # Example
//!
//! ```no_run
//! use rackrpc_common::{Request, Response, commands};
//! use serde_json::json;
//!
//! let request = Request::new(commands::IDENTIFY, json!({}));
//! let response = Response::success(request.id, json!({"ident": "region1"}));
//! ```

pub mod dispatch;
pub mod protocol;
pub mod session;
pub mod transport;

pub use dispatch::{CommandTable, HandlerFuture};
pub use protocol::*;
pub use session::Session;
pub use transport::{TlsContext, TlsIdentity};
