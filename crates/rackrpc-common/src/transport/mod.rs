//! rackrpc Transport Layer
//!
//! This module provides the framed transport, TCP dialing and TLS upgrade
//! for sending/receiving RPC frames.
//!
//! # Architecture
//!
//! - **Transport**: TCP, upgraded in place to mutual TLS after `StartTLS`
//! - **Codec**: JSON serialization for protocol frames
//! - **Wire Format**: `[4-byte length prefix as u32 big-endian] + [JSON data]`
//!
//! # Components
//!
//! - **[`JsonCodec`]**: Encode/decode frames to JSON
//! - **[`TcpTransport`]**: dial with timeout, read/write frames on any async stream
//! - **[`TlsContext`]**: the local TLS identity and both halves of the upgrade
//! - **[`BoxedStream`]**: a plain or upgraded stream behind one type
//!
//! # Message Size Limits
//!
//! Frames larger than 100 MB are rejected to prevent memory exhaustion.

pub mod codec;
pub mod stream;
pub mod tcp;
pub mod tls;

pub use codec::JsonCodec;
pub use stream::{AsyncStream, BoxedStream};
pub use tcp::{TcpTransport, MAX_MESSAGE_SIZE};
pub use tls::{TlsContext, TlsIdentity};
