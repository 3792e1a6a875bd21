use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured error carried in a response frame.
///
/// `code` is a stable machine-readable identifier (e.g. `UnhandledCommand`),
/// `description` is free text for logs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{code}: {description}")]
pub struct RemoteError {
    pub code: String,
    pub description: String,
}

impl RemoteError {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
        }
    }

    pub fn unhandled_command(command: &str) -> Self {
        Self::new("UnhandledCommand", format!("no responder for {}", command))
    }

    pub fn tls_required(command: &str) -> Self {
        Self::new("TlsRequired", format!("{} requires an upgraded channel", command))
    }

    pub fn invalid_arguments(description: impl Into<String>) -> Self {
        Self::new("InvalidArguments", description)
    }
}

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Identity mismatch: expected {expected}, remote reported {actual}")]
    IdentityMismatch { expected: String, actual: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("No connections available")]
    NoConnectionsAvailable,

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),
}

impl From<rustls::Error> for RpcError {
    fn from(err: rustls::Error) -> Self {
        RpcError::Tls(err.to_string())
    }
}

impl From<rustls::pki_types::InvalidDnsNameError> for RpcError {
    fn from(err: rustls::pki_types::InvalidDnsNameError) -> Self {
        RpcError::Tls(err.to_string())
    }
}

impl From<rustls::pki_types::pem::Error> for RpcError {
    fn from(err: rustls::pki_types::pem::Error) -> Self {
        RpcError::Tls(format!("PEM: {}", err))
    }
}

impl From<rustls::server::VerifierBuilderError> for RpcError {
    fn from(err: rustls::server::VerifierBuilderError) -> Self {
        RpcError::Tls(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
