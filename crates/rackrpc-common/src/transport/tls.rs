//! Mutual TLS for the in-place `StartTLS` upgrade.
//!
//! Both ends of the link present a certificate and verify the peer's against
//! a shared set of trusted authorities. The side that dialed the connection
//! acts as TLS client, the side that accepted it as TLS server.
//!
//! A completed client-side handshake does not mean the server accepted our
//! certificate: under TLS 1.3 the server's verdict only arrives with the next
//! record it sends. Callers must finish one more round-trip over the upgraded
//! stream before trusting it.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::protocol::commands::StartTlsArgs;
use crate::protocol::error::{Result, RpcError};
use crate::transport::stream::BoxedStream;

/// Default name the region's certificate is expected to carry.
pub const DEFAULT_SERVER_NAME: &str = "maas-region";

/// Local certificate, its private key and the authorities we trust.
pub struct TlsIdentity {
    certificates: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    authorities: Vec<CertificateDer<'static>>,
    certificate_pem: String,
    authorities_pem: Vec<String>,
}

impl TlsIdentity {
    /// Parses an identity from PEM text.
    ///
    /// `certificate_pem` may hold a chain; `authorities_pem` may hold several
    /// certificates.
    pub fn from_pem(certificate_pem: &str, key_pem: &str, authorities_pem: &str) -> Result<Self> {
        let certificates = CertificateDer::pem_slice_iter(certificate_pem.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if certificates.is_empty() {
            return Err(RpcError::Tls("no certificate found in PEM".to_string()));
        }

        let key = PrivateKeyDer::from_pem_slice(key_pem.as_bytes())?;

        let authorities = CertificateDer::pem_slice_iter(authorities_pem.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if authorities.is_empty() {
            return Err(RpcError::Tls("no trusted authority found in PEM".to_string()));
        }

        let authorities_pem = authorities.iter().map(encode_certificate).collect();

        Ok(Self {
            certificates,
            key,
            authorities,
            certificate_pem: certificate_pem.to_string(),
            authorities_pem,
        })
    }

    pub fn from_pem_files(
        certificate: impl AsRef<Path>,
        key: impl AsRef<Path>,
        authorities: impl AsRef<Path>,
    ) -> Result<Self> {
        let read = |path: &Path| {
            std::fs::read_to_string(path).map_err(|e| {
                RpcError::Tls(format!("Failed to read {}: {}", path.display(), e))
            })
        };
        Self::from_pem(
            &read(certificate.as_ref())?,
            &read(key.as_ref())?,
            &read(authorities.as_ref())?,
        )
    }

    pub fn authority_count(&self) -> usize {
        self.authorities.len()
    }
}

fn encode_certificate(certificate: &CertificateDer<'_>) -> String {
    let block = pem::Pem::new("CERTIFICATE", certificate.as_ref().to_vec());
    pem::encode_config(&block, pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF))
}

/// Both halves of the TLS upgrade for one local identity.
#[derive(Clone)]
pub struct TlsContext {
    connector: TlsConnector,
    acceptor: TlsAcceptor,
    server_name: ServerName<'static>,
    start_tls_args: StartTlsArgs,
}

impl TlsContext {
    /// Builds client and server configurations from `identity`.
    ///
    /// `server_name` is the DNS name the remote certificate must be valid
    /// for when we are the dialing side.
    pub fn new(identity: TlsIdentity, server_name: &str) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        for authority in &identity.authorities {
            roots.add(authority.clone())?;
        }
        let roots = Arc::new(roots);

        let client = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots.clone())
            .with_client_auth_cert(identity.certificates.clone(), identity.key.clone_key())?;

        let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider.clone()).build()?;
        let server = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(identity.certificates.clone(), identity.key.clone_key())?;

        let server_name = ServerName::try_from(server_name.to_string())?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client)),
            acceptor: TlsAcceptor::from(Arc::new(server)),
            server_name,
            start_tls_args: StartTlsArgs {
                certificate: identity.certificate_pem.clone(),
                authorities: identity.authorities_pem.clone(),
            },
        })
    }

    /// Arguments to send with our `StartTLS` command.
    pub fn start_tls_args(&self) -> &StartTlsArgs {
        &self.start_tls_args
    }

    /// Upgrades a stream we dialed.
    pub async fn connect(&self, stream: BoxedStream) -> Result<BoxedStream> {
        let tls = self
            .connector
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(|e| RpcError::Tls(format!("client handshake failed: {}", e)))?;
        Ok(BoxedStream::new(tls))
    }

    /// Upgrades a stream we accepted.
    pub async fn accept(&self, stream: BoxedStream) -> Result<BoxedStream> {
        let tls = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| RpcError::Tls(format!("server handshake failed: {}", e)))?;
        Ok(BoxedStream::new(tls))
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}
