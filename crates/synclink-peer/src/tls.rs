//! Optional TLS for the control link.
//!
//! Only TLS 1.3 and 1.2 are offered, with AEAD cipher suites and forward
//! secret key exchange. The framed protocol, including `authenticate`, runs
//! inside the encrypted stream once the TLS handshake completes.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::crypto::ring::{self, cipher_suite};
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::version::{TLS12, TLS13};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, SupportedCipherSuite, SupportedProtocolVersion};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{PeerError, Result};

/// Protocol versions offered, newest first.
pub static PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] = &[&TLS13, &TLS12];

/// Cipher suites offered, in preference order.
pub static CIPHER_SUITES: &[SupportedCipherSuite] = &[
    cipher_suite::TLS13_AES_256_GCM_SHA384,
    cipher_suite::TLS13_AES_128_GCM_SHA256,
    cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
    cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
];

/// Client side TLS for dialing the controller.
#[derive(Clone)]
pub struct LinkTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl LinkTls {
    /// Trust the certificates in `ca_file` (PEM), or the public web roots
    /// when no file is given. `server_name` is checked against the
    /// controller's certificate.
    pub fn new(server_name: &str, ca_file: Option<&Path>) -> Result<Self> {
        let roots = match ca_file {
            Some(path) => load_roots(path)?,
            None => RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            },
        };
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|err| PeerError::Tls(format!("invalid server name {server_name:?}: {err}")))?;
        let config = ClientConfig::builder_with_provider(Arc::new(provider()))
            .with_protocol_versions(PROTOCOL_VERSIONS)
            .map_err(|err| PeerError::Tls(err.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }

    /// Run the TLS handshake over an open TCP stream.
    pub async fn connect(&self, stream: TcpStream, timeout: Duration) -> Result<TlsStream<TcpStream>> {
        let handshake = self.connector.connect(self.server_name.clone(), stream);
        let stream = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| PeerError::Timeout(timeout))?
            .map_err(|err| PeerError::Tls(err.to_string()))?;
        debug!(
            server_name = ?self.server_name,
            version = ?stream.get_ref().1.protocol_version(),
            suite = ?stream.get_ref().1.negotiated_cipher_suite().map(|s| s.suite()),
            "tls established"
        );
        Ok(stream)
    }
}

impl fmt::Debug for LinkTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkTls")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

fn provider() -> CryptoProvider {
    CryptoProvider {
        cipher_suites: CIPHER_SUITES.to_vec(),
        ..ring::default_provider()
    }
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let display = path.display().to_string();
    let file = File::open(path).map_err(|err| PeerError::Tls(format!("{display}: {err}")))?;
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
        let cert = cert.map_err(|err| PeerError::Tls(format!("{display}: {err}")))?;
        roots
            .add(cert)
            .map_err(|err| PeerError::Tls(format!("{display}: {err}")))?;
    }
    if roots.is_empty() {
        return Err(PeerError::Tls(format!("{display}: no certificates found")));
    }
    Ok(roots)
}
