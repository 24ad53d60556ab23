//! TLS transport (feature `tls`)
//!
//! Client and server configurations are built on first use from the PEM
//! files named in [`TlsConfig`] and reused for every later connection.

use crate::stream::{MessageStream, StreamError, StreamResult};
use jit_core::TlsConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection, StreamOwned};
use std::fs::File;
use std::io::BufReader;
use std::net::TcpStream;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::info;

fn tls_error(error: impl std::fmt::Display) -> StreamError {
    StreamError::Tls(error.to_string())
}

fn load_certs(path: &Path) -> StreamResult<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path).map_err(tls_error)?);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(tls_error)
}

fn load_key(path: &Path) -> StreamResult<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path).map_err(tls_error)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(tls_error)?
        .ok_or_else(|| StreamError::Tls(format!("no private key in {}", path.display())))
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

#[derive(Debug)]
pub struct TlsContext {
    config: TlsConfig,
    client: OnceLock<Arc<ClientConfig>>,
    server: OnceLock<Arc<ServerConfig>>,
}

impl TlsContext {
    pub fn new(config: TlsConfig) -> Self {
        Self {
            config,
            client: OnceLock::new(),
            server: OnceLock::new(),
        }
    }

    fn client_config(&self) -> StreamResult<Arc<ClientConfig>> {
        if let Some(config) = self.client.get() {
            return Ok(Arc::clone(config));
        }
        let mut roots = RootCertStore::empty();
        let ca = self.config.ca_path.as_deref().unwrap_or(&self.config.cert_path);
        for cert in load_certs(ca)? {
            roots.add(cert).map_err(tls_error)?;
        }
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?
            .with_root_certificates(roots)
            .with_no_client_auth();
        info!(target: "jit::server", "TLS client configuration loaded");
        Ok(Arc::clone(self.client.get_or_init(|| Arc::new(config))))
    }

    fn server_config(&self) -> StreamResult<Arc<ServerConfig>> {
        if let Some(config) = self.server.get() {
            return Ok(Arc::clone(config));
        }
        let certs = load_certs(&self.config.cert_path)?;
        let key = load_key(&self.config.key_path)?;
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(tls_error)?;
        info!(target: "jit::server", "TLS server configuration loaded");
        Ok(Arc::clone(self.server.get_or_init(|| Arc::new(config))))
    }

    pub fn connect(&self, tcp: TcpStream, host: &str) -> StreamResult<MessageStream> {
        let name = self.config.server_name.clone().unwrap_or_else(|| host.to_string());
        let server_name = ServerName::try_from(name).map_err(tls_error)?;
        let connection =
            ClientConnection::new(self.client_config()?, server_name).map_err(tls_error)?;
        Ok(MessageStream::new(Box::new(StreamOwned::new(connection, tcp))))
    }

    pub fn accept(&self, tcp: TcpStream) -> StreamResult<MessageStream> {
        let connection = ServerConnection::new(self.server_config()?).map_err(tls_error)?;
        Ok(MessageStream::new(Box::new(StreamOwned::new(connection, tcp))))
    }
}
