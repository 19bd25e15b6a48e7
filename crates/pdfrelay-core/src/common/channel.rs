//! Client-side channel setup shared by the front-end client and the
//! dispatcher's worker proxies.

use crate::{Error, Result};
use std::path::PathBuf;
use tonic::{
    codec::CompressionEncoding,
    transport::{Certificate, Channel, ClientTlsConfig, Endpoint},
};

/// Server name checked against the peer certificate when none is configured.
pub const DEFAULT_TLS_DOMAIN: &str = "localhost";

/// How to reach one gRPC peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// `host:port`, or a full `http(s)://` URI.
    pub address: String,
    /// PEM root certificate. When set the connection uses TLS.
    pub root_certificate: Option<PathBuf>,
    pub tls_domain: String,
    /// Gzip-compress outgoing messages.
    pub compress: bool,
}

impl ConnectOptions {
    pub fn plaintext(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            root_certificate: None,
            tls_domain: DEFAULT_TLS_DOMAIN.to_string(),
            compress: false,
        }
    }

    pub fn uri(&self) -> String {
        if self.address.contains("://") {
            self.address.clone()
        } else if self.root_certificate.is_some() {
            format!("https://{}", self.address)
        } else {
            format!("http://{}", self.address)
        }
    }

    pub fn compression(&self) -> Option<CompressionEncoding> {
        self.compress.then_some(CompressionEncoding::Gzip)
    }

    /// Builds the endpoint, loading the root certificate if one is configured.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] for an unparsable address, an unreadable
    /// certificate file, or rejected TLS settings.
    pub async fn endpoint(&self) -> Result<Endpoint> {
        let endpoint = Endpoint::from_shared(self.uri()).map_err(|e| {
            Error::configuration(format!("invalid address {}: {e}", self.address))
        })?;

        let Some(cert_path) = &self.root_certificate else {
            return Ok(endpoint);
        };
        let pem = tokio::fs::read(cert_path).await.map_err(|e| {
            Error::configuration(format!(
                "failed to read root certificate {}: {e}",
                cert_path.display()
            ))
        })?;
        let tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(pem))
            .domain_name(self.tls_domain.clone());

        endpoint
            .tls_config(tls)
            .map_err(|e| Error::configuration(format!("invalid TLS configuration: {e}")))
    }

    /// Connects eagerly, failing if the peer is unreachable.
    pub async fn connect(&self) -> Result<Channel> {
        self.endpoint()
            .await?
            .connect()
            .await
            .map_err(|e| Error::transport(format!("failed to connect to {}", self.address), e))
    }

    /// Returns a channel that connects on first use and reconnects after
    /// failures.
    pub async fn connect_lazy(&self) -> Result<Channel> {
        Ok(self.endpoint().await?.connect_lazy())
    }
}
