//! Establish TLS sessions, directly or through a proxy

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};

use super::tls::{self, TlsMode};
use super::tunnel;
use crate::error::{AutobidError, Result};
use crate::models::ProxyEndpoint;

/// Default budget for dial + tunnel + handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Any bidirectional byte stream a connection can run over
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static> ByteStream for T {}

/// Produces a ready-to-use encrypted stream to `host:port`
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        host: &str,
        port: u16,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Box<dyn ByteStream>>;
}

/// The production [`Dialer`]: TCP (optionally tunneled) followed by a rustls handshake
#[derive(Clone)]
pub struct Connector {
    tls_config: Arc<ClientConfig>,
    mode: TlsMode,
    connect_timeout: Duration,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("mode", &self.mode)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl Connector {
    pub fn new(mode: TlsMode) -> Result<Self> {
        Ok(Self {
            tls_config: tls::client_config(mode)?,
            mode,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn mode(&self) -> TlsMode {
        self.mode
    }

    async fn establish(
        &self,
        host: &str,
        port: u16,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Box<dyn ByteStream>> {
        let tcp = tunnel::dial(proxy, host, port).await?;
        let _ = tcp.set_nodelay(true);

        let server_name = tls::server_name(host)?;
        let connector = TlsConnector::from(self.tls_config.clone());
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| AutobidError::Connect(format!("TLS handshake with {} failed: {}", host, e)))?;

        debug!("TLS session established with {}:{}", host, port);
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl Dialer for Connector {
    #[instrument(skip(self, proxy), fields(mode = self.mode.as_str(), proxied = proxy.is_some()))]
    async fn dial(
        &self,
        host: &str,
        port: u16,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Box<dyn ByteStream>> {
        tokio::time::timeout(self.connect_timeout, self.establish(host, port, proxy))
            .await
            .map_err(|_| {
                AutobidError::Connect(format!(
                    "connect to {}:{} timed out after {}s",
                    host,
                    port,
                    self.connect_timeout.as_secs()
                ))
            })?
    }
}
