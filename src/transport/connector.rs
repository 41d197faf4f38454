//! Opening the byte stream to the broker.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpSocket, lookup_host},
};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, crypto::ring, pki_types::ServerName};
use tracing::debug;

use super::{SocketOptions, TransportError};

/// Default broker host.
pub const BROKER_HOST: &str = "edge-mqtt.facebook.com";
/// Default broker port.
pub const BROKER_PORT: u16 = 443;

/// Byte streams the transport can run over.
pub trait BrokerStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T> BrokerStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Boxed broker stream.
pub type BoxedStream = Box<dyn BrokerStream>;

/// Source of broker connections.
///
/// Implementations must be cancellation-safe: the handshake timeout drops a
/// pending `connect()` future.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh stream to the broker.
    async fn connect(&self) -> Result<BoxedStream, TransportError>;
}

/// Connects over TCP and TLS, verifying the broker against the bundled
/// web PKI roots.
#[derive(Clone)]
pub struct TlsConnector {
    host: String,
    port: u16,
    socket_options: SocketOptions,
    tls: Arc<ClientConfig>,
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("socket_options", &self.socket_options)
            .finish_non_exhaustive()
    }
}

impl TlsConnector {
    /// Connector for the default broker endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Tls`] if the TLS configuration cannot be
    /// built.
    pub fn new() -> Result<Self, TransportError> { Self::with_endpoint(BROKER_HOST, BROKER_PORT) }

    /// Connector for an arbitrary endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Tls`] if the TLS configuration cannot be
    /// built.
    pub fn with_endpoint(host: impl Into<String>, port: u16) -> Result<Self, TransportError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls = ClientConfig::builder_with_provider(ring::default_provider().into())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            host: host.into(),
            port,
            socket_options: SocketOptions::default().nodelay(true),
            tls: Arc::new(tls),
        })
    }

    /// Replace the socket options.
    #[must_use]
    pub fn socket_options(mut self, options: SocketOptions) -> Self {
        self.socket_options = options;
        self
    }

    /// Broker endpoint as `host:port`.
    #[must_use]
    pub fn endpoint(&self) -> String { format!("{}:{}", self.host, self.port) }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self) -> Result<BoxedStream, TransportError> {
        let server_name =
            ServerName::try_from(self.host.clone()).map_err(|_| TransportError::InvalidHost(self.host.clone()))?;
        let addr = lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| TransportError::Unresolved(self.host.clone()))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        self.socket_options.apply(&socket)?;
        let tcp = socket.connect(addr).await?;
        debug!(%addr, host = %self.host, "tcp connected; starting tls");
        let tls = tokio_rustls::TlsConnector::from(Arc::clone(&self.tls))
            .connect(server_name, tcp)
            .await?;
        Ok(Box::new(tls))
    }
}
