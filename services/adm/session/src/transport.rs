//! TCP and TLS transport for hub sessions.
//!
//! The session manager only needs a full-duplex byte stream. [`Transport`]
//! is the seam where the network stack plugs in; [`TcpTransport`] is the
//! default and optionally wraps the socket in TLS.

use crate::config::EndpointConfig;
use crate::SessionError;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

/// Byte stream usable by the session
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased transport stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// An opened transport
pub struct Connection {
    /// Stream to the hub
    pub stream: BoxedStream,
    /// Human-readable peer description for logs and events
    pub peer: String,
}

/// Opens byte streams to the hub
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new connection to `endpoint`
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Connection, SessionError>;
}

/// Unified stream type that can be either plain TCP or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS client stream
    #[cfg(feature = "tls")]
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => stream.get_ref().0.peer_addr(),
        }
    }
}

/// Resolve the hub address.
///
/// A literal `ip` wins over the hostname, for network stacks without a
/// resolver.
pub async fn resolve(endpoint: &EndpointConfig) -> Result<SocketAddr, SessionError> {
    if let Some(ip) = endpoint.ip {
        return Ok(SocketAddr::new(ip, endpoint.port));
    }

    let resolve_err = |reason: String| SessionError::Resolve {
        host: endpoint.hostname.clone(),
        reason,
    };

    let mut addrs = tokio::net::lookup_host((endpoint.hostname.as_str(), endpoint.port))
        .await
        .map_err(|e| resolve_err(e.to_string()))?;
    let addr = addrs
        .next()
        .ok_or_else(|| resolve_err("no addresses returned".into()))?;
    debug!("Resolved {} to {}", endpoint.hostname, addr);
    Ok(addr)
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Default transport: TCP, optionally wrapped in TLS
#[derive(Clone, Default)]
pub struct TcpTransport {
    tls: Option<TlsClientConfig>,
}

impl TcpTransport {
    /// Plain TCP transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap every connection in TLS
    pub fn with_tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = Some(tls);
        self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Connection, SessionError> {
        #[cfg(not(feature = "tls"))]
        if self.tls.is_some() {
            return Err(SessionError::Tls(
                "TLS requested but not compiled with TLS support".into(),
            ));
        }

        let addr = resolve(endpoint).await?;
        let tcp = connect_tcp(addr).await?;
        debug!("TCP connection established to {}", addr);

        #[cfg(feature = "tls")]
        let stream = match &self.tls {
            Some(tls) => {
                let sni = tls
                    .server_name
                    .clone()
                    .unwrap_or_else(|| endpoint.hostname.clone());
                tls::connect_tls(tls.client_config.clone(), tcp, &sni).await?
            }
            None => IoStream::Plain(tcp),
        };
        #[cfg(not(feature = "tls"))]
        let stream = IoStream::Plain(tcp);

        Ok(Connection {
            stream: Box::new(stream),
            peer: addr.to_string(),
        })
    }
}

/// TLS client configuration for hub connections
#[cfg(feature = "tls")]
#[derive(Clone)]
pub struct TlsClientConfig {
    /// Rustls client configuration
    pub client_config: std::sync::Arc<rustls::ClientConfig>,
    /// Server name for SNI; defaults to the endpoint hostname
    pub server_name: Option<String>,
}

#[cfg(not(feature = "tls"))]
#[derive(Clone)]
/// TLS client configuration for hub connections
pub struct TlsClientConfig;

// TLS-specific functionality
#[cfg(feature = "tls")]
/// TLS layer for hub connections
pub mod tls {
    use super::*;
    use rustls::pki_types::{CertificateDer, ServerName};
    use rustls::{ClientConfig, RootCertStore};
    use std::sync::Arc;
    use tokio_rustls::TlsConnector;

    /// Create a TLS client configuration trusting the given CA bundle
    pub fn make_client_config(ca_pem: &str) -> Result<ClientConfig, SessionError> {
        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut roots = RootCertStore::empty();
        let ca_certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut ca_pem.as_bytes()).collect();
        let ca_certs = ca_certs.map_err(|e| SessionError::Tls(format!("bad CA bundle: {}", e)))?;
        if ca_certs.is_empty() {
            return Err(SessionError::Tls("no certificates in CA bundle".into()));
        }

        for ca_cert in ca_certs {
            roots
                .add(CertificateDer::from(ca_cert))
                .map_err(|e| SessionError::Tls(format!("cannot add CA certificate: {}", e)))?;
        }

        Ok(ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth())
    }

    /// Run the TLS handshake over an open TCP stream
    pub async fn connect_tls(
        config: Arc<ClientConfig>,
        tcp_stream: TcpStream,
        sni: &str,
    ) -> Result<IoStream, SessionError> {
        debug!("Connecting via TLS (SNI: {})", sni);

        let connector = TlsConnector::from(config);
        let server_name = ServerName::try_from(sni.to_owned())
            .map_err(|_| SessionError::Tls(format!("invalid server name: {}", sni)))?;

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| SessionError::Tls(format!("handshake with {} failed: {}", sni, e)))?;

        Ok(IoStream::Tls(tls_stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_literal_ip_skips_resolution() {
        let endpoint = EndpointConfig {
            ip: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))),
            hostname: "does-not-resolve.invalid".into(),
            port: 4000,
        };
        let addr = resolve(&endpoint).await.unwrap();
        assert_eq!(addr, "10.0.0.7:4000".parse().unwrap());
    }

    #[tokio::test]
    async fn test_tcp_transport_connects() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let bound = listener.local_addr().unwrap();

        let endpoint = EndpointConfig {
            ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            hostname: "localhost".into(),
            port: bound.port(),
        };
        let accept = tokio::spawn(async move { listener.accept().await.is_ok() });

        let conn = TcpTransport::new().connect(&endpoint).await.unwrap();
        assert_eq!(conn.peer, bound.to_string());
        assert!(accept.await.unwrap());
    }

    #[cfg(not(feature = "tls"))]
    #[tokio::test]
    async fn test_tls_without_support_refuses_plain_fallback() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let endpoint = EndpointConfig {
            ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            hostname: "localhost".into(),
            port: listener.local_addr().unwrap().port(),
        };

        let transport = TcpTransport::new().with_tls(TlsClientConfig);
        let err = match transport.connect(&endpoint).await {
            Ok(_) => panic!("connected without TLS"),
            Err(e) => e,
        };
        assert!(matches!(err, SessionError::Tls(_)), "{}", err);

        let pending = tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
        assert!(pending.is_err(), "a plain TCP connection was opened");
    }

    #[cfg(feature = "tls")]
    #[test]
    fn test_empty_ca_bundle_rejected() {
        assert!(tls::make_client_config("").is_err());
    }
}
