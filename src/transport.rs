//! The dialer seam HTTP client code connects through.
//!
//! Client code asks a [`Dialer`] for a connection instead of opening
//! sockets itself. [`TcpDialer`] is the real network; [`Interceptor`]
//! hands out intercepted streams for destinations the registry claims and
//! falls back to another dialer for everything else.

use crate::connection::InterceptedStream;
use crate::error::ConfigurationError;
use crate::registry::Registry;
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a connection goes. The scheme is carried so secure destinations
/// can be told apart; no TLS is negotiated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self::new(Scheme::Http, host, port)
    }

    pub fn https(host: impl Into<String>, port: u16) -> Self {
        Self::new(Scheme::Https, host, port)
    }

    /// Destination of an absolute URL such as `https://example.com/path`.
    pub fn from_url(url: &str) -> Result<Self, ConfigurationError> {
        let invalid = |reason: &str| ConfigurationError::InvalidUri {
            uri: url.to_string(),
            reason: reason.to_string(),
        };
        let parsed = url::Url::parse(url).map_err(|e| invalid(&e.to_string()))?;
        let scheme = match parsed.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => return Err(invalid("scheme must be http or https")),
        };
        let host = parsed.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = parsed.port().unwrap_or_else(|| scheme.default_port());
        Ok(Self::new(scheme, host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// A bidirectional byte stream.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}

/// Opens connections to endpoints.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, endpoint: &Endpoint) -> io::Result<Box<dyn Connection>>;
}

/// Plain TCP to the real destination.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, endpoint: &Endpoint) -> io::Result<Box<dyn Connection>> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Dialer that intercepts connections the registry claims.
#[derive(Clone)]
pub struct Interceptor {
    registry: Arc<Registry>,
    fallback: Arc<dyn Dialer>,
}

impl Interceptor {
    pub fn new(registry: Arc<Registry>, fallback: Arc<dyn Dialer>) -> Self {
        Self { registry, fallback }
    }

    /// Interceptor falling back to plain TCP.
    pub fn with_tcp(registry: Arc<Registry>) -> Self {
        Self::new(registry, Arc::new(TcpDialer))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Connect to `endpoint`, intercepting when the registry is enabled and
    /// the destination looks like HTTP it could serve.
    pub async fn connect(&self, endpoint: &Endpoint) -> io::Result<InterceptorStream> {
        if !self.registry.should_intercept(&endpoint.host, endpoint.port) {
            debug!(endpoint = %endpoint, "Connecting to real destination");
            let conn = self.fallback.dial(endpoint).await?;
            return Ok(InterceptorStream::Passthrough(conn));
        }

        debug!(endpoint = %endpoint, "Intercepting connection");
        Ok(InterceptorStream::Intercepted(InterceptedStream::open(
            Arc::clone(&self.registry),
            Arc::clone(&self.fallback),
            endpoint.clone(),
        )))
    }
}

#[async_trait]
impl Dialer for Interceptor {
    async fn dial(&self, endpoint: &Endpoint) -> io::Result<Box<dyn Connection>> {
        Ok(Box::new(self.connect(endpoint).await?))
    }
}

/// What [`Interceptor::connect`] hands out.
pub enum InterceptorStream {
    Intercepted(InterceptedStream),
    Passthrough(Box<dyn Connection>),
}

impl InterceptorStream {
    pub fn is_intercepted(&self) -> bool {
        matches!(self, InterceptorStream::Intercepted(_))
    }

    pub fn as_intercepted(&self) -> Option<&InterceptedStream> {
        match self {
            InterceptorStream::Intercepted(stream) => Some(stream),
            InterceptorStream::Passthrough(_) => None,
        }
    }

    pub fn as_intercepted_mut(&mut self) -> Option<&mut InterceptedStream> {
        match self {
            InterceptorStream::Intercepted(stream) => Some(stream),
            InterceptorStream::Passthrough(_) => None,
        }
    }
}

impl AsyncRead for InterceptorStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            InterceptorStream::Intercepted(stream) => Pin::new(stream).poll_read(cx, buf),
            InterceptorStream::Passthrough(conn) => Pin::new(conn).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for InterceptorStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            InterceptorStream::Intercepted(stream) => Pin::new(stream).poll_write(cx, buf),
            InterceptorStream::Passthrough(conn) => Pin::new(conn).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            InterceptorStream::Intercepted(stream) => Pin::new(stream).poll_flush(cx),
            InterceptorStream::Passthrough(conn) => Pin::new(conn).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            InterceptorStream::Intercepted(stream) => Pin::new(stream).poll_shutdown(cx),
            InterceptorStream::Passthrough(conn) => Pin::new(conn).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_endpoint_from_url() {
        let endpoint = Endpoint::from_url("https://github.com/some/path").unwrap();
        assert_eq!(endpoint, Endpoint::https("github.com", 443));

        let endpoint = Endpoint::from_url("http://localhost:8080/").unwrap();
        assert_eq!(endpoint.port, 8080);
        assert_eq!(endpoint.to_string(), "http://localhost:8080");

        assert!(Endpoint::from_url("ftp://example.com/").is_err());
        assert!(Endpoint::from_url("not a url").is_err());
    }

    #[tokio::test]
    async fn test_tcp_dialer_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let mut conn = TcpDialer.dial(&Endpoint::http("127.0.0.1", port)).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        conn.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_registry_dials_fallback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let registry = Arc::new(Registry::new());
        let interceptor = Interceptor::with_tcp(registry);

        let accept = tokio::spawn(async move { listener.accept().await.is_ok() });
        let stream = interceptor
            .connect(&Endpoint::http("127.0.0.1", port))
            .await
            .unwrap();
        assert!(!stream.is_intercepted());
        assert!(accept.await.unwrap());
    }

    #[tokio::test]
    async fn test_enabled_registry_intercepts_http_ports() {
        let registry = Arc::new(Registry::new());
        registry.enable(false);
        let interceptor = Interceptor::with_tcp(registry);
        let stream = interceptor
            .connect(&Endpoint::http("example.com", 80))
            .await
            .unwrap();
        assert!(stream.is_intercepted());
    }
}
