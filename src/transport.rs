//! Byte streams under the message queue: plain TCP, in-memory duplex (tests),
//! and either of those wrapped in client- or server-side TLS.

use crate::error::{LdapError, Result};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// Unencrypted stream.
pub enum PlainStream {
    Tcp(TcpStream),
    Memory(DuplexStream),
}

impl AsyncRead for PlainStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            PlainStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            PlainStream::Memory(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PlainStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            PlainStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            PlainStream::Memory(s) => Pin::new(s).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            PlainStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            PlainStream::Memory(s) => Pin::new(s).poll_flush(cx),
        }
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            PlainStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            PlainStream::Memory(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// How to turn a plain transport into TLS.
#[derive(Clone)]
pub enum TlsUpgrade {
    Client {
        connector: TlsConnector,
        server_name: rustls::pki_types::ServerName<'static>,
    },
    Server {
        acceptor: TlsAcceptor,
    },
}

impl TlsUpgrade {
    pub fn client(config: Arc<rustls::ClientConfig>, host: &str) -> Result<Self> {
        let server_name = crate::tls::server_name(host).map_err(|e| LdapError::connection(format!("{:#}", e)))?;
        Ok(TlsUpgrade::Client {
            connector: TlsConnector::from(config),
            server_name,
        })
    }

    pub fn server(config: Arc<rustls::ServerConfig>) -> Self {
        TlsUpgrade::Server {
            acceptor: TlsAcceptor::from(config),
        }
    }
}

pub enum Transport {
    Plain(PlainStream),
    ClientTls(Box<tokio_rustls::client::TlsStream<PlainStream>>),
    ServerTls(Box<tokio_rustls::server::TlsStream<PlainStream>>),
    /// Left behind after a failed upgrade or close.
    Closed,
}

impl Transport {
    /// Connect over TCP, then perform the TLS handshake when `tls` is given (LDAPS).
    pub async fn connect(host: &str, port: u16, timeout: Duration, tls: Option<TlsUpgrade>) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let tcp = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| LdapError::connection(format!("connect to {} timed out", addr)))?
            .map_err(|e| LdapError::connection(format!("connect to {} failed: {}", addr, e)))?;
        let _ = tcp.set_nodelay(true);
        debug!("Connected to {}", addr);
        let transport = Transport::Plain(PlainStream::Tcp(tcp));
        match tls {
            Some(upgrade) => transport.upgrade(upgrade).await,
            None => Ok(transport),
        }
    }

    pub fn memory(stream: DuplexStream) -> Self {
        Transport::Plain(PlainStream::Memory(stream))
    }

    pub fn tcp(stream: TcpStream) -> Self {
        Transport::Plain(PlainStream::Tcp(stream))
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Transport::ClientTls(_) | Transport::ServerTls(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Transport::Closed)
    }

    /// Perform the TLS handshake over the current plain stream.
    pub async fn upgrade(self, upgrade: TlsUpgrade) -> Result<Self> {
        let plain = match self {
            Transport::Plain(plain) => plain,
            Transport::Closed => return Err(LdapError::connection("transport is closed")),
            _ => return Err(LdapError::operation(crate::result_code::OPERATIONS_ERROR, "already encrypted")),
        };
        match upgrade {
            TlsUpgrade::Client {
                connector,
                server_name,
            } => {
                let stream = connector
                    .connect(server_name, plain)
                    .await
                    .map_err(|e| LdapError::connection(format!("TLS handshake failed: {}", e)))?;
                Ok(Transport::ClientTls(Box::new(stream)))
            }
            TlsUpgrade::Server { acceptor } => {
                let stream = acceptor
                    .accept(plain)
                    .await
                    .map_err(|e| LdapError::connection(format!("TLS handshake failed: {}", e)))?;
                Ok(Transport::ServerTls(Box::new(stream)))
            }
        }
    }
}

fn closed_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "transport is closed")
}

impl AsyncRead for Transport {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Transport::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Transport::Closed => Poll::Ready(Err(closed_error())),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Transport::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Transport::Closed => Poll::Ready(Err(closed_error())),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Transport::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Transport::Closed => Poll::Ready(Ok(())),
        }
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Transport::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Transport::Closed => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_memory_transport_roundtrip() {
        let (a, b) = tokio::io::duplex(64);
        let mut left = Transport::memory(a);
        let mut right = Transport::memory(b);
        left.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert!(!left.is_encrypted());
        assert!(!right.is_closed());
    }

    #[tokio::test]
    async fn test_closed_transport_errors() {
        let mut closed = Transport::Closed;
        assert!(closed.write_all(b"x").await.is_err());
        let upgrade = TlsUpgrade::server(Arc::new(
            rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_cert_resolver(Arc::new(rustls::server::ResolvesServerCertUsingSni::new())),
        ));
        assert!(matches!(
            Transport::Closed.upgrade(upgrade).await,
            Err(LdapError::Connection { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = Transport::connect("127.0.0.1", port, Duration::from_secs(2), None)
            .await
            .err()
            .unwrap();
        assert!(err.is_connection_error());
    }
}
