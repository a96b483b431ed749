//! A socket abstraction unifying plain TCP and TLS-terminated connections
//! so the session's data pump can read/write either leg without caring
//! which it has.
//!
//! Grounded on the teacher's `crates/agentgateway/src/transport/stream.rs`
//! `SocketType`/`Socket` split (an enum implementing `AsyncRead`/
//! `AsyncWrite` by delegation, wrapped in a struct carrying per-connection
//! metadata) trimmed to the two transports amqpprox needs: plain TCP and
//! rustls-terminated TLS. The HBONE/in-memory-duplex variants the teacher
//! carries have no counterpart here and are dropped.

use std::io::IoSlice;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

enum Transport {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// Either leg of a session: the client-facing socket, or the broker-facing
/// one. Both are driven identically by the data pump.
pub struct Socket {
    info: ConnectionInfo,
    inner: Transport,
}

impl Socket {
    pub fn from_tcp(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_nodelay(true)?;
        let info = ConnectionInfo {
            peer_addr: stream.peer_addr()?,
            local_addr: stream.local_addr()?,
        };
        Ok(Self {
            info,
            inner: Transport::Tcp(stream),
        })
    }

    pub async fn connect(target: SocketAddr) -> std::io::Result<Self> {
        Self::from_tcp(TcpStream::connect(target).await?)
    }

    pub fn info(&self) -> ConnectionInfo {
        self.info
    }

    /// Terminate TLS on an already-accepted client connection (server
    /// role).
    pub async fn upgrade_server(self, acceptor: TlsAcceptor) -> std::io::Result<Self> {
        let Transport::Tcp(tcp) = self.inner else {
            return Err(std::io::Error::other("socket is already TLS-wrapped"));
        };
        let stream = acceptor.accept(tcp).await?;
        Ok(Self {
            info: self.info,
            inner: Transport::Tls(Box::new(TlsStream::Server(stream))),
        })
    }

    /// Re-initiate TLS toward the broker (client role), used when a
    /// backend has `tlsEnabled` set.
    pub async fn upgrade_client(
        self,
        connector: TlsConnector,
        server_name: rustls::pki_types::ServerName<'static>,
    ) -> std::io::Result<Self> {
        let Transport::Tcp(tcp) = self.inner else {
            return Err(std::io::Error::other("socket is already TLS-wrapped"));
        };
        let stream = connector.connect(server_name, tcp).await?;
        Ok(Self {
            info: self.info,
            inner: Transport::Tls(Box::new(TlsStream::Client(stream))),
        })
    }
}

impl AsyncRead for Socket {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().inner {
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match &mut self.get_mut().inner {
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().inner {
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().inner {
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        match &mut self.get_mut().inner {
            Transport::Tcp(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match &self.inner {
            Transport::Tcp(s) => s.is_write_vectored(),
            Transport::Tls(s) => s.is_write_vectored(),
        }
    }
}

/// Shared TLS material for both directions: a server config to terminate
/// client-facing TLS, and a client config to re-initiate TLS toward a
/// backend. Either half may be absent if that direction never uses TLS.
#[derive(Clone, Default)]
pub struct TlsContext {
    pub server: Option<Arc<rustls::ServerConfig>>,
    pub client: Option<Arc<rustls::ClientConfig>>,
}

impl TlsContext {
    pub fn acceptor(&self) -> Option<TlsAcceptor> {
        self.server.clone().map(TlsAcceptor::from)
    }

    pub fn connector(&self) -> Option<TlsConnector> {
        self.client.clone().map(TlsConnector::from)
    }
}
