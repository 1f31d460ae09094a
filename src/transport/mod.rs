use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Byte stream usable by the framing layer
pub trait StreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamIo for T {}

/// A connected, not-yet-handshaken stream
pub type BoxedStream = Box<dyn StreamIo>;

/// Accept side of a transport binding
#[async_trait]
pub trait Acceptor: Send {
    /// Wait for the next inbound connection
    async fn accept(&mut self) -> io::Result<(BoxedStream, SocketAddr)>;

    /// The address this acceptor is bound to
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Capability set the peer manager needs from the wire
///
/// Implementations supply raw connected streams; admission (protocol check
/// and identity exchange) stays with the manager. Tests substitute
/// implementations that refuse selected dials to shape the topology.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind a listening endpoint
    async fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn Acceptor>>;

    /// Dial a remote endpoint, bounded by `connect_timeout`
    async fn dial(&self, addr: SocketAddr, connect_timeout: Duration) -> io::Result<BoxedStream>;
}

/// Default TCP transport
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

struct TcpAcceptor {
    listener: TcpListener,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> io::Result<(BoxedStream, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), addr))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn Acceptor>> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Box::new(TcpAcceptor { listener }))
    }

    async fn dial(&self, addr: SocketAddr, connect_timeout: Duration) -> io::Result<BoxedStream> {
        debug!("Dialing peer {}", addr);

        // Connect with timeout
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                debug!("Connected to peer {}", addr);
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Ok(Err(e)) => {
                debug!("Failed to connect to peer {}: {}", addr, e);
                Err(e)
            }
            Err(_) => {
                debug!("Connection to peer {} timed out", addr);
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "Connection timed out",
                ))
            }
        }
    }
}
