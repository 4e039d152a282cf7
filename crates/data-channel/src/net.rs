//! Socket I/O primitives: dialing, listening and port mapping.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::time::Duration;

use peerxfer_transfer::BoxedStream;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::error::DataChannelError;

pub type NetFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// Opens outgoing and incoming byte streams.
pub trait Network: Send + Sync {
    fn dial<'a>(&'a self, host: &'a str, port: u16) -> NetFuture<'a, BoxedStream>;

    /// Binds a listener on `host`; port 0 picks an ephemeral port.
    fn listen<'a>(&'a self, host: &'a str, port: u16)
    -> NetFuture<'a, (Box<dyn Listener>, SocketAddr)>;
}

/// A bound listening socket.
pub trait Listener: Send {
    fn accept(&mut self) -> NetFuture<'_, (BoxedStream, SocketAddr)>;
}

/// Maps a bound local address to the address peers should dial.
pub trait PortMapper: Send + Sync {
    fn map(&self, local: SocketAddr) -> (String, u16);
}

/// Advertises the bound address as is, replacing a wildcard bind with
/// loopback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPortMapping;

impl PortMapper for NoPortMapping {
    fn map(&self, local: SocketAddr) -> (String, u16) {
        let ip = if local.ip().is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            local.ip()
        };
        (ip.to_string(), local.port())
    }
}

/// Advertises a configured public host with the bound port.
#[derive(Debug, Clone)]
pub struct StaticPortMapping {
    pub public_host: String,
}

impl PortMapper for StaticPortMapping {
    fn map(&self, local: SocketAddr) -> (String, u16) {
        (self.public_host.clone(), local.port())
    }
}

/// Plain TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpNetwork;

impl Network for TcpNetwork {
    fn dial<'a>(&'a self, host: &'a str, port: u16) -> NetFuture<'a, BoxedStream> {
        Box::pin(async move {
            let stream = TcpStream::connect((host, port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }

    fn listen<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> NetFuture<'a, (Box<dyn Listener>, SocketAddr)> {
        Box::pin(async move {
            let listener = TcpListener::bind((host, port)).await?;
            let addr = listener.local_addr()?;
            debug!(%addr, "listener bound");
            Ok((Box::new(TcpAcceptor(listener)) as Box<dyn Listener>, addr))
        })
    }
}

struct TcpAcceptor(TcpListener);

impl Listener for TcpAcceptor {
    fn accept(&mut self) -> NetFuture<'_, (BoxedStream, SocketAddr)> {
        Box::pin(async move {
            let (stream, addr) = self.0.accept().await?;
            stream.set_nodelay(true)?;
            Ok((Box::new(stream) as BoxedStream, addr))
        })
    }
}

/// Dials `host:port`, giving up after `timeout`.
pub async fn connect_with_timeout(
    network: &dyn Network,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<BoxedStream, DataChannelError> {
    match tokio::time::timeout(timeout, network.dial(host, port)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(DataChannelError::Timeout(format!("connect to {host}:{port}"))),
    }
}
