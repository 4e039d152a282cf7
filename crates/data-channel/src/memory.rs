//! In-process network for loopback use and deterministic tests.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use peerxfer_transfer::BoxedStream;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tracing::trace;

use crate::net::{Listener, NetFuture, Network};

const PIPE_CAPACITY: usize = 64 * 1024;
const FIRST_PORT: u16 = 40_000;

type Endpoint = (IpAddr, u16);

/// Named endpoints connected by in-memory pipes.
///
/// Besides real listeners it can host *blackhole* endpoints, where a dial
/// never completes, and *silent* endpoints, where the dial succeeds but the
/// far side never reads or writes.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    listeners: HashMap<Endpoint, mpsc::UnboundedSender<(DuplexStream, SocketAddr)>>,
    blackholes: HashSet<Endpoint>,
    silent: HashSet<Endpoint>,
    // Far ends of silent connections, kept open so the dialer sees no EOF.
    parked: Vec<DuplexStream>,
    dials: Vec<(String, u16)>,
    next_port: u16,
}

impl MemoryInner {
    fn allocate_port(&mut self) -> u16 {
        if self.next_port < FIRST_PORT {
            self.next_port = FIRST_PORT;
        }
        let port = self.next_port;
        self.next_port = self.next_port.wrapping_add(1);
        port
    }
}

fn parse_host(host: &str) -> io::Result<IpAddr> {
    host.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("memory network needs an IP literal, got {host}"),
        )
    })
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dials to `host:port` will hang forever.
    pub fn add_blackhole(&self, host: &str, port: u16) {
        if let Ok(ip) = parse_host(host) {
            self.lock().blackholes.insert((ip, port));
        }
    }

    /// Dials to `host:port` connect to a peer that never speaks.
    pub fn add_silent(&self, host: &str, port: u16) {
        if let Ok(ip) = parse_host(host) {
            self.lock().silent.insert((ip, port));
        }
    }

    /// Every dial attempted so far, in order.
    pub fn dials(&self) -> Vec<(String, u16)> {
        self.lock().dials.clone()
    }
}

impl Network for MemoryNetwork {
    fn dial<'a>(&'a self, host: &'a str, port: u16) -> NetFuture<'a, BoxedStream> {
        Box::pin(async move {
            let ip = parse_host(host)?;
            let endpoint = (ip, port);
            enum Route {
                Blackhole,
                Stream(DuplexStream),
            }

            let route = {
                let mut inner = self.lock();
                inner.dials.push((host.to_string(), port));
                if inner.blackholes.contains(&endpoint) {
                    Route::Blackhole
                } else if inner.silent.contains(&endpoint) {
                    let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
                    inner.parked.push(far);
                    Route::Stream(near)
                } else {
                    let client_port = inner.allocate_port();
                    let tx = inner.listeners.get(&endpoint).cloned().ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::ConnectionRefused,
                            format!("nothing listening on {host}:{port}"),
                        )
                    })?;
                    let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
                    let client = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), client_port);
                    tx.send((far, client)).map_err(|_| {
                        io::Error::new(io::ErrorKind::ConnectionRefused, "listener closed")
                    })?;
                    Route::Stream(near)
                }
            };

            match route {
                Route::Blackhole => {
                    trace!(host, port, "dial into blackhole");
                    std::future::pending::<()>().await;
                    Err(io::Error::new(io::ErrorKind::TimedOut, "unreachable"))
                }
                Route::Stream(stream) => Ok(Box::new(stream) as BoxedStream),
            }
        })
    }

    fn listen<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> NetFuture<'a, (Box<dyn Listener>, SocketAddr)> {
        Box::pin(async move {
            let ip = parse_host(host)?;
            let mut inner = self.lock();
            let port = if port == 0 { inner.allocate_port() } else { port };
            let endpoint = (ip, port);
            if inner.listeners.contains_key(&endpoint) {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{host}:{port} already bound"),
                ));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            inner.listeners.insert(endpoint, tx);
            let listener = MemoryListener {
                rx,
                endpoint,
                network: self.clone(),
            };
            Ok((
                Box::new(listener) as Box<dyn Listener>,
                SocketAddr::new(ip, port),
            ))
        })
    }
}

struct MemoryListener {
    rx: mpsc::UnboundedReceiver<(DuplexStream, SocketAddr)>,
    endpoint: Endpoint,
    network: MemoryNetwork,
}

impl Listener for MemoryListener {
    fn accept(&mut self) -> NetFuture<'_, (BoxedStream, SocketAddr)> {
        Box::pin(async move {
            match self.rx.recv().await {
                Some((stream, addr)) => Ok((Box::new(stream) as BoxedStream, addr)),
                None => Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed")),
            }
        })
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.lock().listeners.remove(&self.endpoint);
    }
}
