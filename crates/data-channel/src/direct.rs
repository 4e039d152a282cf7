//! SOCKS5 bytestream tier.
//!
//! The sender offers its own streamhost (when enabled) followed by the
//! configured proxies. The receiver tries each candidate in order and
//! reports the one it reached; the sender then uses the matching socket.
//! The connected socket is handed to the core, which pumps it directly.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use peerxfer_protocol::{ProtocolError, SessionKey, SignalMessage, Streamhost, socks5};
use peerxfer_transfer::{
    BoxedStream, OpsFuture, TransferError, Transport, Xfer, XferOps, XferType, with_deadline,
};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::context::NegotiatorContext;
use crate::error::DataChannelError;
use crate::net::Listener;

type AcceptTask = JoinHandle<Result<(BoxedStream, SocketAddr), TransferError>>;

pub struct DirectNegotiator {
    ctx: NegotiatorContext,
    accept_task: Mutex<Option<AbortHandle>>,
}

impl DirectNegotiator {
    pub fn new(ctx: NegotiatorContext) -> Self {
        Self {
            ctx,
            accept_task: Mutex::new(None),
        }
    }

    /// Stops the local streamhost, if one is still accepting.
    fn release(&self) {
        let handle = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    async fn negotiate_send(&self, xfer: &Arc<Xfer>) -> Result<(), TransferError> {
        let config = &self.ctx.config;
        let local_jid = self.ctx.local_jid();
        let hash = socks5::destination_hash(xfer.session_id(), local_jid, xfer.peer());

        let mut hosts = Vec::new();
        let mut accept_task: Option<AcceptTask> = None;
        if config.local_streamhost {
            match self.ctx.network.listen(&config.listen_host, 0).await {
                Ok((listener, addr)) => {
                    let (host, port) = self.ctx.port_mapper.map(addr);
                    hosts.push(Streamhost::new(local_jid, host, port));
                    let task = tokio::spawn(accept_streamhost(
                        listener,
                        hash.clone(),
                        xfer.key().clone(),
                        config.connect_timeout(),
                    ));
                    *self
                        .accept_task
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(task.abort_handle());
                    accept_task = Some(task);
                }
                Err(e) => {
                    warn!(key = %xfer.key(), error = %e, "local streamhost unavailable");
                }
            }
        }
        hosts.extend(config.proxies.iter().cloned());

        info!(key = %xfer.key(), candidates = hosts.len(), "offering streamhosts");
        self.ctx
            .signal(xfer, SignalMessage::StreamhostOffer { hosts: hosts.clone() })
            .await?;

        // The peer spends up to one connect timeout per candidate.
        let window = config.connect_timeout() * (hosts.len() as u32 + 1);
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);

        let mut accepted = None;
        let verdict = loop {
            tokio::select! {
                biased;
                result = join_accept(&mut accept_task) => {
                    accept_task = None;
                    accepted = Some(result?);
                }
                message = xfer.wait_signal(|m| {
                    matches!(m, SignalMessage::StreamhostUsed { .. } | SignalMessage::StreamhostFailed)
                }) => break message?,
                _ = &mut deadline => {
                    return Err(TransferError::Timeout(format!(
                        "no streamhost verdict after {}s",
                        window.as_secs()
                    )));
                }
            }
        };

        let jid = match verdict {
            SignalMessage::StreamhostUsed { jid } => jid,
            _ => {
                return Err(TransferError::TransportFailed(
                    "peer could not reach any streamhost".into(),
                ));
            }
        };

        if jid == local_jid {
            let (stream, addr) = match accepted {
                Some(conn) => conn,
                None => with_deadline(
                    "local streamhost connection",
                    config.connect_timeout(),
                    join_accept(&mut accept_task),
                )
                .await
                .map_err(|_| {
                    TransferError::Remote("peer reported the local streamhost but never connected".into())
                })??,
            };
            debug!(key = %xfer.key(), %addr, "using local streamhost");
            return xfer.start(Transport::Socket(stream), Some(addr)).await;
        }

        // The peer went through a proxy; the local streamhost is not needed.
        self.release();
        let proxy = hosts
            .iter()
            .find(|h| h.jid == jid)
            .ok_or_else(|| TransferError::Remote(format!("peer used unknown streamhost {jid}")))?;
        let stream = self.connect_streamhost(proxy, &hash).await.map_err(|e| {
            TransferError::Local(format!("streamhost {jid} selected by peer is unreachable: {e}"))
        })?;
        debug!(key = %xfer.key(), streamhost = %jid, "using proxy streamhost");
        xfer.start(Transport::Socket(stream), None).await
    }

    async fn negotiate_receive(&self, xfer: &Arc<Xfer>) -> Result<(), TransferError> {
        let hash = socks5::destination_hash(xfer.session_id(), xfer.peer(), self.ctx.local_jid());

        let offer = with_deadline(
            "waiting for streamhosts",
            self.ctx.config.negotiation_timeout(),
            xfer.wait_signal(|m| matches!(m, SignalMessage::StreamhostOffer { .. })),
        )
        .await??;
        let SignalMessage::StreamhostOffer { hosts } = offer else {
            return Err(TransferError::Remote("expected a streamhost offer".into()));
        };

        let mut candidates: VecDeque<Streamhost> = hosts.into();
        while let Some(host) = candidates.pop_front() {
            debug!(
                key = %xfer.key(),
                streamhost = %host.jid,
                host = %host.host,
                port = host.port,
                "trying streamhost"
            );
            match self.connect_streamhost(&host, &hash).await {
                Ok(stream) => {
                    info!(key = %xfer.key(), streamhost = %host.jid, "connected to streamhost");
                    self.ctx
                        .signal(xfer, SignalMessage::StreamhostUsed { jid: host.jid.clone() })
                        .await?;
                    let addr = format!("{}:{}", host.host, host.port).parse().ok();
                    return xfer.start(Transport::Socket(stream), addr).await;
                }
                Err(e) => {
                    warn!(
                        key = %xfer.key(),
                        streamhost = %host.jid,
                        error = %e,
                        remaining = candidates.len(),
                        "streamhost failed"
                    );
                }
            }
        }

        self.ctx.signal(xfer, SignalMessage::StreamhostFailed).await?;
        Err(TransferError::TransportFailed("no streamhost reachable".into()))
    }

    /// Connects to `host` and completes the client handshake within one
    /// connect timeout.
    async fn connect_streamhost(
        &self,
        host: &Streamhost,
        hash: &str,
    ) -> Result<BoxedStream, DataChannelError> {
        let attempt = async {
            let mut stream = self.ctx.network.dial(&host.host, host.port).await?;
            socks5::client_handshake(&mut stream, hash).await?;
            Ok::<_, DataChannelError>(stream)
        };
        match tokio::time::timeout(self.ctx.config.connect_timeout(), attempt).await {
            Ok(result) => result,
            Err(_) => Err(DataChannelError::Timeout(format!(
                "streamhost {}:{}",
                host.host, host.port
            ))),
        }
    }
}

impl XferOps for DirectNegotiator {
    fn init<'a>(&'a self, xfer: &'a Arc<Xfer>) -> OpsFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            let result = match xfer.xfer_type() {
                XferType::Send => self.negotiate_send(xfer).await,
                XferType::Receive => self.negotiate_receive(xfer).await,
            };
            self.release();
            result
        })
    }

    fn end<'a>(&'a self, _xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()> {
        Box::pin(async move { self.release() })
    }

    fn cancel_send<'a>(&'a self, _xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()> {
        Box::pin(async move { self.release() })
    }

    fn cancel_recv<'a>(&'a self, _xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()> {
        Box::pin(async move { self.release() })
    }
}

async fn join_accept(
    task: &mut Option<AcceptTask>,
) -> Result<(BoxedStream, SocketAddr), TransferError> {
    match task {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) => Err(TransferError::Local(format!("streamhost accept task failed: {e}"))),
        },
        None => std::future::pending().await,
    }
}

/// Accepts connections on the local streamhost until one completes the
/// server handshake. Connections that fail the handshake are dropped,
/// except a wrong destination hash, which aborts the transfer.
async fn accept_streamhost(
    mut listener: Box<dyn Listener>,
    hash: String,
    key: SessionKey,
    handshake_timeout: Duration,
) -> Result<(BoxedStream, SocketAddr), TransferError> {
    loop {
        let (mut stream, addr) = listener
            .accept()
            .await
            .map_err(|e| TransferError::Local(format!("streamhost accept failed: {e}")))?;
        let handshake =
            tokio::time::timeout(handshake_timeout, socks5::server_handshake(&mut stream, &hash))
                .await;
        match handshake {
            Ok(Ok(())) => {
                debug!(%key, %addr, "peer connected to local streamhost");
                return Ok((stream, addr));
            }
            Ok(Err(ProtocolError::HashMismatch)) => {
                warn!(%key, %addr, "streamhost connection with wrong destination hash");
                return Err(TransferError::Remote("SOCKS5 destination hash mismatch".into()));
            }
            Ok(Err(e)) => {
                debug!(%key, %addr, error = %e, "discarding failed streamhost connection");
            }
            Err(_) => {
                debug!(%key, %addr, "discarding stalled streamhost connection");
            }
        }
    }
}
