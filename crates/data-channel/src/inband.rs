//! In-band tier: file data tunnelled through the signaling channel.
//!
//! The sender proposes a block size, the receiver answers with the size it
//! will use. Each block travels base64 encoded with a sequence number and
//! the sender waits for its acknowledgement before sending the next one.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use peerxfer_protocol::SignalMessage;
use peerxfer_transfer::{
    ByteRing, OpsFuture, TransferError, Transport, Xfer, XferOps, XferType, with_deadline,
};
use tracing::{debug, info, trace};

use crate::context::NegotiatorContext;

#[derive(Default)]
struct InBandState {
    block_size: usize,
    /// Next sequence number to send or expect.
    seq: u16,
    inbound: Option<ByteRing>,
    /// Sequence number of the last block received, acked once drained.
    pending_ack: Option<u16>,
    closed: bool,
}

pub struct InBandNegotiator {
    ctx: NegotiatorContext,
    state: Mutex<InBandState>,
}

impl InBandNegotiator {
    pub fn new(ctx: NegotiatorContext) -> Self {
        Self {
            ctx,
            state: Mutex::new(InBandState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InBandState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block size in use; 0 before the stream is open.
    pub fn block_size(&self) -> usize {
        self.lock().block_size
    }

    async fn open(&self, xfer: &Arc<Xfer>) -> Result<(), TransferError> {
        let config = &self.ctx.config;
        let proposed = config.block_size;
        self.ctx
            .signal(xfer, SignalMessage::InBandOpen { block_size: proposed })
            .await?;

        let reply = with_deadline(
            "waiting for in-band open reply",
            config.in_band_timeout(),
            xfer.wait_signal(|m| {
                matches!(m, SignalMessage::InBandOpened { .. } | SignalMessage::InBandClose)
            }),
        )
        .await??;
        let SignalMessage::InBandOpened { block_size } = reply else {
            return Err(TransferError::TransportFailed("peer closed the in-band stream".into()));
        };
        let block = proposed.min(block_size);
        if block == 0 {
            return Err(TransferError::Remote("peer chose an in-band block size of 0".into()));
        }

        self.lock().block_size = block as usize;
        info!(key = %xfer.key(), block, "in-band stream open");
        xfer.start(Transport::Negotiated, None).await
    }

    async fn accept_open(&self, xfer: &Arc<Xfer>) -> Result<(), TransferError> {
        let config = &self.ctx.config;
        let open = with_deadline(
            "waiting for in-band open",
            config.negotiation_timeout(),
            xfer.wait_signal(|m| matches!(m, SignalMessage::InBandOpen { .. })),
        )
        .await??;
        let SignalMessage::InBandOpen { block_size } = open else {
            return Err(TransferError::Remote("expected an in-band open".into()));
        };
        let block = block_size.min(config.block_size);
        if block == 0 {
            return Err(TransferError::Remote("peer proposed an in-band block size of 0".into()));
        }

        {
            let mut state = self.lock();
            state.block_size = block as usize;
            state.inbound = Some(ByteRing::new(block as usize));
        }
        self.ctx
            .signal(xfer, SignalMessage::InBandOpened { block_size: block })
            .await?;
        info!(key = %xfer.key(), block, "in-band stream accepted");
        xfer.start(Transport::Negotiated, None).await
    }

    /// Moves buffered bytes into `buf`, if any are waiting.
    fn drain(&self, buf: &mut [u8]) -> Option<usize> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let ring = state.inbound.as_mut()?;
        if ring.is_empty() {
            return state.closed.then_some(0);
        }
        Some(ring.drain_into(buf))
    }
}

impl XferOps for InBandNegotiator {
    fn init<'a>(&'a self, xfer: &'a Arc<Xfer>) -> OpsFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            match xfer.xfer_type() {
                XferType::Send => self.open(xfer).await,
                XferType::Receive => self.accept_open(xfer).await,
            }
        })
    }

    fn read<'a>(
        &'a self,
        xfer: &'a Arc<Xfer>,
        buf: &'a mut [u8],
    ) -> OpsFuture<'a, Result<usize, TransferError>> {
        Box::pin(async move {
            if let Some(n) = self.drain(buf) {
                return Ok(n);
            }
            let message = with_deadline(
                "waiting for in-band data",
                self.ctx.config.in_band_timeout(),
                xfer.wait_signal(|m| {
                    matches!(m, SignalMessage::InBandData { .. } | SignalMessage::InBandClose)
                }),
            )
            .await??;

            let mut state = self.lock();
            let (seq, data) = match message {
                SignalMessage::InBandData { seq, data } => (seq, data),
                _ => {
                    debug!(key = %xfer.key(), "in-band stream closed by peer");
                    state.closed = true;
                    return Ok(0);
                }
            };
            if seq != state.seq {
                return Err(TransferError::Remote(format!(
                    "in-band block {seq} out of order, expected {}",
                    state.seq
                )));
            }
            if data.len() > state.block_size {
                return Err(TransferError::Remote(format!(
                    "in-band block of {} bytes exceeds the {} byte block size",
                    data.len(),
                    state.block_size
                )));
            }
            state.seq = seq.wrapping_add(1);
            state.pending_ack = Some(seq);
            trace!(key = %xfer.key(), seq, len = data.len(), "in-band block received");

            let ring = state.inbound.as_mut().ok_or(TransferError::Cancelled)?;
            ring.push(&data)
                .map_err(|e| TransferError::Local(format!("in-band buffer overrun: {e}")))?;
            Ok(ring.drain_into(buf))
        })
    }

    fn write<'a>(
        &'a self,
        xfer: &'a Arc<Xfer>,
        data: &'a [u8],
    ) -> OpsFuture<'a, Result<usize, TransferError>> {
        Box::pin(async move {
            let (seq, len) = {
                let mut state = self.lock();
                if state.block_size == 0 {
                    return Err(TransferError::Local("in-band stream is not open".into()));
                }
                let seq = state.seq;
                state.seq = seq.wrapping_add(1);
                (seq, data.len().min(state.block_size))
            };

            self.ctx
                .signal(
                    xfer,
                    SignalMessage::InBandData {
                        seq,
                        data: data[..len].to_vec(),
                    },
                )
                .await?;
            with_deadline(
                "waiting for in-band ack",
                self.ctx.config.in_band_timeout(),
                xfer.wait_signal(|m| matches!(m, SignalMessage::InBandAck { seq: acked } if *acked == seq)),
            )
            .await??;
            trace!(key = %xfer.key(), seq, len, "in-band block acknowledged");
            Ok(len)
        })
    }

    fn ack<'a>(
        &'a self,
        xfer: &'a Arc<Xfer>,
        _data: &'a [u8],
    ) -> OpsFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            let seq = {
                let mut state = self.lock();
                let drained = state.inbound.as_ref().is_some_and(ByteRing::is_empty);
                if drained { state.pending_ack.take() } else { None }
            };
            if let Some(seq) = seq {
                self.ctx.signal(xfer, SignalMessage::InBandAck { seq }).await?;
            }
            Ok(())
        })
    }

    fn end<'a>(&'a self, xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()> {
        Box::pin(async move {
            if xfer.xfer_type() == XferType::Send {
                if let Err(e) = self.ctx.signal(xfer, SignalMessage::InBandClose).await {
                    debug!(key = %xfer.key(), error = %e, "could not close in-band stream");
                }
            }
        })
    }

    fn cancel_send<'a>(&'a self, _xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()> {
        Box::pin(async move { self.lock().closed = true })
    }

    fn cancel_recv<'a>(&'a self, _xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.lock();
            state.closed = true;
            if let Some(ring) = state.inbound.as_mut() {
                ring.clear();
            }
        })
    }
}
