//! The offer exchange and the walk down the transport tiers.
//!
//! The sender offers the file with every method it supports; the receiver
//! accepts with the intersection, in fallback order. Both sides then try
//! the agreed tiers one after another. A tier that fails with
//! [`TransferError::TransportFailed`] hands over to the next; any other
//! error ends the transfer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use peerxfer_protocol::{FileOffer, Method, SignalMessage, agree_methods};
use peerxfer_transfer::{OpsFuture, TransferError, Xfer, XferOps, XferStatus, XferType};
use tracing::{debug, info, warn};

use crate::context::NegotiatorContext;
use crate::direct::DirectNegotiator;
use crate::inband::InBandNegotiator;
use crate::relay::RelayNegotiator;

/// Reason sent to the peer when an accepted transfer is refused.
pub const REFUSED: &str = "transfer refused by receiver";

pub struct FallbackNegotiator {
    ctx: NegotiatorContext,
    /// Methods the peer offered; empty for outgoing transfers.
    offered: Vec<Method>,
    active: Mutex<Option<Arc<dyn XferOps>>>,
    /// Set once `Accept` has gone out; a later refusal must cancel instead.
    answered: AtomicBool,
}

impl FallbackNegotiator {
    /// Negotiator for an outgoing transfer.
    pub fn new(ctx: NegotiatorContext) -> Self {
        Self::for_offer(ctx, Vec::new())
    }

    /// Negotiator for an incoming offer listing `offered`.
    pub fn for_offer(ctx: NegotiatorContext, offered: Vec<Method>) -> Self {
        Self {
            ctx,
            offered,
            active: Mutex::new(None),
            answered: AtomicBool::new(false),
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<Arc<dyn XferOps>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active(&self) -> Option<Arc<dyn XferOps>> {
        self.lock_active().clone()
    }

    fn tier(&self, method: Method) -> Arc<dyn XferOps> {
        let ctx = self.ctx.clone();
        match method {
            Method::Bytestreams => Arc::new(DirectNegotiator::new(ctx)),
            Method::Relay => Arc::new(RelayNegotiator::new(ctx)),
            Method::InBand => Arc::new(InBandNegotiator::new(ctx)),
        }
    }

    async fn offer(&self, xfer: &Arc<Xfer>) -> Result<Vec<Method>, TransferError> {
        let supported = self.ctx.config.methods.clone();
        let file = FileOffer {
            name: xfer.filename(),
            size: xfer.size(),
            mime_type: None,
            description: xfer.message().unwrap_or_default(),
        };
        info!(key = %xfer.key(), name = %file.name, size = file.size, "offering file");
        self.ctx
            .signal(
                xfer,
                SignalMessage::Offer {
                    file,
                    methods: supported.clone(),
                },
            )
            .await?;

        // No deadline: the peer's user decides in their own time.
        let reply = xfer
            .wait_signal(|m| matches!(m, SignalMessage::Accept { .. } | SignalMessage::Decline))
            .await?;
        match reply {
            SignalMessage::Accept { methods } => check_accepted(&supported, &methods),
            _ => {
                info!(key = %xfer.key(), "offer declined by peer");
                Err(TransferError::Declined)
            }
        }
    }

    async fn accept(&self, xfer: &Arc<Xfer>) -> Result<Vec<Method>, TransferError> {
        let methods = agree_methods(&self.offered, &self.ctx.config.methods);
        if methods.is_empty() {
            self.ctx.signal(xfer, SignalMessage::Decline).await?;
            return Err(TransferError::Local("no transport method in common with peer".into()));
        }
        self.answered.store(true, Ordering::SeqCst);
        self.ctx
            .signal(xfer, SignalMessage::Accept { methods: methods.clone() })
            .await?;
        Ok(methods)
    }

    async fn walk(&self, xfer: &Arc<Xfer>, methods: &[Method]) -> Result<(), TransferError> {
        for (attempt, method) in methods.iter().copied().enumerate() {
            let tier = self.tier(method);
            *self.lock_active() = Some(Arc::clone(&tier));
            xfer.set_transport(method.as_str());
            debug!(key = %xfer.key(), %method, attempt, "trying transport");

            match tier.init(xfer).await {
                Ok(()) => return Ok(()),
                Err(TransferError::TransportFailed(reason)) => {
                    warn!(key = %xfer.key(), %method, %reason, "transport failed, falling back");
                    match xfer.xfer_type() {
                        XferType::Send => tier.cancel_send(xfer).await,
                        XferType::Receive => tier.cancel_recv(xfer).await,
                    }
                }
                Err(e) => return Err(e),
            }
        }
        *self.lock_active() = None;
        Err(TransferError::Local("all transport methods failed".into()))
    }

    /// Tells the peer about a cancellation that did not come from it.
    async fn notify_cancel(&self, xfer: &Arc<Xfer>) {
        let reason = match xfer.status() {
            XferStatus::CancelLocal => xfer.message().unwrap_or_default(),
            _ => String::new(),
        };
        if let Err(e) = self.ctx.signal(xfer, SignalMessage::Cancel { reason }).await {
            debug!(key = %xfer.key(), error = %e, "could not notify peer of cancellation");
        }
    }
}

/// Checks the receiver's answer against what was offered. The tiers are
/// walked in fallback order regardless of how the peer listed them.
fn check_accepted(offered: &[Method], accepted: &[Method]) -> Result<Vec<Method>, TransferError> {
    if let Some(extra) = accepted.iter().find(|m| !offered.contains(*m)) {
        return Err(TransferError::Remote(format!("peer accepted unoffered method {extra}")));
    }
    let methods = agree_methods(offered, accepted);
    if methods.is_empty() {
        return Err(TransferError::Remote("peer accepted no transport method".into()));
    }
    Ok(methods)
}

impl XferOps for FallbackNegotiator {
    fn init<'a>(&'a self, xfer: &'a Arc<Xfer>) -> OpsFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            let methods = match xfer.xfer_type() {
                XferType::Send => self.offer(xfer).await?,
                XferType::Receive => self.accept(xfer).await?,
            };
            self.walk(xfer, &methods).await
        })
    }

    fn read<'a>(
        &'a self,
        xfer: &'a Arc<Xfer>,
        buf: &'a mut [u8],
    ) -> OpsFuture<'a, Result<usize, TransferError>> {
        Box::pin(async move {
            let tier = self.active().ok_or(TransferError::Cancelled)?;
            tier.read(xfer, buf).await
        })
    }

    fn write<'a>(
        &'a self,
        xfer: &'a Arc<Xfer>,
        data: &'a [u8],
    ) -> OpsFuture<'a, Result<usize, TransferError>> {
        Box::pin(async move {
            let tier = self.active().ok_or(TransferError::Cancelled)?;
            tier.write(xfer, data).await
        })
    }

    fn ack<'a>(
        &'a self,
        xfer: &'a Arc<Xfer>,
        data: &'a [u8],
    ) -> OpsFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            match self.active() {
                Some(tier) => tier.ack(xfer, data).await,
                None => Ok(()),
            }
        })
    }

    fn end<'a>(&'a self, xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()> {
        Box::pin(async move {
            let tier = self.lock_active().take();
            if let Some(tier) = tier {
                tier.end(xfer).await;
            }
        })
    }

    fn cancel_send<'a>(&'a self, xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()> {
        Box::pin(async move {
            self.notify_cancel(xfer).await;
            let tier = self.lock_active().take();
            if let Some(tier) = tier {
                tier.cancel_send(xfer).await;
            }
        })
    }

    fn cancel_recv<'a>(&'a self, xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()> {
        Box::pin(async move {
            self.notify_cancel(xfer).await;
            let tier = self.lock_active().take();
            if let Some(tier) = tier {
                tier.cancel_recv(xfer).await;
            }
        })
    }

    fn request_denied<'a>(&'a self, xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()> {
        Box::pin(async move {
            if !self.answered.load(Ordering::SeqCst) {
                info!(key = %xfer.key(), "declining offer");
                if let Err(e) = self.ctx.signal(xfer, SignalMessage::Decline).await {
                    debug!(key = %xfer.key(), error = %e, "could not send decline");
                }
                return;
            }

            // The peer is already negotiating a tier and ignores Decline.
            info!(key = %xfer.key(), "refusing accepted transfer");
            let reason = REFUSED.to_string();
            if let Err(e) = self.ctx.signal(xfer, SignalMessage::Cancel { reason }).await {
                debug!(key = %xfer.key(), error = %e, "could not notify peer of refusal");
            }
            let tier = self.lock_active().take();
            if let Some(tier) = tier {
                match xfer.xfer_type() {
                    XferType::Send => tier.cancel_send(xfer).await,
                    XferType::Receive => tier.cancel_recv(xfer).await,
                }
            }
        })
    }
}
