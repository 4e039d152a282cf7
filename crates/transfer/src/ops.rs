//! The contract between the transfer core and a transport negotiator.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::{TransferError, Xfer};

/// A boxed future returned by negotiator hooks.
pub type OpsFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Hooks a negotiator supplies to the core.
///
/// `init` runs once the transfer is accepted and must eventually call
/// [`Xfer::start`]. `read`/`write`/`ack` are only used when the negotiator
/// starts the transfer with [`Transport::Negotiated`](crate::Transport);
/// a handed-over socket is pumped by the core directly.
///
/// Hooks report failures through their return value. They must not call
/// `cancel_local`/`cancel_remote` on the transfer they are serving: the core
/// owns teardown and never invokes another hook once the transfer is
/// terminal.
pub trait XferOps: Send + Sync {
    /// Performs whatever handshake is needed, then calls `start`.
    fn init<'a>(&'a self, xfer: &'a Arc<Xfer>) -> OpsFuture<'a, Result<(), TransferError>>;

    /// Fills `buf` with received bytes. `Ok(0)` means end of stream.
    fn read<'a>(
        &'a self,
        _xfer: &'a Arc<Xfer>,
        _buf: &'a mut [u8],
    ) -> OpsFuture<'a, Result<usize, TransferError>> {
        Box::pin(async { Err(TransferError::Unsupported("read")) })
    }

    /// Sends bytes, returning how many were accepted.
    fn write<'a>(
        &'a self,
        _xfer: &'a Arc<Xfer>,
        _data: &'a [u8],
    ) -> OpsFuture<'a, Result<usize, TransferError>> {
        Box::pin(async { Err(TransferError::Unsupported("write")) })
    }

    /// Called after each chunk has been consumed by the core.
    fn ack<'a>(
        &'a self,
        _xfer: &'a Arc<Xfer>,
        _data: &'a [u8],
    ) -> OpsFuture<'a, Result<(), TransferError>> {
        Box::pin(async { Ok(()) })
    }

    /// Normal completion: release resources, notify the peer if needed.
    fn end<'a>(&'a self, xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()>;

    /// Teardown of a cancelled outgoing transfer.
    fn cancel_send<'a>(&'a self, xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()>;

    /// Teardown of a cancelled incoming transfer.
    fn cancel_recv<'a>(&'a self, xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()>;

    /// The local user refused an incoming offer.
    fn request_denied<'a>(&'a self, _xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()> {
        Box::pin(async {})
    }
}
