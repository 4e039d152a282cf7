use std::sync::Arc;

use crate::Xfer;

/// Observer interface for a presentation layer.
///
/// The core calls these at the matching state transitions. Exactly one of
/// `completed`, `cancel_local` or `cancel_remote` is delivered per transfer.
/// The UI changes a transfer only through its public entry points
/// (`request_accepted`, `request_denied`, `cancel_local`).
pub trait XferUiOps: Send + Sync {
    fn new_xfer(&self, _xfer: &Arc<Xfer>) {}

    fn add_xfer(&self, _xfer: &Arc<Xfer>) {}

    /// An incoming transfer needs a destination; answer with
    /// `request_accepted` or `request_denied`.
    fn ask_receive(&self, _xfer: &Arc<Xfer>) {}

    /// `progress` is in `0.0..=1.0`.
    fn update_progress(&self, _xfer: &Arc<Xfer>, _progress: f64) {}

    fn transport_changed(&self, _xfer: &Arc<Xfer>, _transport: &str) {}

    fn completed(&self, _xfer: &Arc<Xfer>) {}

    fn cancel_local(&self, _xfer: &Arc<Xfer>) {}

    fn cancel_remote(&self, _xfer: &Arc<Xfer>) {}

    fn error(&self, _xfer: &Arc<Xfer>, _message: &str) {}

    fn destroy(&self, _xfer: &Arc<Xfer>) {}
}

/// A UI that ignores every notification.
#[derive(Debug, Default)]
pub struct NullUi;

impl XferUiOps for NullUi {}
