//! Protocol-agnostic file-transfer core.
//!
//! An [`Xfer`] walks the lifecycle `NotStarted → Accepted → Started → Done`
//! (or one of the cancel states) while a negotiator implementing
//! [`XferOps`] establishes the transport. Once the negotiator calls
//! [`Xfer::start`], the core pumps bytes between local storage and either
//! the handed-over socket or the negotiator's `read`/`write` hooks.

mod ops;
mod progress;
mod pump;
mod queue;
mod registry;
mod storage;
#[cfg(test)]
mod test_support;
mod timer;
mod types;
mod ui;
mod validation;
mod watcher;
mod xfer;

pub use ops::{OpsFuture, XferOps};
pub use progress::SpeedCalculator;
pub use queue::{BoundedQueue, ByteRing, QueueFull};
pub use registry::{RegistryStats, TransferRegistry};
pub use storage::{DiskStorage, LocalReader, LocalStorage, LocalWriter, MemoryStorage};
pub use timer::{LivenessTimer, with_deadline};
pub use types::{Thumbnail, XferStatus, XferType};
pub use ui::{NullUi, XferUiOps};
pub use validation::{local_path_for, validate_remote_filename};
pub use watcher::{AsyncStream, BoxedStream, Interest, Watcher};
pub use xfer::{Transport, Xfer, XferContext};

use peerxfer_protocol::SessionKey;

/// Default size of one pump iteration: 8 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Errors produced by the transfer core and reported by negotiator hooks.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("cannot {action} a transfer that is {status}")]
    InvalidState {
        action: &'static str,
        status: XferStatus,
    },

    #[error("session {0} already has a live transfer")]
    KeyInUse(SessionKey),

    #[error("peer error: {0}")]
    Remote(String),

    #[error("local error: {0}")]
    Local(String),

    #[error("transport failed: {0}")]
    TransportFailed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("declined by peer")]
    Declined,

    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),

    #[error("cancelled")]
    Cancelled,
}

impl TransferError {
    /// Whether the peer is presumed at fault (the transfer ends as
    /// cancel-remote rather than cancel-local).
    pub fn is_remote_fault(&self) -> bool {
        matches!(
            self,
            TransferError::Io(_)
                | TransferError::Remote(_)
                | TransferError::Timeout(_)
                | TransferError::Declined
        )
    }
}
