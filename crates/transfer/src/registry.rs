use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use peerxfer_protocol::{Envelope, SessionKey};
use tracing::{debug, warn};

use crate::{Xfer, XferStatus};

/// Derived counters for display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Registered transfers that are not finished.
    pub active: usize,
    /// Of those, transfers currently moving bytes.
    pub started: usize,
    pub bytes_transferred: u64,
    /// Bytes still to move for started transfers of known size.
    pub bytes_in_flight: u64,
}

/// Live transfers of one account, keyed by session id and peer.
///
/// Holds weak references only: the negotiator driving a transfer owns it,
/// and the core's teardown removes the entry.
#[derive(Clone, Default)]
pub struct TransferRegistry {
    inner: Arc<RwLock<HashMap<SessionKey, Weak<Xfer>>>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `xfer` under its key. Registering the same transfer again is
    /// a no-op; returns `false` if a different live transfer holds the key.
    pub fn register(&self, xfer: &Arc<Xfer>) -> bool {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.retain(|_, weak| weak.strong_count() > 0);

        if let Some(existing) = map.get(xfer.key()).and_then(Weak::upgrade) {
            if Arc::ptr_eq(&existing, xfer) {
                return true;
            }
            if !existing.status().is_terminal() {
                warn!(key = %xfer.key(), "session key already in use by another transfer");
                return false;
            }
        }
        map.insert(xfer.key().clone(), Arc::downgrade(xfer));
        debug!(key = %xfer.key(), "transfer registered");
        true
    }

    /// Finds a live transfer. Finished or dropped transfers are never returned.
    pub fn lookup(&self, key: &SessionKey) -> Option<Arc<Xfer>> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.get(key)
            .and_then(Weak::upgrade)
            .filter(|xfer| !xfer.status().is_terminal())
    }

    /// Removes `xfer` if it is the transfer registered under its key.
    pub(crate) fn unregister(&self, xfer: &Xfer) -> bool {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let owned = map
            .get(xfer.key())
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), xfer));
        if owned {
            map.remove(xfer.key());
            debug!(key = %xfer.key(), "transfer unregistered");
        }
        owned
    }

    /// Routes a signaling envelope to its transfer.
    ///
    /// Returns `false` for stale replies (unknown or finished transfer); those
    /// are logged and dropped without touching any state.
    pub fn dispatch(&self, envelope: Envelope) -> bool {
        let key = envelope.key();
        match self.lookup(&key) {
            Some(xfer) => xfer.deliver(envelope.message),
            None => {
                debug!(%key, kind = envelope.message.kind(), "discarding signal for unknown transfer");
                false
            }
        }
    }

    /// Every live transfer.
    pub fn transfers(&self) -> Vec<Arc<Xfer>> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.values()
            .filter_map(Weak::upgrade)
            .filter(|xfer| !xfer.status().is_terminal())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.transfers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        self.transfers()
            .iter()
            .fold(RegistryStats::default(), |mut stats, xfer| {
                stats.active += 1;
                stats.bytes_transferred += xfer.bytes_sent();
                if xfer.status() == XferStatus::Started {
                    stats.started += 1;
                    stats.bytes_in_flight += xfer.bytes_remaining();
                }
                stats
            })
    }

    /// Cancels every live transfer locally.
    pub async fn shutdown(&self) {
        for xfer in self.transfers() {
            xfer.cancel_local().await;
        }
    }
}
