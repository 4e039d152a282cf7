//! One account's transfers, driven from its signaling inbox.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use peerxfer_protocol::{Envelope, FileOffer, Method, SessionKey, SignalMessage, agree_methods};
use peerxfer_transfer::{
    TransferError, TransferRegistry, Xfer, XferContext, XferType, local_path_for,
    validate_remote_filename,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::NegotiatorContext;
use crate::fallback::FallbackNegotiator;

/// Creates outgoing transfers and turns incoming offers into transfers.
///
/// The session keeps every unfinished transfer alive; the registry only
/// holds weak references.
pub struct TransferSession {
    xfers: XferContext,
    negotiators: NegotiatorContext,
    live: Mutex<Vec<Arc<Xfer>>>,
}

impl TransferSession {
    pub fn new(xfers: XferContext, negotiators: NegotiatorContext) -> Self {
        let xfers = xfers.with_chunk_size(negotiators.config.chunk_size);
        Self {
            xfers,
            negotiators,
            live: Mutex::new(Vec::new()),
        }
    }

    fn lock_live(&self) -> MutexGuard<'_, Vec<Arc<Xfer>>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, xfer: &Arc<Xfer>) {
        let mut live = self.lock_live();
        live.retain(|x| !x.status().is_terminal());
        live.push(Arc::clone(xfer));
    }

    fn untrack(&self, xfer: &Arc<Xfer>) {
        self.lock_live().retain(|x| !Arc::ptr_eq(x, xfer));
    }

    pub fn local_jid(&self) -> &str {
        self.negotiators.local_jid()
    }

    pub fn registry(&self) -> &TransferRegistry {
        &self.xfers.registry
    }

    /// Unfinished transfers, oldest first.
    pub fn transfers(&self) -> Vec<Arc<Xfer>> {
        let mut live = self.lock_live();
        live.retain(|x| !x.status().is_terminal());
        live.clone()
    }

    /// Offers the file at `path` to `peer`.
    pub async fn send_file(
        &self,
        peer: &str,
        path: impl Into<PathBuf>,
    ) -> Result<Arc<Xfer>, TransferError> {
        let key = SessionKey::new(Uuid::new_v4().to_string(), peer);
        let ops = Arc::new(FallbackNegotiator::new(self.negotiators.clone()));
        let xfer = Xfer::new(&self.xfers, XferType::Send, key, ops);
        xfer.set_local_filename(path);
        self.track(&xfer);
        if let Err(e) = xfer.request().await {
            if matches!(e, TransferError::KeyInUse(_)) {
                self.untrack(&xfer);
            }
            return Err(e);
        }
        Ok(xfer)
    }

    /// Routes one incoming envelope. Returns `false` if it was discarded.
    pub async fn handle_signal(&self, envelope: Envelope) -> bool {
        if envelope.to != self.local_jid() {
            debug!(to = %envelope.to, "discarding signal for another account");
            return false;
        }
        let key = envelope.key();
        match envelope.message {
            SignalMessage::Offer { file, methods } if self.registry().lookup(&key).is_none() => {
                self.incoming_offer(key, file, methods).await
            }
            message => self
                .registry()
                .dispatch(Envelope::new(key.session_id, envelope.from, envelope.to, message)),
        }
    }

    async fn incoming_offer(&self, key: SessionKey, file: FileOffer, methods: Vec<Method>) -> bool {
        info!(%key, name = %file.name, size = file.size, "incoming file offer");
        if let Err(e) = validate_remote_filename(&file.name) {
            warn!(%key, error = %e, "refusing offer with unsafe file name");
            self.decline(&key).await;
            return true;
        }
        let config = &self.negotiators.config;
        if agree_methods(&methods, &config.methods).is_empty() {
            warn!(%key, offered = ?methods, "refusing offer with no common transport");
            self.decline(&key).await;
            return true;
        }

        let ops = Arc::new(FallbackNegotiator::for_offer(self.negotiators.clone(), methods));
        let xfer = Xfer::new(&self.xfers, XferType::Receive, key, ops);
        xfer.set_filename(&file.name);
        xfer.set_size(file.size);
        if !file.description.is_empty() {
            xfer.set_message(file.description);
        }
        if let Some(dir) = &config.download_dir {
            match local_path_for(dir, &file.name) {
                Ok(path) => xfer.set_local_filename(path),
                Err(e) => {
                    warn!(key = %xfer.key(), error = %e, "cannot place incoming file");
                    self.decline(xfer.key()).await;
                    return true;
                }
            }
        }

        self.track(&xfer);
        if let Err(e) = xfer.request().await {
            warn!(key = %xfer.key(), error = %e, "incoming transfer could not start");
            if matches!(e, TransferError::KeyInUse(_)) {
                self.untrack(&xfer);
            }
        }
        true
    }

    async fn decline(&self, key: &SessionKey) {
        if let Err(e) = self.negotiators.signaler.reply(key, SignalMessage::Decline).await {
            debug!(%key, error = %e, "could not send decline");
        }
    }

    /// Handles envelopes until the inbox closes.
    pub async fn serve(&self, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = inbox.recv().await {
            self.handle_signal(envelope).await;
        }
        debug!(jid = %self.local_jid(), "signaling inbox closed");
    }

    /// Cancels every unfinished transfer.
    pub async fn shutdown(&self) {
        let live: Vec<_> = self.lock_live().drain(..).collect();
        for xfer in live {
            xfer.cancel_local().await;
        }
        self.registry().shutdown().await;
    }
}
