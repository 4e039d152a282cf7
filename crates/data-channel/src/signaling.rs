//! The existing IM session channel, as seen by the negotiators.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use peerxfer_protocol::{Envelope, SessionKey, SignalMessage};
use peerxfer_transfer::Xfer;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::DataChannelError;

pub type SignalFuture<'a> = Pin<Box<dyn Future<Output = Result<(), DataChannelError>> + Send + 'a>>;

/// Delivers envelopes to other peers.
pub trait SignalingChannel: Send + Sync {
    fn send(&self, envelope: Envelope) -> SignalFuture<'_>;
}

/// Sends messages on behalf of one local identity.
#[derive(Clone)]
pub struct Signaler {
    local_jid: String,
    channel: Arc<dyn SignalingChannel>,
}

impl Signaler {
    pub fn new(local_jid: impl Into<String>, channel: Arc<dyn SignalingChannel>) -> Self {
        Self {
            local_jid: local_jid.into(),
            channel,
        }
    }

    pub fn local_jid(&self) -> &str {
        &self.local_jid
    }

    /// Sends `message` to the peer of `xfer`.
    pub async fn send(&self, xfer: &Xfer, message: SignalMessage) -> Result<(), DataChannelError> {
        trace!(key = %xfer.key(), kind = message.kind(), "signal out");
        let envelope = Envelope::new(xfer.session_id(), &self.local_jid, xfer.peer(), message);
        self.channel.send(envelope).await
    }

    /// Sends `message` for a session that has no local transfer, such as a
    /// refused offer.
    pub async fn reply(&self, key: &SessionKey, message: SignalMessage) -> Result<(), DataChannelError> {
        trace!(%key, kind = message.kind(), "signal out");
        let envelope = Envelope::new(&key.session_id, &self.local_jid, &key.peer, message);
        self.channel.send(envelope).await
    }
}

type Filter = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// In-process signaling between named endpoints.
///
/// Every envelope is serialized to JSON and parsed back on delivery, so
/// peers only ever see what survives the wire format.
#[derive(Clone, Default)]
pub struct SignalingHub {
    inner: Arc<Mutex<HubInner>>,
}

#[derive(Default)]
struct HubInner {
    peers: HashMap<String, mpsc::UnboundedSender<Envelope>>,
    history: Vec<Envelope>,
    filter: Option<Filter>,
}

impl SignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches `jid`, returning its sending half and its inbox.
    pub fn connect(&self, jid: &str) -> (HubChannel, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().peers.insert(jid.to_string(), tx);
        (HubChannel { hub: self.clone() }, rx)
    }

    pub fn disconnect(&self, jid: &str) {
        self.lock().peers.remove(jid);
    }

    /// Drops every envelope for which `keep` returns `false`.
    pub fn set_filter(&self, keep: impl Fn(&Envelope) -> bool + Send + Sync + 'static) {
        self.lock().filter = Some(Arc::new(keep));
    }

    /// Every envelope delivered so far, in order.
    pub fn history(&self) -> Vec<Envelope> {
        self.lock().history.clone()
    }

    fn deliver(&self, envelope: Envelope) -> Result<(), DataChannelError> {
        let json = envelope.to_json()?;
        let envelope = Envelope::from_json(&json)?;

        let mut inner = self.lock();
        if let Some(keep) = &inner.filter {
            if !keep(&envelope) {
                debug!(to = %envelope.to, kind = envelope.message.kind(), "signal dropped by filter");
                return Ok(());
            }
        }
        let tx = inner
            .peers
            .get(&envelope.to)
            .cloned()
            .ok_or_else(|| DataChannelError::Signaling(format!("{} is offline", envelope.to)))?;
        inner.history.push(envelope.clone());
        tx.send(envelope)
            .map_err(|_| DataChannelError::Signaling("peer inbox closed".into()))
    }
}

/// A peer's handle on a [`SignalingHub`].
#[derive(Clone)]
pub struct HubChannel {
    hub: SignalingHub,
}

impl SignalingChannel for HubChannel {
    fn send(&self, envelope: Envelope) -> SignalFuture<'_> {
        let result = self.hub.deliver(envelope);
        Box::pin(async move { result })
    }
}
