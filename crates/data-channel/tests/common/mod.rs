//! Two-peer harness: sessions wired through a signaling hub and a network.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use peerxfer_data_channel::{
    MemoryNetwork, NegotiationConfig, NegotiatorContext, Network, Signaler, SignalingHub,
    TransferSession,
};
use peerxfer_transfer::{
    LocalStorage, MemoryStorage, TransferRegistry, Xfer, XferContext, XferUiOps,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub const ALICE: &str = "alice@example.com/laptop";
pub const BOB: &str = "bob@example.com/desk";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Negotiation settings for a peer listening on `ip`.
pub fn config(ip: &str) -> NegotiationConfig {
    NegotiationConfig {
        listen_host: ip.into(),
        ..Default::default()
    }
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[derive(Default)]
pub struct RecordingUi {
    events: Mutex<Vec<String>>,
    progress: Mutex<Vec<f64>>,
    asked: Mutex<Vec<Arc<Xfer>>>,
    notify: Notify,
}

impl RecordingUi {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
        self.notify.notify_waiters();
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|e| *e == event).count()
    }

    pub fn progress(&self) -> Vec<f64> {
        self.progress.lock().unwrap().clone()
    }

    /// Incoming transfers waiting for a local decision.
    pub fn asked(&self) -> Vec<Arc<Xfer>> {
        self.asked.lock().unwrap().clone()
    }

    pub async fn wait_for(&self, event: &str) {
        tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                let notified = self.notify.notified();
                if self.count(event) > 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {event}; saw {:?}", self.events()));
    }
}

impl XferUiOps for RecordingUi {
    fn add_xfer(&self, _xfer: &Arc<Xfer>) {
        self.push("add_xfer".into());
    }
    fn ask_receive(&self, xfer: &Arc<Xfer>) {
        self.asked.lock().unwrap().push(Arc::clone(xfer));
        self.push("ask_receive".into());
    }
    fn update_progress(&self, _xfer: &Arc<Xfer>, progress: f64) {
        self.progress.lock().unwrap().push(progress);
    }
    fn transport_changed(&self, _xfer: &Arc<Xfer>, transport: &str) {
        self.push(format!("transport:{transport}"));
    }
    fn completed(&self, _xfer: &Arc<Xfer>) {
        self.push("completed".into());
    }
    fn cancel_local(&self, _xfer: &Arc<Xfer>) {
        self.push("cancel_local".into());
    }
    fn cancel_remote(&self, _xfer: &Arc<Xfer>) {
        self.push("cancel_remote".into());
    }
    fn error(&self, _xfer: &Arc<Xfer>, _message: &str) {
        self.push("error".into());
    }
    fn destroy(&self, _xfer: &Arc<Xfer>) {
        self.push("destroy".into());
    }
}

pub struct Peer {
    pub session: Arc<TransferSession>,
    pub ui: Arc<RecordingUi>,
    serve: JoinHandle<()>,
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.serve.abort();
    }
}

/// Attaches `jid` to `hub` and serves its inbox.
pub fn spawn_peer(
    hub: &SignalingHub,
    jid: &str,
    config: NegotiationConfig,
    network: Arc<dyn Network>,
    storage: Arc<dyn LocalStorage>,
) -> Peer {
    let (channel, inbox) = hub.connect(jid);
    let signaler = Signaler::new(jid, Arc::new(channel));
    let negotiators = NegotiatorContext::new(signaler, network, config);
    let ui = Arc::new(RecordingUi::default());
    let xfers = XferContext::new(
        TransferRegistry::new(),
        Arc::clone(&ui) as Arc<dyn XferUiOps>,
        storage,
    );
    let session = Arc::new(TransferSession::new(xfers, negotiators));
    let serve = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.serve(inbox).await }
    });
    Peer { session, ui, serve }
}

/// Peers on one in-memory network.
#[derive(Default)]
pub struct World {
    pub hub: SignalingHub,
    pub network: MemoryNetwork,
}

impl World {
    pub fn new() -> Self {
        init_tracing();
        Self::default()
    }

    pub fn peer(&self, jid: &str, config: NegotiationConfig, storage: &MemoryStorage) -> Peer {
        spawn_peer(
            &self.hub,
            jid,
            config,
            Arc::new(self.network.clone()),
            Arc::new(storage.clone()),
        )
    }
}
