//! The transfer entity and its state machine.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use peerxfer_protocol::{SessionKey, SignalMessage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::ops::XferOps;
use crate::progress::SpeedCalculator;
use crate::pump::{self, LocalIo, PumpIo};
use crate::registry::TransferRegistry;
use crate::storage::LocalStorage;
use crate::types::{Thumbnail, XferStatus, XferType};
use crate::ui::XferUiOps;
use crate::watcher::{BoxedStream, Interest, Watcher};
use crate::{DEFAULT_CHUNK_SIZE, TransferError};

/// Collaborators shared by every transfer of one account.
#[derive(Clone)]
pub struct XferContext {
    pub registry: TransferRegistry,
    pub ui: Arc<dyn XferUiOps>,
    pub storage: Arc<dyn LocalStorage>,
    pub chunk_size: usize,
}

impl XferContext {
    pub fn new(
        registry: TransferRegistry,
        ui: Arc<dyn XferUiOps>,
        storage: Arc<dyn LocalStorage>,
    ) -> Self {
        Self {
            registry,
            ui,
            storage,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

/// How bytes move once a transfer is started.
pub enum Transport {
    /// The core pumps this socket directly.
    Socket(BoxedStream),
    /// The negotiator moves bytes through its `read`/`write` hooks.
    Negotiated,
}

/// Which negotiator hook teardown runs.
#[derive(Debug, Clone, Copy)]
enum Teardown {
    End,
    Denied,
    Cancel,
}

/// A single file transfer.
///
/// Shared as `Arc<Xfer>` between the negotiator driving it and the tasks it
/// spawns; the registry only keeps a weak reference. All mutable state lives
/// behind one lock that is never held across an await.
pub struct Xfer {
    key: SessionKey,
    xfer_type: XferType,
    ctx: XferContext,
    cancel: CancellationToken,
    inbox: SignalInbox,
    speed: SpeedCalculator,
    inner: Mutex<XferInner>,
}

struct XferInner {
    status: XferStatus,
    tearing_down: bool,
    filename: String,
    local_filename: Option<PathBuf>,
    size: u64,
    bytes_sent: u64,
    completed: bool,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    remote_addr: Option<SocketAddr>,
    message: Option<String>,
    thumbnail: Option<Thumbnail>,
    transport: Option<String>,
    transport_history: Vec<String>,
    watcher: Option<Watcher>,
    ops: Option<Arc<dyn XferOps>>,
}

impl Xfer {
    /// Creates a transfer in `NotStarted`. It is registered on `request`.
    pub fn new(
        ctx: &XferContext,
        xfer_type: XferType,
        key: SessionKey,
        ops: Arc<dyn XferOps>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let xfer = Arc::new(Self {
            key,
            xfer_type,
            ctx: ctx.clone(),
            cancel: CancellationToken::new(),
            inbox: SignalInbox {
                tx,
                state: tokio::sync::Mutex::new(InboxState {
                    rx,
                    stash: VecDeque::new(),
                }),
            },
            speed: SpeedCalculator::default(),
            inner: Mutex::new(XferInner {
                status: XferStatus::NotStarted,
                tearing_down: false,
                filename: String::new(),
                local_filename: None,
                size: 0,
                bytes_sent: 0,
                completed: false,
                start_time: None,
                end_time: None,
                remote_addr: None,
                message: None,
                thumbnail: None,
                transport: None,
                transport_history: Vec::new(),
                watcher: None,
                ops: Some(ops),
            }),
        });
        xfer.ctx.ui.new_xfer(&xfer);
        xfer
    }

    fn lock(&self) -> MutexGuard<'_, XferInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- accessors ---------------------------------------------------------

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn session_id(&self) -> &str {
        &self.key.session_id
    }

    /// Identity of the remote peer.
    pub fn peer(&self) -> &str {
        &self.key.peer
    }

    pub fn xfer_type(&self) -> XferType {
        self.xfer_type
    }

    pub fn status(&self) -> XferStatus {
        self.lock().status
    }

    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }

    pub fn filename(&self) -> String {
        self.lock().filename.clone()
    }

    pub fn local_filename(&self) -> Option<PathBuf> {
        self.lock().local_filename.clone()
    }

    /// Total size in bytes; 0 while unknown.
    pub fn size(&self) -> u64 {
        self.lock().size
    }

    pub fn bytes_sent(&self) -> u64 {
        self.lock().bytes_sent
    }

    pub fn bytes_remaining(&self) -> u64 {
        let inner = self.lock();
        inner.size.saturating_sub(inner.bytes_sent)
    }

    /// Fraction transferred in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        let inner = self.lock();
        progress_of(&inner)
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.lock().start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.lock().end_time
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.lock().remote_addr
    }

    pub fn message(&self) -> Option<String> {
        self.lock().message.clone()
    }

    pub fn thumbnail(&self) -> Option<Thumbnail> {
        self.lock().thumbnail.clone()
    }

    /// Label of the transport tier currently in use.
    pub fn transport(&self) -> Option<String> {
        self.lock().transport.clone()
    }

    /// Every tier tried, in order.
    pub fn transport_history(&self) -> Vec<String> {
        self.lock().transport_history.clone()
    }

    /// Current speed in bytes/second.
    pub fn speed(&self) -> f64 {
        self.speed.bytes_per_second()
    }

    pub fn eta(&self) -> Option<Duration> {
        self.speed.eta(self.bytes_remaining())
    }

    pub fn chunk_size(&self) -> usize {
        self.ctx.chunk_size
    }

    /// Token cancelled when teardown begins. Negotiators select on it while
    /// waiting for the peer.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn ops(&self) -> Option<Arc<dyn XferOps>> {
        self.lock().ops.clone()
    }

    // -- setters -----------------------------------------------------------

    pub fn set_size(&self, size: u64) {
        let mut inner = self.lock();
        inner.size = size;
        if size > 0 {
            inner.bytes_sent = inner.bytes_sent.min(size);
        }
    }

    pub fn set_filename(&self, filename: impl Into<String>) {
        self.lock().filename = filename.into();
    }

    pub fn set_local_filename(&self, path: impl Into<PathBuf>) {
        self.lock().local_filename = Some(path.into());
    }

    pub fn set_message(&self, message: impl Into<String>) {
        self.lock().message = Some(message.into());
    }

    pub fn set_thumbnail(&self, thumbnail: Option<Thumbnail>) {
        self.lock().thumbnail = thumbnail;
    }

    /// Records the transport tier now being attempted.
    pub fn set_transport(self: &Arc<Self>, label: &str) {
        {
            let mut inner = self.lock();
            inner.transport = Some(label.to_string());
            inner.transport_history.push(label.to_string());
        }
        debug!(key = %self.key, transport = label, "transport selected");
        self.ctx.ui.transport_changed(self, label);
    }

    /// Marks the transfer as fully delivered (or not). Used by transports
    /// that learn the end of data out of band.
    pub fn set_completed(self: &Arc<Self>, completed: bool) {
        let progress = {
            let mut inner = self.lock();
            inner.completed = completed;
            progress_of(&inner)
        };
        if completed {
            self.ctx.ui.update_progress(self, progress);
        }
    }

    // -- lifecycle ---------------------------------------------------------

    /// Moves a new transfer into negotiation.
    ///
    /// Sends need a local filename. Receives without one ask the UI and stay
    /// `NotStarted` until `request_accepted` or `request_denied`.
    pub async fn request(self: &Arc<Self>) -> Result<(), TransferError> {
        let local = {
            let inner = self.lock();
            if inner.status != XferStatus::NotStarted {
                return Err(TransferError::InvalidState {
                    action: "request",
                    status: inner.status,
                });
            }
            inner.local_filename.clone()
        };

        if !self.ctx.registry.register(self) {
            return Err(TransferError::KeyInUse(self.key.clone()));
        }
        self.ctx.ui.add_xfer(self);

        match (self.xfer_type, local) {
            (_, Some(path)) => self.request_accepted(path).await,
            (XferType::Send, None) => {
                let err = TransferError::InvalidPath("no local file to send".into());
                self.fail(TransferError::Local(err.to_string())).await;
                Err(err)
            }
            (XferType::Receive, None) => {
                info!(key = %self.key, filename = %self.filename(), "incoming transfer awaiting confirmation");
                self.ctx.ui.ask_receive(self);
                Ok(())
            }
        }
    }

    /// Accepts the transfer with `filename` as the local path and starts the
    /// negotiator's `init` hook.
    pub async fn request_accepted(
        self: &Arc<Self>,
        filename: impl Into<PathBuf>,
    ) -> Result<(), TransferError> {
        let path = filename.into();
        {
            let inner = self.lock();
            if inner.status != XferStatus::NotStarted || inner.tearing_down {
                return Err(TransferError::InvalidState {
                    action: "accept",
                    status: inner.status,
                });
            }
        }

        if self.xfer_type == XferType::Send {
            match self.ctx.storage.size(&path).await {
                Ok(size) => self.set_size(size),
                Err(e) => {
                    let msg = format!("cannot read {}: {e}", path.display());
                    self.fail(TransferError::Local(msg)).await;
                    return Err(e.into());
                }
            }
            if self.filename().is_empty() {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                self.set_filename(name);
            }
        }

        let ops = {
            let mut inner = self.lock();
            if !inner.status.can_transition_to(XferStatus::Accepted) || inner.tearing_down {
                return Err(TransferError::Cancelled);
            }
            inner.status = XferStatus::Accepted;
            inner.local_filename = Some(path);
            inner.ops.clone()
        };
        let Some(ops) = ops else {
            return Err(TransferError::Cancelled);
        };
        debug!(key = %self.key, kind = ?self.xfer_type, "transfer accepted, negotiating");

        let xfer = Arc::clone(self);
        let token = self.cancel.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                result = ops.init(&xfer) => result,
            };
            drop(ops);
            if let Err(e) = result {
                xfer.fail(e).await;
            }
        });
        Ok(())
    }

    /// Refuses an incoming offer. Valid only before the transfer starts.
    pub async fn request_denied(self: &Arc<Self>) -> Result<(), TransferError> {
        {
            let inner = self.lock();
            if !matches!(inner.status, XferStatus::NotStarted | XferStatus::Accepted) {
                return Err(TransferError::InvalidState {
                    action: "deny",
                    status: inner.status,
                });
            }
        }
        info!(key = %self.key, "transfer denied locally");
        self.teardown(XferStatus::CancelLocal, Teardown::Denied).await;
        Ok(())
    }

    /// Hands the transfer to the core. Called by the negotiator once a
    /// transport is established.
    ///
    /// Fails without changing state if the transfer is no longer `Accepted`
    /// or the local file cannot be opened; the negotiator returns that error
    /// from `init`.
    pub async fn start(
        self: &Arc<Self>,
        transport: Transport,
        remote_addr: Option<SocketAddr>,
    ) -> Result<(), TransferError> {
        let path = {
            let inner = self.lock();
            if inner.status != XferStatus::Accepted || inner.tearing_down {
                return Err(TransferError::InvalidState {
                    action: "start",
                    status: inner.status,
                });
            }
            inner
                .local_filename
                .clone()
                .ok_or_else(|| TransferError::InvalidPath("no local filename".into()))?
        };

        let local = match self.xfer_type {
            XferType::Send => self.ctx.storage.open_read(&path).await.map(LocalIo::Source),
            XferType::Receive => self.ctx.storage.create(&path).await.map(LocalIo::Sink),
        };
        let local = local.map_err(|e| {
            TransferError::Local(format!("cannot open {}: {e}", path.display()))
        })?;

        let io = match transport {
            Transport::Socket(stream) => PumpIo::Socket(stream),
            Transport::Negotiated => PumpIo::Hooks,
        };
        let interest = match self.xfer_type {
            XferType::Send => Interest::Write,
            XferType::Receive => Interest::Read,
        };

        {
            let mut inner = self.lock();
            if inner.status != XferStatus::Accepted || inner.tearing_down {
                return Err(TransferError::Cancelled);
            }
            inner.status = XferStatus::Started;
            inner.start_time = Some(Utc::now());
            inner.remote_addr = remote_addr;
            let xfer = Arc::clone(self);
            inner.watcher = Some(Watcher::register(interest, &self.cancel, move |token| {
                pump::run(xfer, io, local, token)
            }));
        }
        info!(
            key = %self.key,
            transport = self.transport().as_deref().unwrap_or("socket"),
            size = self.size(),
            remote = ?remote_addr,
            "transfer started"
        );
        Ok(())
    }

    /// Finishes the transfer. An incomplete transfer is a short delivery
    /// and ends as cancel-remote instead.
    pub async fn end(self: &Arc<Self>) {
        let delivered = {
            let inner = self.lock();
            if inner.status.is_terminal() || inner.tearing_down {
                return;
            }
            inner.status == XferStatus::Started
                && (inner.completed || (inner.size > 0 && inner.bytes_sent >= inner.size))
        };
        if !delivered {
            warn!(key = %self.key, bytes = self.bytes_sent(), size = self.size(), "transfer ended before completion");
            self.set_message("transfer ended before all data arrived");
            self.cancel_remote().await;
            return;
        }
        self.teardown(XferStatus::Done, Teardown::End).await;
    }

    /// Aborts the transfer on behalf of the local user. Idempotent.
    pub async fn cancel_local(self: &Arc<Self>) {
        self.teardown(XferStatus::CancelLocal, Teardown::Cancel).await;
    }

    /// Aborts the transfer because the peer cancelled or misbehaved. Idempotent.
    pub async fn cancel_remote(self: &Arc<Self>) {
        self.teardown(XferStatus::CancelRemote, Teardown::Cancel).await;
    }

    /// Routes a failure to the matching cancel path.
    pub(crate) async fn fail(self: &Arc<Self>, err: TransferError) {
        if self.status().is_terminal() {
            debug!(key = %self.key, error = %err, "ignoring failure of finished transfer");
            return;
        }
        if matches!(err, TransferError::Cancelled) {
            self.cancel_local().await;
            return;
        }
        self.set_message(err.to_string());
        if err.is_remote_fault() {
            warn!(key = %self.key, error = %err, "transfer aborted, peer at fault");
            self.cancel_remote().await;
        } else {
            warn!(key = %self.key, error = %err, "transfer aborted locally");
            self.ctx.ui.error(self, &err.to_string());
            self.cancel_local().await;
        }
    }

    /// Single teardown path for every terminal transition.
    ///
    /// Ownership of the watcher and negotiator is taken under the lock before
    /// anything else runs, so a second caller finds nothing left to release.
    async fn teardown(self: &Arc<Self>, status: XferStatus, kind: Teardown) {
        let (watcher, ops) = {
            let mut inner = self.lock();
            if inner.tearing_down || !inner.status.can_transition_to(status) {
                trace!(key = %self.key, from = ?inner.status, to = ?status, "teardown skipped");
                return;
            }
            inner.tearing_down = true;
            inner.status = status;
            inner.end_time = Some(Utc::now());
            (inner.watcher.take(), inner.ops.take())
        };

        self.cancel.cancel();
        if let Some(watcher) = watcher {
            watcher.deregister().await;
        }

        if let Some(ops) = ops {
            match (kind, self.xfer_type) {
                (Teardown::End, _) => ops.end(self).await,
                (Teardown::Denied, _) => ops.request_denied(self).await,
                (Teardown::Cancel, XferType::Send) => ops.cancel_send(self).await,
                (Teardown::Cancel, XferType::Receive) => ops.cancel_recv(self).await,
            }
        }

        match status {
            XferStatus::Done => {
                info!(key = %self.key, bytes = self.bytes_sent(), "transfer completed");
                self.ctx.ui.completed(self);
            }
            XferStatus::CancelRemote => {
                info!(key = %self.key, reason = ?self.message(), "transfer cancelled by peer");
                self.ctx.ui.cancel_remote(self);
            }
            _ => {
                info!(key = %self.key, "transfer cancelled");
                self.ctx.ui.cancel_local(self);
            }
        }

        self.ctx.registry.unregister(self);
        self.ctx.ui.destroy(self);
    }

    // -- pump support ------------------------------------------------------

    /// Adds `n` transferred bytes and reports progress. Returns `true` once
    /// the known size has been reached.
    pub(crate) fn record_progress(self: &Arc<Self>, n: usize) -> bool {
        let (progress, complete) = {
            let mut inner = self.lock();
            inner.bytes_sent = inner.bytes_sent.saturating_add(n as u64);
            if inner.size > 0 {
                inner.bytes_sent = inner.bytes_sent.min(inner.size);
            }
            let complete = inner.size > 0 && inner.bytes_sent >= inner.size;
            if complete {
                inner.completed = true;
            }
            (progress_of(&inner), complete)
        };
        self.speed.add_sample(n as u64);
        self.ctx.ui.update_progress(self, progress);
        complete
    }

    /// Drops the watcher registration from inside its own task.
    pub(crate) fn watcher_finished(&self) {
        drop(self.lock().watcher.take());
    }

    // -- signaling inbox ---------------------------------------------------

    /// Delivers a signaling message from the peer.
    ///
    /// A `Cancel` aborts the transfer as cancel-remote; everything else is
    /// queued for [`wait_signal`](Self::wait_signal). Returns `false` if the
    /// transfer is already finished.
    pub fn deliver(self: &Arc<Self>, message: SignalMessage) -> bool {
        if self.status().is_terminal() {
            return false;
        }
        if let SignalMessage::Cancel { reason } = message {
            info!(key = %self.key, %reason, "peer cancelled transfer");
            if !reason.is_empty() {
                self.set_message(reason);
            }
            let xfer = Arc::clone(self);
            tokio::spawn(async move { xfer.cancel_remote().await });
            return true;
        }
        self.inbox.tx.send(message).is_ok()
    }

    /// Waits for the next message matching `accept`.
    ///
    /// Messages that do not match are stashed and offered to later calls, so
    /// a peer that is one step ahead never loses a message. Fails with
    /// [`TransferError::Cancelled`] once teardown begins.
    pub async fn wait_signal<F>(&self, mut accept: F) -> Result<SignalMessage, TransferError>
    where
        F: FnMut(&SignalMessage) -> bool,
    {
        let mut guard = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            guard = self.inbox.state.lock() => guard,
        };
        let state = &mut *guard;

        if let Some(pos) = state.stash.iter().position(&mut accept) {
            if let Some(message) = state.stash.remove(pos) {
                return Ok(message);
            }
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                next = state.rx.recv() => next,
            };
            match next {
                Some(message) if accept(&message) => return Ok(message),
                Some(message) => {
                    trace!(key = %self.key, kind = message.kind(), "stashing signal");
                    state.stash.push_back(message);
                }
                None => return Err(TransferError::Cancelled),
            }
        }
    }
}

fn progress_of(inner: &XferInner) -> f64 {
    if inner.size == 0 {
        return if inner.completed { 1.0 } else { 0.0 };
    }
    (inner.bytes_sent as f64 / inner.size as f64).min(1.0)
}

struct SignalInbox {
    tx: mpsc::UnboundedSender<SignalMessage>,
    state: tokio::sync::Mutex<InboxState>,
}

struct InboxState {
    rx: mpsc::UnboundedReceiver<SignalMessage>,
    stash: VecDeque<SignalMessage>,
}

impl std::fmt::Debug for Xfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Xfer")
            .field("key", &self.key)
            .field("type", &self.xfer_type)
            .field("status", &inner.status)
            .field("bytes_sent", &inner.bytes_sent)
            .field("size", &inner.size)
            .finish()
    }
}
