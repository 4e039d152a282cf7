//! Recording doubles shared by the crate's unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;

use crate::{
    BoxedStream, MemoryStorage, OpsFuture, TransferError, TransferRegistry, Transport, Xfer,
    XferContext, XferOps, XferUiOps,
};

#[derive(Default)]
pub(crate) struct RecordingUi {
    events: Mutex<Vec<String>>,
    progress: Mutex<Vec<f64>>,
    notify: Notify,
}

impl RecordingUi {
    fn push(&self, event: &str) {
        self.events.lock().unwrap().push(event.to_string());
        self.notify.notify_waiters();
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|e| *e == event).count()
    }

    pub fn progress(&self) -> Vec<f64> {
        self.progress.lock().unwrap().clone()
    }

    pub async fn wait_for(&self, event: &str) {
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                let notified = self.notify.notified();
                if self.count(event) > 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {event}"));
    }
}

impl XferUiOps for RecordingUi {
    fn new_xfer(&self, _xfer: &Arc<Xfer>) {
        self.push("new_xfer");
    }
    fn add_xfer(&self, _xfer: &Arc<Xfer>) {
        self.push("add_xfer");
    }
    fn ask_receive(&self, _xfer: &Arc<Xfer>) {
        self.push("ask_receive");
    }
    fn update_progress(&self, _xfer: &Arc<Xfer>, progress: f64) {
        self.progress.lock().unwrap().push(progress);
    }
    fn completed(&self, _xfer: &Arc<Xfer>) {
        self.push("completed");
    }
    fn cancel_local(&self, _xfer: &Arc<Xfer>) {
        self.push("cancel_local");
    }
    fn cancel_remote(&self, _xfer: &Arc<Xfer>) {
        self.push("cancel_remote");
    }
    fn error(&self, _xfer: &Arc<Xfer>, _message: &str) {
        self.push("error");
    }
    fn destroy(&self, _xfer: &Arc<Xfer>) {
        self.push("destroy");
    }
}

/// Hands a prepared socket to the core, or waits for cancellation when it
/// has none.
#[derive(Default)]
pub(crate) struct SocketOps {
    stream: Mutex<Option<BoxedStream>>,
    calls: Mutex<Vec<&'static str>>,
}

impl SocketOps {
    pub fn new(stream: Option<BoxedStream>) -> Arc<Self> {
        Arc::new(Self {
            stream: Mutex::new(stream),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

impl XferOps for SocketOps {
    fn init<'a>(&'a self, xfer: &'a Arc<Xfer>) -> OpsFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            self.record("init");
            let stream = self.stream.lock().unwrap().take();
            match stream {
                Some(stream) => xfer.start(Transport::Socket(stream), None).await,
                None => {
                    xfer.cancellation().cancelled().await;
                    Err(TransferError::Cancelled)
                }
            }
        })
    }

    fn end<'a>(&'a self, _xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()> {
        Box::pin(async move { self.record("end") })
    }

    fn cancel_send<'a>(&'a self, _xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()> {
        Box::pin(async move { self.record("cancel_send") })
    }

    fn cancel_recv<'a>(&'a self, _xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()> {
        Box::pin(async move { self.record("cancel_recv") })
    }

    fn request_denied<'a>(&'a self, _xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()> {
        Box::pin(async move { self.record("request_denied") })
    }
}

/// Moves bytes through the `read`/`write`/`ack` hooks over an in-memory pipe.
pub(crate) struct HookOps {
    stream: tokio::sync::Mutex<DuplexStream>,
    pub acks: Mutex<usize>,
}

impl HookOps {
    pub fn new(stream: DuplexStream) -> Arc<Self> {
        Arc::new(Self {
            stream: tokio::sync::Mutex::new(stream),
            acks: Mutex::new(0),
        })
    }
}

impl XferOps for HookOps {
    fn init<'a>(&'a self, xfer: &'a Arc<Xfer>) -> OpsFuture<'a, Result<(), TransferError>> {
        Box::pin(async move { xfer.start(Transport::Negotiated, None).await })
    }

    fn read<'a>(
        &'a self,
        _xfer: &'a Arc<Xfer>,
        buf: &'a mut [u8],
    ) -> OpsFuture<'a, Result<usize, TransferError>> {
        Box::pin(async move { Ok(self.stream.lock().await.read(buf).await?) })
    }

    fn write<'a>(
        &'a self,
        _xfer: &'a Arc<Xfer>,
        data: &'a [u8],
    ) -> OpsFuture<'a, Result<usize, TransferError>> {
        Box::pin(async move { Ok(self.stream.lock().await.write(data).await?) })
    }

    fn ack<'a>(
        &'a self,
        _xfer: &'a Arc<Xfer>,
        _data: &'a [u8],
    ) -> OpsFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            *self.acks.lock().unwrap() += 1;
            Ok(())
        })
    }

    fn end<'a>(&'a self, _xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()> {
        Box::pin(async move {
            let _ = self.stream.lock().await.shutdown().await;
        })
    }

    fn cancel_send<'a>(&'a self, _xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()> {
        Box::pin(async {})
    }

    fn cancel_recv<'a>(&'a self, _xfer: &'a Arc<Xfer>) -> OpsFuture<'a, ()> {
        Box::pin(async {})
    }
}

pub(crate) fn context(storage: &MemoryStorage) -> (XferContext, Arc<RecordingUi>) {
    let ui = Arc::new(RecordingUi::default());
    let ctx = XferContext::new(TransferRegistry::new(), ui.clone(), Arc::new(storage.clone()));
    (ctx, ui)
}

pub(crate) fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
