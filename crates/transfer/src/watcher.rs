//! Readiness-driven I/O tasks owned by a transfer.

use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A bidirectional byte stream (TCP socket, in-memory pipe).
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Which readiness the watcher waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// A registered I/O task.
///
/// The task receives a child of the owner's cancellation token and owns
/// whatever socket it drives; deregistering cancels the token and waits for
/// the task to unwind, which closes the socket.
pub struct Watcher {
    interest: Interest,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Watcher {
    pub fn register<F, Fut>(interest: Interest, parent: &CancellationToken, callback: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = parent.child_token();
        let handle = tokio::spawn(callback(token.clone()));
        Self {
            interest,
            token,
            handle,
        }
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancels the task and waits until it has released its resources.
    ///
    /// Must not be awaited from inside the watcher's own task.
    pub async fn deregister(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                warn!(interest = ?self.interest, "watcher task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn deregister_waits_for_unwind() {
        let parent = CancellationToken::new();
        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let watcher = Watcher::register(Interest::Read, &parent, move |token| async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });
        assert!(watcher.is_active());
        watcher.deregister().await;
        assert!(released.load(Ordering::SeqCst));
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn parent_cancel_reaches_task() {
        let parent = CancellationToken::new();
        let watcher = Watcher::register(Interest::Write, &parent, |token| async move {
            token.cancelled().await;
        });
        parent.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), watcher.handle)
            .await
            .unwrap()
            .unwrap();
    }
}
