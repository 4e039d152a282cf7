//! Cancellable timers tied to the operation they guard.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::TransferError;

/// Fires once no activity has been recorded for a full window.
///
/// Every byte moved in either direction should call [`touch`](Self::touch).
/// The timer task is aborted when the handle is dropped, so the timer can
/// never fire against state that no longer exists.
pub struct LivenessTimer {
    last_activity: Arc<Mutex<Instant>>,
    expired: CancellationToken,
    window: Duration,
    task: JoinHandle<()>,
}

impl LivenessTimer {
    /// Starts the timer; the window begins now.
    pub fn start(window: Duration) -> Self {
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let expired = CancellationToken::new();

        let task = tokio::spawn({
            let last_activity = Arc::clone(&last_activity);
            let expired = expired.clone();
            async move {
                loop {
                    let deadline = *last_activity.lock().unwrap_or_else(PoisonError::into_inner)
                        + window;
                    tokio::time::sleep_until(deadline).await;
                    let last = *last_activity.lock().unwrap_or_else(PoisonError::into_inner);
                    if last + window <= Instant::now() {
                        expired.cancel();
                        break;
                    }
                }
            }
        });

        Self {
            last_activity,
            expired,
            window,
            task,
        }
    }

    /// Records activity, pushing the deadline one window into the future.
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_expired(&self) -> bool {
        self.expired.is_cancelled()
    }

    /// Resolves when the window elapses without activity.
    pub fn expired(&self) -> WaitForCancellationFuture<'_> {
        self.expired.cancelled()
    }

    /// Stops the timer without firing it.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for LivenessTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Runs `fut` with a deadline, mapping expiry to [`TransferError::Timeout`].
pub async fn with_deadline<F: Future>(
    what: &str,
    duration: Duration,
    fut: F,
) -> Result<F::Output, TransferError> {
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| TransferError::Timeout(format!("{what} after {}s", duration.as_secs())))
}
