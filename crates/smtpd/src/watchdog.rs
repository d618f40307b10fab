//! Per-connection idle timer.
//!
//! The watchdog holds a deadline that the connection pushes forward
//! each time it makes progress. If the deadline passes, the
//! connection's cancellation token is cancelled; the connection
//! notices at its next suspension point and closes. Cancellation is
//! idempotent, so expiry racing normal completion is harmless.
use crate::metrics::WATCHDOG_EXPIRED;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct Watchdog {
    deadline: watch::Sender<Option<Instant>>,
    expired: Arc<AtomicBool>,
    timeout: Duration,
    task: JoinHandle<()>,
}

impl Watchdog {
    /// Start the timer. `token` is cancelled if `timeout` elapses
    /// without a call to `reset`.
    pub fn arm(token: CancellationToken, timeout: Duration) -> Self {
        let (deadline, mut rx) = watch::channel(Some(Instant::now() + timeout));
        let expired = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn({
            let expired = expired.clone();
            async move {
                loop {
                    let current = *rx.borrow_and_update();
                    match current {
                        None => {
                            if rx.changed().await.is_err() {
                                return;
                            }
                        }
                        Some(when) => {
                            tokio::select! {
                                _ = tokio::time::sleep_until(when) => {
                                    if *rx.borrow() != Some(when) {
                                        continue;
                                    }
                                    expired.store(true, Ordering::SeqCst);
                                    WATCHDOG_EXPIRED.inc();
                                    tracing::info!("connection idle for {timeout:?}, closing");
                                    token.cancel();
                                    return;
                                }
                                changed = rx.changed() => {
                                    if changed.is_err() {
                                        return;
                                    }
                                }
                                _ = token.cancelled() => {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });

        Self {
            deadline,
            expired,
            timeout,
            task,
        }
    }

    /// Record progress, pushing the deadline forward
    pub fn reset(&self) {
        self.deadline
            .send_replace(Some(Instant::now() + self.timeout));
    }

    /// Stop the timer until the next `reset`
    pub fn disarm(&self) {
        self.deadline.send_replace(None);
    }

    pub fn has_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.task.abort();
    }
}
