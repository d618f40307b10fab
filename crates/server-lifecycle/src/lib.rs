//! This module helps to manage the life cycle of a service
//! and to shut it down gracefully.
//!
//! A `LifeCycle` is an instance rather than process-global state so
//! that each listener can drain its own connections independently of
//! the process, and so that tests can run several side by side.
//!
//! See <https://tokio.rs/tokio/topics/shutdown> for more information.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc::{Receiver as MPSCReceiver, Sender as MPSCSender};
use tokio::sync::watch::{Receiver as WatchReceiver, Sender as WatchSender};
use uuid::Uuid;

struct Shared {
    name: String,
    active: Mutex<Option<MPSCSender<()>>>,
    labels: Mutex<HashMap<Uuid, String>>,
    shutting_down: AtomicBool,
    stopping_tx: WatchSender<bool>,
    request_shutdown_tx: MPSCSender<()>,
    stop_requested: AtomicBool,
}

/// Represents some activity which cannot be ruthlessly interrupted.
/// Obtain an Activity instance via LifeCycleHandle::activity(). While
/// any Activity instances are alive, LifeCycle::wait_for_idle
/// cannot complete.
pub struct Activity {
    tx: MPSCSender<()>,
    uuid: Uuid,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Activity {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Activity").field("uuid", &self.uuid).finish()
    }
}

impl Clone for Activity {
    fn clone(&self) -> Self {
        let uuid = Uuid::new_v4();
        let mut labels = self.shared.labels.lock();
        let label = match labels.get(&self.uuid) {
            Some(existing) => format!("clone of {existing}"),
            None => format!("impossible missing label for {}", self.uuid),
        };
        labels.insert(uuid, label);

        Activity {
            tx: self.tx.clone(),
            uuid,
            shared: self.shared.clone(),
        }
    }
}

impl Drop for Activity {
    fn drop(&mut self) {
        self.shared.labels.lock().remove(&self.uuid);
    }
}

impl Activity {
    /// Returns true if the owning life cycle is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::Relaxed)
    }
}

/// ShutdownSubscription can be used by code that is idling.
/// Select on your timeout and ShutdownSubscription::shutting_down
/// to wake up when either the timeout expires or the service is
/// about to shut down.
#[derive(Clone)]
pub struct ShutdownSubscription {
    rx: WatchReceiver<bool>,
}

impl ShutdownSubscription {
    /// Await the shutdown of the service.
    /// Resolves immediately if shutdown has already begun.
    pub async fn shutting_down(&mut self) {
        self.rx.wait_for(|stopping| *stopping).await.ok();
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.rx.borrow()
    }
}

/// A cheaply cloneable reference to a `LifeCycle`, handed out to
/// the tasks whose activity it tracks.
#[derive(Clone)]
pub struct LifeCycleHandle {
    shared: Arc<Shared>,
}

impl LifeCycleHandle {
    /// Obtain an Activity instance.
    /// If None is returned then shutdown has begun and no new
    /// activity can be initiated.
    pub fn activity(&self, label: impl Into<String>) -> Option<Activity> {
        let active = self.shared.active.lock();
        let tx = active.as_ref()?.clone();
        let uuid = Uuid::new_v4();
        self.shared.labels.lock().insert(uuid, label.into());
        Some(Activity {
            tx,
            uuid,
            shared: self.shared.clone(),
        })
    }

    pub fn subscribe(&self) -> ShutdownSubscription {
        ShutdownSubscription {
            rx: self.shared.stopping_tx.subscribe(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::Relaxed)
    }

    /// Request that the owning LifeCycle shut down.
    /// This wakes up LifeCycle::wait_for_shutdown_request.
    /// Only the first request has any effect.
    pub fn request_shutdown(&self) {
        tracing::debug!("{}: shutdown has been requested", self.shared.name);
        if self
            .shared
            .stop_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.shared.request_shutdown_tx.try_send(()).ok();
        }
    }

    /// Number of activities that are currently alive
    pub fn active_count(&self) -> usize {
        self.shared.labels.lock().len()
    }
}

/// The LifeCycle struct represents the life cycle of a service.
/// It owns the receiving ends of the activity and shutdown request
/// channels; everything else interacts with it via LifeCycleHandle.
pub struct LifeCycle {
    activity_rx: MPSCReceiver<()>,
    request_shutdown_rx: MPSCReceiver<()>,
    handle: LifeCycleHandle,
}

impl LifeCycle {
    pub fn new(name: impl Into<String>) -> Self {
        let (activity_tx, activity_rx) = tokio::sync::mpsc::channel(1);
        let (request_shutdown_tx, request_shutdown_rx) = tokio::sync::mpsc::channel(1);
        let (stopping_tx, _) = tokio::sync::watch::channel(false);

        let shared = Arc::new(Shared {
            name: name.into(),
            active: Mutex::new(Some(activity_tx)),
            labels: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            stopping_tx,
            request_shutdown_tx,
            stop_requested: AtomicBool::new(false),
        });

        Self {
            activity_rx,
            request_shutdown_rx,
            handle: LifeCycleHandle { shared },
        }
    }

    pub fn handle(&self) -> LifeCycleHandle {
        self.handle.clone()
    }

    /// Wait until either a shutdown request is made through a
    /// handle, or the process receives SIGTERM, SIGHUP or ctrl-c.
    pub async fn wait_for_shutdown_request(&mut self) -> anyhow::Result<()> {
        tracing::debug!("{}: waiting for interrupt", self.handle.shared.name);
        let mut sig_term = tokio::signal::unix::signal(SignalKind::terminate())?;
        let mut sig_hup = tokio::signal::unix::signal(SignalKind::hangup())?;

        tokio::select! {
            _ = sig_term.recv() => {}
            _ = sig_hup.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
            _ = self.request_shutdown_rx.recv() => {}
        };
        tracing::debug!("{}: shutdown requested!", self.handle.shared.name);
        Ok(())
    }

    /// Signal subscribers that we are stopping. From this point on
    /// no new Activity can be obtained.
    pub fn begin_shutdown(&self) {
        let shared = &self.handle.shared;
        if shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("{}: signal tasks that we are stopping", shared.name);
        shared.active.lock().take();
        shared.stopping_tx.send_replace(true);
    }

    /// Begin shutdown if that has not happened already, then wait
    /// up to `grace` for all outstanding activities to finish.
    /// Returns true if everything finished within the grace period.
    pub async fn wait_for_idle(&mut self, grace: Duration) -> bool {
        self.begin_shutdown();
        let name = self.handle.shared.name.clone();
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let progress = tokio::time::Instant::now() + Duration::from_secs(15);
            tokio::select! {
                _ = self.activity_rx.recv() => {
                    return true;
                }
                _ = tokio::time::sleep_until(progress.min(deadline)) => {
                    let labels = self.handle.shared.labels.lock().clone();
                    if tokio::time::Instant::now() >= deadline {
                        tracing::info!(
                            "{name}: grace period elapsed with {} pending activities",
                            labels.len()
                        );
                        return false;
                    }
                    let n = labels.len();
                    let summary: Vec<&str> = labels.values().map(|s| s.as_str()).take(10).collect();
                    let summary = summary.join(", ");
                    let summary = if n > 10 {
                        format!("{summary} (and {} others)", n - 10)
                    } else {
                        summary
                    };
                    tracing::info!("{name}: still waiting for {n} pending activities... {summary}");
                }
            }
        }
    }
}
