//! A pool of reusable connection handlers.
//!
//! In bounded mode a semaphore caps the number of handlers that can
//! be leased at once; acquisition waits up to a configured timeout,
//! or fails immediately when that timeout is zero. In unbounded mode
//! acquisition always succeeds, constructing a handler when none is
//! idle, and idle handlers beyond `max_idle` or older than
//! `idle_timeout` are discarded.
use crate::metrics::HANDLER_POOL_IDLE;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

/// Prepares a handler for its next connection
pub trait Recycle {
    fn recycle(&mut self);
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("all {capacity} handlers are in use")]
    Exhausted { capacity: usize },
    #[error("handler pool is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPolicy {
    Bounded {
        capacity: usize,
        acquire_timeout: Duration,
    },
    Unbounded {
        max_idle: usize,
        idle_timeout: Duration,
    },
}

struct Idle<T> {
    item: T,
    since: Instant,
}

struct Inner<T> {
    idle: Mutex<VecDeque<Idle<T>>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    policy: PoolPolicy,
    permits: Option<Arc<Semaphore>>,
    leased: AtomicUsize,
}

impl<T> Inner<T> {
    fn max_idle(&self) -> usize {
        match self.policy {
            PoolPolicy::Bounded { capacity, .. } => capacity,
            PoolPolicy::Unbounded { max_idle, .. } => max_idle,
        }
    }

    fn idle_timeout(&self) -> Option<Duration> {
        match self.policy {
            PoolPolicy::Bounded { .. } => None,
            PoolPolicy::Unbounded { idle_timeout, .. } => Some(idle_timeout),
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        HANDLER_POOL_IDLE.sub(self.idle.get_mut().len() as i64);
    }
}

pub struct HandlerPool<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for HandlerPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Recycle + Send + 'static> HandlerPool<T> {
    pub fn new<F>(policy: PoolPolicy, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let permits = match policy {
            PoolPolicy::Bounded { capacity, .. } => Some(Arc::new(Semaphore::new(capacity))),
            PoolPolicy::Unbounded { .. } => None,
        };
        Self {
            inner: Arc::new(Inner {
                idle: Mutex::new(VecDeque::new()),
                factory: Box::new(factory),
                policy,
                permits,
                leased: AtomicUsize::new(0),
            }),
        }
    }

    pub fn policy(&self) -> PoolPolicy {
        self.inner.policy
    }

    /// Lease a handler, constructing one if none are idle
    pub async fn acquire(&self) -> Result<Lease<T>, PoolError> {
        let permit = match (&self.inner.permits, self.inner.policy) {
            (
                Some(permits),
                PoolPolicy::Bounded {
                    capacity,
                    acquire_timeout,
                },
            ) => {
                let permit = if acquire_timeout.is_zero() {
                    permits.clone().try_acquire_owned().map_err(|err| match err {
                        tokio::sync::TryAcquireError::Closed => PoolError::Closed,
                        tokio::sync::TryAcquireError::NoPermits => {
                            PoolError::Exhausted { capacity }
                        }
                    })?
                } else {
                    tokio::time::timeout(acquire_timeout, permits.clone().acquire_owned())
                        .await
                        .map_err(|_| PoolError::Exhausted { capacity })?
                        .map_err(|_| PoolError::Closed)?
                };
                Some(permit)
            }
            _ => None,
        };

        let item = self.take_idle().unwrap_or_else(|| (self.inner.factory)());
        self.inner.leased.fetch_add(1, Ordering::SeqCst);
        Ok(Lease {
            item: Some(item),
            permit,
            pool: self.clone(),
        })
    }

    fn take_idle(&self) -> Option<T> {
        let idle_timeout = self.inner.idle_timeout();
        let mut idle = self.inner.idle.lock();
        loop {
            let entry = idle.pop_front()?;
            HANDLER_POOL_IDLE.dec();
            if idle_timeout.map_or(false, |max_age| entry.since.elapsed() > max_age) {
                continue;
            }
            return Some(entry.item);
        }
    }

    fn put(&self, mut item: T) {
        item.recycle();
        let mut idle = self.inner.idle.lock();
        if idle.len() >= self.inner.max_idle() {
            return;
        }
        idle.push_back(Idle {
            item,
            since: Instant::now(),
        });
        HANDLER_POOL_IDLE.inc();
    }

    /// Discard idle handlers older than the idle timeout.
    /// Returns the number discarded.
    pub fn expire(&self) -> usize {
        let Some(max_age) = self.inner.idle_timeout() else {
            return 0;
        };
        let mut idle = self.inner.idle.lock();
        let len_before = idle.len();
        idle.retain(|entry| entry.since.elapsed() <= max_age);
        let diff = len_before - idle.len();
        if diff > 0 {
            HANDLER_POOL_IDLE.sub(diff as i64);
        }
        diff
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    pub fn leased_count(&self) -> usize {
        self.inner.leased.load(Ordering::SeqCst)
    }

    /// Periodically call `expire` for as long as the pool exists
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let pool = HandlerPool { inner };
                let expired = pool.expire();
                if expired > 0 {
                    tracing::debug!("expired {expired} idle connection handlers");
                }
            }
        })
    }
}

/// Exclusive use of one pooled handler. The handler returns to the
/// pool on `release` or when the lease is dropped, whichever comes
/// first; later releases do nothing.
pub struct Lease<T: Recycle + Send + 'static> {
    item: Option<T>,
    permit: Option<OwnedSemaphorePermit>,
    pool: HandlerPool<T>,
}

impl<T: Recycle + Send + 'static> Lease<T> {
    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.item.as_mut()
    }

    /// Returns true if this call released the handler
    pub fn release(&mut self) -> bool {
        let Some(item) = self.item.take() else {
            return false;
        };
        self.pool.put(item);
        self.pool.inner.leased.fetch_sub(1, Ordering::SeqCst);
        // The permit goes back only once the handler is idle again
        self.permit.take();
        true
    }
}

impl<T: Recycle + Send + 'static> Drop for Lease<T> {
    fn drop(&mut self) {
        self.release();
    }
}
