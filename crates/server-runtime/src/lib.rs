//! Named worker pools.
//!
//! Each listener names the pool that runs its connection tasks.
//! A pool is a dedicated multi-threaded tokio runtime whose size is
//! taken from configuration, from an `SMTPD_<NAME>_THREADS`
//! environment variable, or from the number of available cpus.
//! The special pool name `default` refers to the runtime that the
//! caller is already running on.
//!
//! Pools live for the remainder of the process; a tokio runtime
//! cannot be dropped from within an async context, so they are
//! leaked rather than torn down.
use parking_lot::Mutex;
use prometheus::IntGaugeVec;
use std::collections::HashMap;
use std::future::Future;
use std::sync::LazyLock;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

pub const DEFAULT_POOL: &str = "default";

static PARKED_THREADS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    prometheus::register_int_gauge_vec!(
        "thread_pool_parked",
        "number of parked(idle) threads in a thread pool",
        &["pool"]
    )
    .expect("failed to register thread_pool_parked")
});
static NUM_THREADS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    prometheus::register_int_gauge_vec!(
        "thread_pool_size",
        "number of threads in a thread pool",
        &["pool"]
    )
    .expect("failed to register thread_pool_size")
});

static CONFIGURED: LazyLock<Mutex<HashMap<String, usize>>> = LazyLock::new(Mutex::default);
static POOLS: LazyLock<Mutex<HashMap<String, &'static Runtime>>> = LazyLock::new(Mutex::default);

/// Record the desired size of a named pool. Must be called before
/// the pool is first used to have any effect.
pub fn set_pool_threads(name: &str, n_threads: usize) {
    CONFIGURED.lock().insert(name.to_string(), n_threads);
}

pub struct Runtime {
    runtime: tokio::runtime::Runtime,
    n_threads: usize,
    name: String,
}

impl Runtime {
    fn new(name: &str) -> anyhow::Result<Self> {
        let env_name = format!("SMTPD_{}_THREADS", name.to_uppercase().replace('-', "_"));
        let n_threads = match std::env::var(&env_name) {
            Ok(n) => n
                .parse()
                .map_err(|err| anyhow::anyhow!("invalid {env_name}={n}: {err:#}"))?,
            Err(_) => match CONFIGURED.lock().get(name).copied() {
                Some(n) if n > 0 => n,
                _ => std::thread::available_parallelism()?.get(),
            },
        };

        let num_parked = PARKED_THREADS.get_metric_with_label_values(&[name])?;
        let num_threads = NUM_THREADS.get_metric_with_label_values(&[name])?;
        num_threads.set(n_threads as i64);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_io()
            .enable_time()
            .worker_threads(n_threads)
            .thread_name(format!("{name}-worker"))
            .on_thread_park({
                let num_parked = num_parked.clone();
                move || num_parked.inc()
            })
            .on_thread_unpark(move || num_parked.dec())
            .build()?;

        tracing::info!("{name} pool starting with {n_threads} threads");

        Ok(Self {
            runtime,
            n_threads,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_num_threads(&self) -> usize {
        self.n_threads
    }

    pub fn handle(&self) -> &Handle {
        self.runtime.handle()
    }
}

/// Resolve a pool name to a runtime handle, creating the pool on
/// first use.
pub fn get_named_pool(name: &str) -> anyhow::Result<Handle> {
    if name == DEFAULT_POOL {
        return Ok(Handle::try_current()?);
    }
    let mut pools = POOLS.lock();
    if let Some(runtime) = pools.get(name) {
        return Ok(runtime.handle().clone());
    }
    let runtime: &'static Runtime = Box::leak(Box::new(Runtime::new(name)?));
    pools.insert(name.to_string(), runtime);
    Ok(runtime.handle().clone())
}

/// Spawn a future onto the named pool.
pub fn spawn_on<FUT>(pool: &str, fut: FUT) -> anyhow::Result<JoinHandle<FUT::Output>>
where
    FUT: Future + Send + 'static,
    FUT::Output: Send + 'static,
{
    let handle = get_named_pool(pool)?;
    Ok(handle.spawn(fut))
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[tokio::test]
    async fn default_pool_is_current_runtime() {
        let value = spawn_on(DEFAULT_POOL, async { 42 }).unwrap().await.unwrap();
        assert_equal!(value, 42);
    }

    #[tokio::test]
    async fn named_pool_is_created_once() {
        set_pool_threads("unit-test", 2);
        let name = spawn_on("unit-test", async {
            std::thread::current().name().map(|s| s.to_string())
        })
        .unwrap()
        .await
        .unwrap();
        assert_equal!(name.as_deref(), Some("unit-test-worker"));

        get_named_pool("unit-test").unwrap();
        assert_equal!(POOLS.lock().len(), 1);
        assert_equal!(
            NUM_THREADS
                .get_metric_with_label_values(&["unit-test"])
                .unwrap()
                .get(),
            2
        );
    }
}
