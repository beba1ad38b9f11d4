//! Execution strategies for handler invocations.
//!
//! A job is the whole processing of one event. The three strategies run it
//! to completion in different places:
//!
//! - `cooperative`: a task on the shared runtime
//! - `pooled-light`: a blocking-pool thread, at most `light_pool_size` at once
//! - `pooled-os`: one of `os_pool_size` dedicated OS threads
//!
//! Pooled jobs drive their future with `Handle::block_on`, so timers and
//! channels inside the handler keep working while the thread is allowed to
//! block.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};

use super::registry::ExecutionModel;
use crate::config::DispatchConfig;
use crate::error::PlatformError;

/// Processing of one event.
pub type Job = BoxFuture<'static, ()>;

// ---------------------------------------------------------------------------
// Executors
// ---------------------------------------------------------------------------

/// The three execution pools shared by every dispatcher of a platform.
pub struct Executors {
    handle: Handle,
    light: Arc<Semaphore>,
    os: OsPool,
}

impl Executors {
    /// Creates the pools on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::NoRuntime` outside a tokio runtime and
    /// `PlatformError::Thread` if an OS thread cannot be spawned.
    pub fn new(config: &DispatchConfig) -> Result<Self, PlatformError> {
        let handle = Handle::try_current()?;
        let os = OsPool::start(handle.clone(), config.os_pool_size.max(1))?;
        Ok(Self {
            handle,
            light: Arc::new(Semaphore::new(config.light_pool_size.max(1))),
            os,
        })
    }

    /// Runs `job` with the given strategy. Returns immediately.
    pub fn execute(&self, model: ExecutionModel, job: Job) {
        match model {
            ExecutionModel::Cooperative => {
                self.handle.spawn(job);
            }
            ExecutionModel::PooledLight => {
                let light = Arc::clone(&self.light);
                let handle = self.handle.clone();
                // Waiting for a permit queues the job instead of shedding it.
                self.handle.spawn(async move {
                    let Ok(permit) = light.acquire_owned().await else {
                        return;
                    };
                    let runner = handle.clone();
                    handle.spawn_blocking(move || {
                        runner.block_on(job);
                        drop(permit);
                    });
                });
            }
            ExecutionModel::PooledOs => {
                if let Err(job) = self.os.submit(job) {
                    tracing::warn!("os pool closed, running job cooperatively");
                    self.handle.spawn(job);
                }
            }
        }
    }

    /// Permits currently free in the `pooled-light` pool.
    #[must_use]
    pub fn light_available(&self) -> usize {
        self.light.available_permits()
    }

    #[must_use]
    pub fn os_threads(&self) -> usize {
        self.os.threads
    }

    /// Stops accepting `pooled-os` jobs. Threads exit once their queue drains.
    pub fn close(&self) {
        self.os.close();
        self.light.close();
    }
}

// ---------------------------------------------------------------------------
// OsPool
// ---------------------------------------------------------------------------

/// Fixed set of named OS threads pulling jobs from a shared queue.
struct OsPool {
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    threads: usize,
}

impl OsPool {
    fn start(handle: Handle, threads: usize) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        for i in 0..threads {
            let rx = Arc::clone(&rx);
            let handle = handle.clone();
            std::thread::Builder::new()
                .name(format!("mesh-os-{i}"))
                .spawn(move || loop {
                    let next = rx.lock().blocking_recv();
                    match next {
                        Some(job) => handle.block_on(job),
                        None => break,
                    }
                })?;
        }

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            threads,
        })
    }

    /// Queues a job, handing it back if the pool is closed.
    fn submit(&self, job: Job) -> Result<(), Job> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(job).map_err(|e| e.0),
            None => Err(job),
        }
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}
