//! `WorkerPool`: bounded threads that run handler work off the reactor.
//!
//! The pool is a dedicated tokio runtime whose blocking pool does the work:
//! `core_threads` runtime workers, at most `max_threads` blocking threads,
//! and idle threads retire after `keep_alive`. Handlers are synchronous,
//! so every job goes through `spawn_blocking`.
//!
//! One pool is shared by every dispatcher in the process. It is created on
//! first use and released once the last dispatcher drops its handle.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use crate::config::WorkerPoolConfig;
use crate::error::WeftError;

static SHARED_POOL: Mutex<Option<Weak<WorkerPool>>> = parking_lot::const_mutex(None);

pub struct WorkerPool {
    runtime: Option<Runtime>,
    handle: Handle,
    jobs: TaskTracker,
    max_threads: usize,
}

impl WorkerPool {
    pub fn new(config: &WorkerPoolConfig) -> Result<Self, WeftError> {
        config.validate()?;
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.core_threads)
            .max_blocking_threads(config.max_threads)
            .thread_keep_alive(config.keep_alive())
            .thread_name("weft-worker")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        debug!(
            core = config.core_threads,
            max = config.max_threads,
            "worker pool started"
        );
        Ok(Self {
            runtime: Some(runtime),
            handle,
            jobs: TaskTracker::new(),
            max_threads: config.max_threads,
        })
    }

    /// The process-wide pool, created with `config` if none is alive.
    pub fn shared(config: &WorkerPoolConfig) -> Result<Arc<Self>, WeftError> {
        let mut slot = SHARED_POOL.lock();
        if let Some(pool) = slot.as_ref().and_then(Weak::upgrade) {
            return Ok(pool);
        }
        let pool = Arc::new(Self::new(config)?);
        *slot = Some(Arc::downgrade(&pool));
        Ok(pool)
    }

    /// Queue `job`. Panics inside the job are caught and logged.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.jobs.spawn_blocking_on(move || run_guarded(job), &self.handle);
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.jobs.len()
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // The last handle may be dropped on one of our own threads, so the
        // runtime must not wait for itself.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
            debug!("worker pool stopped");
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("pending", &self.pending())
            .field("max_threads", &self.max_threads)
            .finish()
    }
}

/// Run `job`, logging instead of unwinding if it panics.
pub(crate) fn run_guarded<F: FnOnce()>(job: F) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
        let msg = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".into());
        error!("handler panicked: {msg}");
    }
}
