//! Background execution context
//!
//! A single named worker thread runs a current-thread tokio runtime that
//! drives every socket, timer and discovery exchange. Application threads
//! hand futures over with [`ExecutionContext::run`] and block until the
//! result arrives on a per-call oneshot channel.

use std::future::Future;
use std::thread;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ManagerError, SubmitError};

/// Name of the worker thread
pub const WORKER_THREAD_NAME: &str = "diag-client-main";

pub struct ExecutionContext {
    handle: Handle,
    shutdown: CancellationToken,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ExecutionContext {
    /// Spawn the worker thread. It runs until `shutdown` is cancelled.
    pub fn start(shutdown: CancellationToken) -> Result<Self, ManagerError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ManagerError::Runtime(e.to_string()))?;
        let handle = runtime.handle().clone();

        let token = shutdown.clone();
        let worker = thread::Builder::new()
            .name(WORKER_THREAD_NAME.into())
            .spawn(move || {
                debug!("Execution context running");
                runtime.block_on(token.cancelled());
                // Dropping the runtime drops every pending task, which
                // releases the completion channel of any blocked caller.
                drop(runtime);
                debug!("Execution context stopped");
            })
            .map_err(|e| ManagerError::Runtime(e.to_string()))?;

        info!(thread = WORKER_THREAD_NAME, "Execution context started");
        Ok(Self {
            handle,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Run `fut` on the worker and block the calling thread for its output
    ///
    /// Must not be called from inside an async runtime.
    pub fn run<F>(&self, fut: F) -> Result<F::Output, SubmitError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if Handle::try_current().is_ok() {
            return Err(SubmitError::InsideRuntime);
        }
        if self.shutdown.is_cancelled() {
            return Err(SubmitError::ShutDown);
        }

        let (tx, rx) = oneshot::channel();
        self.handle.spawn(async move {
            let _ = tx.send(fut.await);
        });
        rx.blocking_recv().map_err(|_| SubmitError::ShutDown)
    }

    /// Cancel the shutdown token and join the worker; idempotent
    pub fn stop(&self) {
        self.shutdown.cancel();
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        if worker.thread().id() == thread::current().id() {
            warn!("Execution context stopped from its own worker, not joining");
            return;
        }
        if worker.join().is_err() {
            warn!("Execution context worker panicked");
        }
        info!("Execution context joined");
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.stop();
    }
}
