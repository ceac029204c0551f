use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Options for constructing the data server runtime.
#[derive(Debug, Clone)]
pub struct DataServerRuntimeOptions {
    pub worker_threads: Option<usize>,
    pub shutdown_timeout: Duration,
}

impl Default for DataServerRuntimeOptions {
    fn default() -> Self {
        Self {
            worker_threads: None,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to build Tokio runtime: {0}")]
    Build(#[from] io::Error),
}

/// Tokio runtime wrapper with a shutdown token shared by every connection.
///
/// Either owns a multi-thread runtime or borrows the handle of one the caller
/// already runs; only an owned runtime is torn down on shutdown.
#[derive(Debug)]
pub struct DataServerRuntime {
    runtime: Mutex<Option<Arc<Runtime>>>,
    handle: Handle,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl DataServerRuntime {
    #[instrument(skip(options), fields(
        worker_threads = ?options.worker_threads,
        shutdown_timeout_ms = options.shutdown_timeout.as_millis() as u64
    ))]
    pub fn create(options: DataServerRuntimeOptions) -> Result<Arc<Self>, RuntimeError> {
        let mut builder = Builder::new_multi_thread();
        builder.enable_all().thread_name("bop-dataserver");
        if let Some(threads) = options.worker_threads {
            builder.worker_threads(threads.max(1));
        }

        let runtime = builder.build().map_err(|e| {
            error!(error = %e, "failed to build tokio runtime");
            e
        })?;
        info!("data server runtime created");

        let runtime = Arc::new(runtime);
        let handle = runtime.handle().clone();
        Ok(Arc::new(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            shutdown_token: CancellationToken::new(),
            shutdown_timeout: options.shutdown_timeout,
        }))
    }

    /// Attach to a runtime owned elsewhere.
    pub fn attach(handle: Handle) -> Arc<Self> {
        debug!("attaching data server to existing tokio runtime");
        Arc::new(Self {
            runtime: Mutex::new(None),
            handle,
            shutdown_token: CancellationToken::new(),
            shutdown_timeout: Duration::ZERO,
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Cancellation token signalled during shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Whether [`shutdown`](Self::shutdown) will stop a runtime this wrapper built.
    pub fn owns_runtime(&self) -> bool {
        self.runtime.lock().is_some()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Signals the shutdown token without stopping the runtime, so tasks
    /// observing it can still finish.
    pub fn cancel(&self) {
        if !self.shutdown_token.is_cancelled() {
            info!("initiating data server runtime shutdown");
            self.shutdown_token.cancel();
        }
    }

    /// Cancels every connection and stops the owned runtime, if any.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        self.cancel();
        let Some(runtime) = self.runtime.lock().take() else {
            debug!("no owned runtime left to stop");
            return;
        };
        match Arc::try_unwrap(runtime) {
            Ok(runtime) => {
                if Handle::try_current().is_ok() {
                    info!("shutting down runtime in background (called from within tokio runtime)");
                    runtime.shutdown_background();
                } else {
                    runtime.shutdown_timeout(self.shutdown_timeout);
                }
                info!("data server runtime shutdown complete");
            }
            Err(runtime) => {
                warn!(
                    strong_count = Arc::strong_count(&runtime),
                    "cannot shut down runtime: still shared"
                );
            }
        }
    }
}

impl Drop for DataServerRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
