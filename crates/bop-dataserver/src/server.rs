//! Data server facade.
//!
//! Owns the runtime, the writer pool and the allocator shared by every
//! connection, and spawns one connection loop per accepted transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::allocator::BlockAllocator;
use crate::config::DataServerConfig;
use crate::connection::{ConnectionStats, serve_connection};
use crate::error::ConfigError;
use crate::handler::{WriteContext, WriteHandler};
use crate::metrics::WriteMetricsSnapshot;
use crate::packet::PacketLedger;
use crate::protocol::{InboundEvent, WriteResponse};
use crate::runtime::{DataServerRuntime, DataServerRuntimeOptions, RuntimeError};
use crate::tier::StorageTierAssoc;
use crate::writer::WriterPool;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub struct DataServer {
    config: DataServerConfig,
    runtime: Arc<DataServerRuntime>,
    context: WriteContext,
    next_connection: AtomicU64,
    /// Each connection loop holds a clone until it exits.
    open_connections: Mutex<Option<mpsc::Sender<()>>>,
    connections_closed: Mutex<Option<mpsc::Receiver<()>>>,
}

impl DataServer {
    /// Builds a server on its own multi-thread runtime.
    pub fn new(
        config: DataServerConfig,
        allocator: Arc<dyn BlockAllocator>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let runtime = DataServerRuntime::create(DataServerRuntimeOptions {
            worker_threads: config.runtime_worker_threads,
            shutdown_timeout: config.shutdown_timeout(),
        })?;
        Self::build(config, allocator, runtime)
    }

    /// Builds a server on a runtime the caller already runs.
    pub fn with_handle(
        config: DataServerConfig,
        allocator: Arc<dyn BlockAllocator>,
        handle: Handle,
    ) -> Result<Self, ServerError> {
        Self::build(config, allocator, DataServerRuntime::attach(handle))
    }

    fn build(
        config: DataServerConfig,
        allocator: Arc<dyn BlockAllocator>,
        runtime: Arc<DataServerRuntime>,
    ) -> Result<Self, ServerError> {
        let pool = WriterPool::new(runtime.handle(), config.writer_threads);
        let context = WriteContext::new(allocator, pool, &config)?;
        info!(
            queue_capacity = config.packet_queue_capacity,
            writer_threads = config.writer_threads,
            temp_tier = context.tiers.temp_block_alias(),
            "data server ready"
        );
        let (open_tx, closed_rx) = mpsc::channel(1);
        Ok(Self {
            config,
            runtime,
            context,
            next_connection: AtomicU64::new(0),
            open_connections: Mutex::new(Some(open_tx)),
            connections_closed: Mutex::new(Some(closed_rx)),
        })
    }

    /// New handler for a connection whose responses go to `responses`.
    ///
    /// The handler's streams are cancelled on server shutdown.
    pub fn handler(&self, responses: mpsc::Sender<WriteResponse>) -> WriteHandler {
        let connection = self.runtime.shutdown_token().child_token();
        WriteHandler::new(self.context.clone(), responses, connection)
    }

    /// Spawns the loop of a newly accepted connection.
    pub fn accept(
        &self,
        inbound: mpsc::Receiver<InboundEvent>,
        outbound: mpsc::Sender<WriteResponse>,
    ) -> JoinHandle<ConnectionStats> {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let handler = self.handler(outbound);
        let shutdown = self.runtime.shutdown_token();
        let open = self.open_connections.lock().clone();
        self.runtime.handle().spawn(
            async move {
                let stats = serve_connection(handler, inbound, shutdown).await;
                drop(open);
                stats
            }
            .instrument(info_span!("connection", id)),
        )
    }

    pub fn config(&self) -> &DataServerConfig {
        &self.config
    }

    pub fn tiers(&self) -> &StorageTierAssoc {
        &self.context.tiers
    }

    pub fn metrics(&self) -> WriteMetricsSnapshot {
        self.context.metrics.snapshot()
    }

    pub fn ledger(&self) -> Arc<PacketLedger> {
        Arc::clone(&self.context.ledger)
    }

    /// Writers currently running across all connections.
    pub fn active_writers(&self) -> usize {
        self.context.pool.active()
    }

    pub fn is_shutdown(&self) -> bool {
        self.runtime.is_shutdown()
    }

    /// Stops new writers, cancels every connection and stops an owned runtime.
    ///
    /// Before an owned runtime is torn down, waits up to the shutdown timeout
    /// for connection loops to answer their active streams.
    pub fn shutdown(&self) {
        self.context.pool.close();
        self.runtime.cancel();
        if self.runtime.owns_runtime() {
            self.wait_for_connections();
        }
        self.runtime.shutdown();
    }

    fn wait_for_connections(&self) {
        drop(self.open_connections.lock().take());
        let Some(mut closed) = self.connections_closed.lock().take() else {
            return;
        };
        if Handle::try_current().is_ok() {
            warn!("shutdown called from within the runtime, not waiting for connections");
            return;
        }
        let timeout = self.runtime.shutdown_timeout();
        let drained = self.runtime.handle().block_on(async move {
            // Yields `None` once every connection loop has dropped its sender.
            tokio::time::timeout(timeout, closed.recv()).await
        });
        match drained {
            Ok(_) => debug!("all connections closed"),
            Err(_) => warn!(
                timeout_ms = timeout.as_millis() as u64,
                "connections still open after shutdown timeout"
            ),
        }
    }
}
