//! Packet writer task and the worker pool it runs on.
//!
//! Each active stream gets one [`PacketWriter`]. It runs on tokio's blocking
//! pool so disk writes never stall a connection loop, and it holds a permit of
//! the shared [`WriterPool`] for its whole lifetime, which bounds the number of
//! concurrent writers across connections.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::WriteError;
use crate::metrics::WriteMetrics;
use crate::packet::Packet;
use crate::protocol::StreamKey;
use crate::queue::{PacketReceiver, QueueItem};
use crate::target::WriteTarget;

/// Successful outcome of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    pub packets_written: u64,
    pub bytes_written: u64,
}

/// What a writer reports when it exits.
pub type WriteReport = Result<WriteSummary, WriteError>;

/// Drains one stream's packet queue into its write target.
pub struct PacketWriter {
    target: Box<dyn WriteTarget>,
    receiver: PacketReceiver,
    abort: CancellationToken,
    metrics: Arc<WriteMetrics>,
    next_offset: u64,
    packets_written: u64,
}

impl PacketWriter {
    pub fn new(
        target: Box<dyn WriteTarget>,
        receiver: PacketReceiver,
        abort: CancellationToken,
        metrics: Arc<WriteMetrics>,
    ) -> Self {
        Self {
            target,
            receiver,
            abort,
            metrics,
            next_offset: 0,
            packets_written: 0,
        }
    }

    /// Runs until end of stream, failure or cancellation. Blocking.
    ///
    /// On every non-success exit the queue is closed, buffered packets are
    /// released unwritten, and the sink is closed without finalizing.
    pub fn run(mut self) -> WriteReport {
        let key = self.target.key();
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.drain())) {
            Ok(outcome) => outcome,
            Err(payload) => Err(WriteError::Panic(panic_message(payload))),
        };

        match outcome {
            Ok(summary) => {
                debug!(
                    session_id = key.session_id.get(),
                    block_id = key.block_id.get(),
                    bytes = summary.bytes_written,
                    packets = summary.packets_written,
                    "packet writer committed block"
                );
                Ok(summary)
            }
            Err(error) => {
                let discarded = self.receiver.discard_remaining();
                self.target.abort();
                if error.is_cancelled() {
                    debug!(
                        session_id = key.session_id.get(),
                        block_id = key.block_id.get(),
                        discarded,
                        "packet writer cancelled"
                    );
                } else {
                    warn!(
                        session_id = key.session_id.get(),
                        block_id = key.block_id.get(),
                        offset = self.next_offset,
                        discarded,
                        code = error.code().as_str(),
                        error = %error,
                        "packet writer failed"
                    );
                }
                Err(error)
            }
        }
    }

    fn drain(&mut self) -> WriteReport {
        loop {
            if self.abort.is_cancelled() {
                return Err(WriteError::Cancelled);
            }
            match self.receiver.blocking_next() {
                Some(QueueItem::Packet(packet)) => self.write_packet(packet)?,
                Some(QueueItem::EndOfStream) => {
                    if self.abort.is_cancelled() {
                        return Err(WriteError::Cancelled);
                    }
                    self.target.commit()?;
                    return Ok(WriteSummary {
                        packets_written: self.packets_written,
                        bytes_written: self.next_offset,
                    });
                }
                // Producer dropped without end of stream: the stream was abandoned.
                None => return Err(WriteError::Cancelled),
            }
        }
    }

    /// Allocates, appends and advances. `packet` is released when this returns,
    /// whichever way it returns.
    fn write_packet(&mut self, packet: Packet) -> Result<(), WriteError> {
        if packet.is_empty() {
            return Ok(());
        }
        if self.abort.is_cancelled() {
            return Err(WriteError::Cancelled);
        }

        let len = packet.len() as u64;
        if self.next_offset == 0 {
            self.target.allocate_first_write(len)?;
        } else {
            self.target.allocate_continuation(len)?;
        }
        self.target.writable_sink()?.append(packet.as_slice())?;

        self.next_offset += len;
        self.packets_written += 1;
        self.metrics.record_packet_written(len);
        Ok(())
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Bounded pool of packet writers shared by every connection of a server.
#[derive(Debug, Clone)]
pub struct WriterPool {
    runtime: Handle,
    permits: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    limit: usize,
}

impl WriterPool {
    pub fn new(runtime: Handle, max_writers: usize) -> Self {
        let limit = max_writers.max(1);
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(limit)),
            active: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    /// Starts `writer` once a pool slot is free.
    pub async fn spawn(&self, writer: PacketWriter) -> Result<WriterHandle, WriteError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| WriteError::PoolClosed)?;
        let active = ActiveWriter::enter(&self.active);
        let join = self.runtime.spawn_blocking(move || {
            let _active = active;
            let _permit = permit;
            writer.run()
        });
        Ok(WriterHandle { join, report: None })
    }

    /// Writers currently running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Refuses further writers; running writers finish normally.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

/// Counts a writer as active until dropped, including by an unwinding task.
struct ActiveWriter(Arc<AtomicUsize>);

impl ActiveWriter {
    fn enter(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(active))
    }
}

impl Drop for ActiveWriter {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Join handle of a running packet writer.
#[derive(Debug)]
pub struct WriterHandle {
    join: JoinHandle<WriteReport>,
    report: Option<WriteReport>,
}

impl WriterHandle {
    /// Waits for the writer to exit. Cancel safe; later calls return the
    /// same report.
    pub async fn join(&mut self) -> WriteReport {
        if let Some(report) = &self.report {
            return report.clone();
        }
        let report = match (&mut self.join).await {
            Ok(report) => report,
            Err(err) if err.is_panic() => Err(WriteError::Panic(panic_message(err.into_panic()))),
            // Task dropped before it ran, e.g. during runtime shutdown.
            Err(_) => Err(WriteError::Cancelled),
        };
        self.report = Some(report.clone());
        report
    }

    pub fn is_finished(&self) -> bool {
        self.report.is_some() || self.join.is_finished()
    }
}
