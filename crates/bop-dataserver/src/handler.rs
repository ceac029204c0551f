//! Per-connection write protocol state machine.
//!
//! A connection carries at most one write stream at a time. The stream lives
//! in [`StreamSlot`]: either nothing is active or exactly one stream is, and
//! every transition out of `Active` goes through `close_active`, which takes
//! the stream out of the slot and emits its single terminal response.
//!
//! ```text
//! Idle -> Receiving -> Draining -> Closed
//!            \            /
//!             `-> Aborting -'
//! ```

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::allocator::BlockAllocator;
use crate::config::DataServerConfig;
use crate::error::{ConfigError, WriteError};
use crate::metrics::WriteMetrics;
use crate::packet::{Packet, PacketLedger};
use crate::protocol::{StreamKey, WriteRequest, WriteRequestKind, WriteResponse};
use crate::queue::{PacketSender, PushError, packet_queue};
use crate::target::BlockWriteTarget;
use crate::tier::StorageTierAssoc;
use crate::writer::{PacketWriter, WriteReport, WriterHandle, WriterPool};

/// Observable state of a [`WriteHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// No stream has been seen yet.
    Idle,
    /// A stream is accepting packets.
    Receiving,
    /// End of stream was queued; the writer is flushing.
    Draining,
    /// The stream is being torn down.
    Aborting,
    /// The last stream reached a terminal response.
    Closed,
}

/// Collaborators shared by every handler of a server.
#[derive(Clone)]
pub struct WriteContext {
    pub allocator: Arc<dyn BlockAllocator>,
    pub pool: WriterPool,
    pub tiers: StorageTierAssoc,
    pub ledger: Arc<PacketLedger>,
    pub metrics: Arc<WriteMetrics>,
    pub packet_queue_capacity: usize,
    pub max_packet_bytes: u64,
}

impl WriteContext {
    pub fn new(
        allocator: Arc<dyn BlockAllocator>,
        pool: WriterPool,
        config: &DataServerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            allocator,
            pool,
            tiers: config.tier_assoc()?,
            ledger: PacketLedger::new(),
            metrics: Arc::new(WriteMetrics::default()),
            packet_queue_capacity: config.packet_queue_capacity,
            max_packet_bytes: config.max_packet_bytes,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamPhase {
    Receiving,
    Draining,
    Aborting,
}

struct ActiveStream {
    key: StreamKey,
    phase: StreamPhase,
    /// Bytes accepted into the queue so far; the next packet's offset.
    pos_to_queue: u64,
    /// Dropped once end of stream is queued or the stream aborts.
    sender: Option<PacketSender>,
    abort: CancellationToken,
    writer: WriterHandle,
}

enum StreamSlot {
    Idle,
    Active(Box<ActiveStream>),
}

enum Enqueued {
    Queued,
    WriterGone,
    Cancelled,
}

/// Write protocol handler for one connection.
pub struct WriteHandler {
    context: WriteContext,
    tier_alias: String,
    responses: mpsc::Sender<WriteResponse>,
    connection: CancellationToken,
    slot: StreamSlot,
    streams_closed: u64,
}

impl WriteHandler {
    /// `connection` is cancelled when the connection goes away; every stream
    /// gets a child of it.
    pub fn new(
        context: WriteContext,
        responses: mpsc::Sender<WriteResponse>,
        connection: CancellationToken,
    ) -> Self {
        let tier_alias = context.tiers.temp_block_alias().to_string();
        Self {
            context,
            tier_alias,
            responses,
            connection,
            slot: StreamSlot::Idle,
            streams_closed: 0,
        }
    }

    pub fn state(&self) -> HandlerState {
        match &self.slot {
            StreamSlot::Active(stream) => match stream.phase {
                StreamPhase::Receiving => HandlerState::Receiving,
                StreamPhase::Draining => HandlerState::Draining,
                StreamPhase::Aborting => HandlerState::Aborting,
            },
            StreamSlot::Idle if self.streams_closed > 0 => HandlerState::Closed,
            StreamSlot::Idle => HandlerState::Idle,
        }
    }

    pub fn active_stream(&self) -> Option<StreamKey> {
        match &self.slot {
            StreamSlot::Active(stream) => Some(stream.key),
            StreamSlot::Idle => None,
        }
    }

    /// Packets queued ahead of the active stream's writer.
    pub fn queued_packets(&self) -> usize {
        match &self.slot {
            StreamSlot::Active(stream) => stream.sender.as_ref().map_or(0, PacketSender::len),
            StreamSlot::Idle => 0,
        }
    }

    pub fn tier_alias(&self) -> &str {
        &self.tier_alias
    }

    pub fn connection_token(&self) -> &CancellationToken {
        &self.connection
    }

    /// Applies one inbound message.
    ///
    /// Returns the error that rejected the message or ended the stream
    /// because of it; the matching response has already been sent. Waits
    /// while the packet queue is full or the writer pool has no free slot.
    pub async fn handle(&mut self, request: WriteRequest) -> Result<(), WriteError> {
        self.reap_finished_writer().await;
        let key = request.key();
        match request.kind {
            WriteRequestKind::Packet { offset, payload } => {
                self.on_packet(key, offset, payload).await
            }
            WriteRequestKind::EndOfStream => self.on_end_of_stream(key).await,
        }
    }

    /// Client-requested abort of the active stream.
    pub async fn cancel(&mut self) {
        if let Some(key) = self.active_stream() {
            debug!(
                session_id = key.session_id.get(),
                block_id = key.block_id.get(),
                "cancel requested"
            );
            self.abort_with(WriteError::Cancelled).await;
        }
    }

    /// Transport failure; the active stream is abandoned.
    pub async fn connection_error(&mut self, reason: &str) {
        match self.active_stream() {
            Some(key) => {
                warn!(
                    session_id = key.session_id.get(),
                    block_id = key.block_id.get(),
                    reason,
                    "connection error during write stream"
                );
                self.abort_with(WriteError::Cancelled).await;
            }
            None => debug!(reason, "connection error with no active stream"),
        }
    }

    /// Resolves when the active stream's writer exits. Pending while no
    /// stream is active. Cancel safe.
    pub async fn writer_exited(&mut self) -> WriteReport {
        match &mut self.slot {
            StreamSlot::Active(stream) => stream.writer.join().await,
            StreamSlot::Idle => std::future::pending().await,
        }
    }

    /// Closes the active stream with the report from [`writer_exited`](Self::writer_exited).
    pub async fn on_writer_exit(&mut self, report: WriteReport) {
        self.close_active(report, None).await;
    }

    async fn on_packet(
        &mut self,
        key: StreamKey,
        offset: u64,
        payload: Bytes,
    ) -> Result<(), WriteError> {
        let len = payload.len() as u64;
        match &self.slot {
            StreamSlot::Idle => {
                if offset != 0 {
                    let error = WriteError::protocol(format!(
                        "stream must begin at offset 0, got {offset}"
                    ));
                    return Err(self.reject(key, error).await);
                }
                if len > self.context.max_packet_bytes {
                    return Err(self.reject(key, self.oversized(len)).await);
                }
                self.start_stream(key).await?;
            }
            StreamSlot::Active(stream) if stream.key != key => {
                let error = still_active(stream.key);
                return Err(self.reject(key, error).await);
            }
            StreamSlot::Active(stream) => {
                if stream.phase != StreamPhase::Receiving {
                    let error = WriteError::protocol("packet after end of stream");
                    return Err(self.fail_active(key, error).await);
                }
                if offset != stream.pos_to_queue {
                    let error = WriteError::protocol(format!(
                        "packet offset {offset} does not match expected offset {}",
                        stream.pos_to_queue
                    ));
                    return Err(self.fail_active(key, error).await);
                }
                if len > self.context.max_packet_bytes {
                    let error = self.oversized(len);
                    return Err(self.fail_active(key, error).await);
                }
            }
        }
        self.enqueue(payload).await
    }

    async fn on_end_of_stream(&mut self, key: StreamKey) -> Result<(), WriteError> {
        let (active, phase) = match &self.slot {
            StreamSlot::Active(stream) => (stream.key, stream.phase),
            StreamSlot::Idle => {
                let error = WriteError::protocol("end of stream without an active stream");
                return Err(self.reject(key, error).await);
            }
        };
        if active != key {
            return Err(self.reject(key, still_active(active)).await);
        }
        if phase != StreamPhase::Receiving {
            let error = WriteError::protocol("duplicate end of stream");
            return Err(self.fail_active(key, error).await);
        }

        let StreamSlot::Active(stream) = &mut self.slot else {
            return Ok(());
        };
        stream.phase = StreamPhase::Draining;
        let outcome = match stream.sender.take() {
            Some(sender) => tokio::select! {
                biased;
                _ = stream.abort.cancelled() => Enqueued::Cancelled,
                sent = sender.finish() => {
                    if sent { Enqueued::Queued } else { Enqueued::WriterGone }
                }
            },
            None => Enqueued::WriterGone,
        };
        debug!(
            session_id = key.session_id.get(),
            block_id = key.block_id.get(),
            bytes = stream.pos_to_queue,
            "end of stream queued"
        );
        self.after_enqueue(outcome).await
    }

    async fn start_stream(&mut self, key: StreamKey) -> Result<(), WriteError> {
        self.context.metrics.record_stream_started();
        let (sender, receiver) = packet_queue(self.context.packet_queue_capacity);
        let abort = self.connection.child_token();
        let target = BlockWriteTarget::new(
            Arc::clone(&self.context.allocator),
            key,
            self.tier_alias.clone(),
        );
        let writer = PacketWriter::new(
            Box::new(target),
            receiver,
            abort.clone(),
            Arc::clone(&self.context.metrics),
        );

        let spawned = tokio::select! {
            biased;
            _ = abort.cancelled() => Err(WriteError::Cancelled),
            spawned = self.context.pool.spawn(writer) => spawned,
        };
        let writer = match spawned {
            Ok(writer) => writer,
            Err(error) => {
                // The stream never became active; answer it here.
                self.streams_closed += 1;
                let response = if error.is_cancelled() {
                    self.context.metrics.record_cancelled();
                    WriteResponse::cancelled(key)
                } else {
                    self.context.metrics.record_failure(&error);
                    warn!(
                        session_id = key.session_id.get(),
                        block_id = key.block_id.get(),
                        code = error.code().as_str(),
                        error = %error,
                        "write stream could not start"
                    );
                    WriteResponse::failed(key, error.status())
                };
                self.respond(response).await;
                return Err(error);
            }
        };

        debug!(
            session_id = key.session_id.get(),
            block_id = key.block_id.get(),
            tier = %self.tier_alias,
            "write stream started"
        );
        self.slot = StreamSlot::Active(Box::new(ActiveStream {
            key,
            phase: StreamPhase::Receiving,
            pos_to_queue: 0,
            sender: Some(sender),
            abort,
            writer,
        }));
        Ok(())
    }

    /// Pushes onto the active stream's queue, pausing while it is full.
    async fn enqueue(&mut self, payload: Bytes) -> Result<(), WriteError> {
        let packet = Packet::new(payload, &self.context.ledger);
        let len = packet.len() as u64;
        let StreamSlot::Active(stream) = &mut self.slot else {
            return Err(WriteError::protocol("no active stream"));
        };
        let Some(sender) = stream.sender.as_ref() else {
            return Err(WriteError::protocol("packet after end of stream"));
        };

        let outcome = match sender.try_push(packet) {
            Ok(()) => Enqueued::Queued,
            Err(PushError::Closed) => Enqueued::WriterGone,
            Err(PushError::Full(packet)) => {
                self.context.metrics.record_backpressure();
                debug!(
                    session_id = stream.key.session_id.get(),
                    block_id = stream.key.block_id.get(),
                    queued = sender.len(),
                    "packet queue full, pausing reads"
                );
                tokio::select! {
                    biased;
                    _ = stream.abort.cancelled() => Enqueued::Cancelled,
                    pushed = sender.push(packet) => match pushed {
                        Ok(()) => Enqueued::Queued,
                        Err(_) => Enqueued::WriterGone,
                    },
                }
            }
        };
        if matches!(outcome, Enqueued::Queued) {
            stream.pos_to_queue += len;
        }
        self.after_enqueue(outcome).await
    }

    async fn after_enqueue(&mut self, outcome: Enqueued) -> Result<(), WriteError> {
        match outcome {
            Enqueued::Queued => Ok(()),
            Enqueued::Cancelled => Err(self.abort_with(WriteError::Cancelled).await),
            Enqueued::WriterGone => {
                let Some(report) = self.join_active().await else {
                    return Err(WriteError::Cancelled);
                };
                let result = report.as_ref().map(|_| ()).map_err(WriteError::clone);
                self.close_active(report, None).await;
                result
            }
        }
    }

    /// Ends the active stream because of a message that broke the protocol.
    async fn fail_active(&mut self, key: StreamKey, error: WriteError) -> WriteError {
        warn!(
            session_id = key.session_id.get(),
            block_id = key.block_id.get(),
            error = %error,
            "aborting write stream on protocol violation"
        );
        let Some(report) = self.abort_active().await else {
            return self.reject(key, error).await;
        };
        let committed = report.is_ok();
        self.close_active(report, Some(error.clone())).await;
        if committed {
            // The block was already written; only the late message fails.
            return self.reject(key, error).await;
        }
        error
    }

    async fn abort_with(&mut self, cause: WriteError) -> WriteError {
        if let Some(report) = self.abort_active().await {
            self.close_active(report, Some(cause.clone())).await;
        }
        cause
    }

    /// Signals the writer to stop and waits for it to release everything.
    async fn abort_active(&mut self) -> Option<WriteReport> {
        let StreamSlot::Active(stream) = &mut self.slot else {
            return None;
        };
        stream.phase = StreamPhase::Aborting;
        stream.abort.cancel();
        stream.sender = None;
        Some(stream.writer.join().await)
    }

    async fn join_active(&mut self) -> Option<WriteReport> {
        match &mut self.slot {
            StreamSlot::Active(stream) => Some(stream.writer.join().await),
            StreamSlot::Idle => None,
        }
    }

    async fn reap_finished_writer(&mut self) {
        let finished =
            matches!(&self.slot, StreamSlot::Active(stream) if stream.writer.is_finished());
        if finished {
            if let Some(report) = self.join_active().await {
                self.close_active(report, None).await;
            }
        }
    }

    /// Takes the stream out of the slot and emits its terminal response.
    ///
    /// A writer that committed reports completion; otherwise a writer failure
    /// wins over `cause`, and `cause` wins over the writer's cancellation.
    async fn close_active(&mut self, report: WriteReport, cause: Option<WriteError>) {
        let StreamSlot::Active(stream) = std::mem::replace(&mut self.slot, StreamSlot::Idle)
        else {
            return;
        };
        stream.abort.cancel();
        self.streams_closed += 1;

        let key = stream.key;
        let metrics = &self.context.metrics;
        let response = match report {
            Ok(summary) => {
                metrics.record_completed();
                debug!(
                    session_id = key.session_id.get(),
                    block_id = key.block_id.get(),
                    bytes = summary.bytes_written,
                    packets = summary.packets_written,
                    "write stream completed"
                );
                WriteResponse::completed(key, summary.bytes_written)
            }
            Err(error) => {
                let error = match cause {
                    Some(cause) if error.is_cancelled() => cause,
                    _ => error,
                };
                if error.is_cancelled() {
                    metrics.record_cancelled();
                    debug!(
                        session_id = key.session_id.get(),
                        block_id = key.block_id.get(),
                        "write stream cancelled"
                    );
                    WriteResponse::cancelled(key)
                } else {
                    metrics.record_failure(&error);
                    warn!(
                        session_id = key.session_id.get(),
                        block_id = key.block_id.get(),
                        code = error.code().as_str(),
                        error = %error,
                        "write stream failed"
                    );
                    WriteResponse::failed(key, error.status())
                }
            }
        };
        drop(stream);
        self.respond(response).await;
    }

    /// Answers a single message without touching the active stream.
    async fn reject(&self, key: StreamKey, error: WriteError) -> WriteError {
        warn!(
            session_id = key.session_id.get(),
            block_id = key.block_id.get(),
            code = error.code().as_str(),
            error = %error,
            "rejected write message"
        );
        self.context.metrics.record_rejected(&error);
        self.respond(WriteResponse::failed(key, error.status())).await;
        error
    }

    async fn respond(&self, response: WriteResponse) {
        if let Err(err) = self.responses.send(response).await {
            debug!(response = ?err.0, "response channel closed, dropping response");
        }
    }

    fn oversized(&self, len: u64) -> WriteError {
        WriteError::protocol(format!(
            "packet of {len} bytes exceeds the {} byte limit",
            self.context.max_packet_bytes
        ))
    }
}

impl Drop for WriteHandler {
    fn drop(&mut self) {
        if let StreamSlot::Active(stream) = &self.slot {
            stream.abort.cancel();
        }
    }
}

fn still_active(active: StreamKey) -> WriteError {
    WriteError::protocol(format!("stream {active} is still active on this connection"))
}
