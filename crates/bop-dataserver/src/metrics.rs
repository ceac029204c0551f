use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::WriteError;

/// Snapshot of write path counters for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteMetricsSnapshot {
    pub streams_started: u64,
    pub streams_completed: u64,
    pub streams_failed: u64,
    pub streams_cancelled: u64,
    pub messages_rejected: u64,
    pub packets_written: u64,
    pub bytes_written: u64,
    pub backpressure_pauses: u64,
    pub last_error: Option<String>,
}

/// Counters shared by every connection of a server.
#[derive(Debug, Default)]
pub struct WriteMetrics {
    streams_started: AtomicU64,
    streams_completed: AtomicU64,
    streams_failed: AtomicU64,
    streams_cancelled: AtomicU64,
    messages_rejected: AtomicU64,
    packets_written: AtomicU64,
    bytes_written: AtomicU64,
    backpressure_pauses: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl WriteMetrics {
    pub(crate) fn record_stream_started(&self) {
        self.streams_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.streams_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, error: &WriteError) {
        self.streams_failed.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(error.to_string());
    }

    pub(crate) fn record_cancelled(&self) {
        self.streams_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self, error: &WriteError) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(error.to_string());
    }

    pub(crate) fn record_packet_written(&self, bytes: u64) {
        self.packets_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_backpressure(&self) {
        self.backpressure_pauses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WriteMetricsSnapshot {
        WriteMetricsSnapshot {
            streams_started: self.streams_started.load(Ordering::Relaxed),
            streams_completed: self.streams_completed.load(Ordering::Relaxed),
            streams_failed: self.streams_failed.load(Ordering::Relaxed),
            streams_cancelled: self.streams_cancelled.load(Ordering::Relaxed),
            messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
            packets_written: self.packets_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            backpressure_pauses: self.backpressure_pauses.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }
}
