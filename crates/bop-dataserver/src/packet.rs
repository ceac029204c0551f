//! Packet payload ownership.
//!
//! A [`Packet`] is owned by exactly one of the network loop, the packet queue
//! or the writer task at any instant. Its payload is released when the packet
//! is dropped; the [`PacketLease`] inside records that release in the shared
//! [`PacketLedger`] so a leak or a double release is observable.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

/// Accounting for packet payloads that are alive somewhere in the data path.
#[derive(Debug, Default)]
pub struct PacketLedger {
    outstanding_packets: AtomicU64,
    outstanding_bytes: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl PacketLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn acquire(&self, bytes: u64) {
        self.acquired.fetch_add(1, Ordering::AcqRel);
        self.outstanding_packets.fetch_add(1, Ordering::AcqRel);
        self.outstanding_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    fn release(&self, bytes: u64) {
        let previous = self.outstanding_packets.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "packet ledger underflow");
        self.outstanding_bytes.fetch_sub(bytes, Ordering::AcqRel);
        self.released.fetch_add(1, Ordering::AcqRel);
    }

    /// Packets whose payload has not been released yet.
    pub fn outstanding_packets(&self) -> u64 {
        self.outstanding_packets.load(Ordering::Acquire)
    }

    pub fn outstanding_bytes(&self) -> u64 {
        self.outstanding_bytes.load(Ordering::Acquire)
    }

    /// Total packets ever admitted.
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Acquire)
    }

    /// Total payload releases.
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }
}

/// RAII guard that releases a packet's accounting when dropped.
#[derive(Debug)]
struct PacketLease {
    ledger: Arc<PacketLedger>,
    bytes: u64,
}

impl Drop for PacketLease {
    fn drop(&mut self) {
        self.ledger.release(self.bytes);
    }
}

/// One received data packet.
///
/// Not `Clone`: moving the packet is the only way to hand it on.
#[derive(Debug)]
pub struct Packet {
    payload: Bytes,
    _lease: PacketLease,
}

impl Packet {
    pub fn new(payload: Bytes, ledger: &Arc<PacketLedger>) -> Self {
        let bytes = payload.len() as u64;
        ledger.acquire(bytes);
        Self {
            payload,
            _lease: PacketLease {
                ledger: Arc::clone(ledger),
                bytes,
            },
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.payload
    }
}
