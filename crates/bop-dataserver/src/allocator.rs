//! Storage manager capabilities consumed by the write path.

use std::io;

use crate::error::AllocationError;
use crate::protocol::{BlockId, SessionId};

/// Appendable handle to a temp block's byte channel.
///
/// A sink has exactly one writer: the packet writer task that created it.
pub trait BlockSink: Send {
    /// Append all of `data` at the current end of the block.
    fn append(&mut self, data: &[u8]) -> io::Result<()>;

    /// Bytes appended so far.
    fn position(&self) -> u64;

    /// Close the sink, making every appended byte durable.
    fn commit(self: Box<Self>) -> io::Result<()>;

    /// Close the sink without finalizing. Best effort; partial bytes stay behind
    /// for the allocator to clean up.
    fn abort(self: Box<Self>);
}

/// Creates temp blocks and reserves space for them.
///
/// Both calls may block on disk or metadata I/O and are only made from the
/// packet writer task.
pub trait BlockAllocator: Send + Sync {
    /// Create the temp block `(session_id, block_id)` on tier `tier_alias` with
    /// room for `initial_bytes`, and return its sink.
    fn create_temp(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        tier_alias: &str,
        initial_bytes: u64,
    ) -> Result<Box<dyn BlockSink>, AllocationError>;

    /// Grow the reservation of an existing temp block by `additional_bytes`.
    fn reserve_space(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        additional_bytes: u64,
    ) -> Result<(), AllocationError>;
}
