//! What a packet writer needs from the thing being written.
//!
//! The write protocol is the same for every destination; a destination only
//! supplies space for the first write, space for each later write, and a
//! writable sink. [`BlockWriteTarget`] is the temp-block destination.

use std::sync::Arc;

use crate::allocator::{BlockAllocator, BlockSink};
use crate::error::WriteError;
use crate::protocol::StreamKey;

pub trait WriteTarget: Send {
    fn key(&self) -> StreamKey;

    /// Prepare the destination for the first `len` bytes of the stream.
    fn allocate_first_write(&mut self, len: u64) -> Result<(), WriteError>;

    /// Make room for `len` more bytes after the first write.
    fn allocate_continuation(&mut self, len: u64) -> Result<(), WriteError>;

    /// Sink to append to. Only valid after the first allocation.
    fn writable_sink(&mut self) -> Result<&mut dyn BlockSink, WriteError>;

    /// Close the sink, finalizing the written bytes.
    fn commit(&mut self) -> Result<(), WriteError>;

    /// Close the sink without finalizing. Safe to call more than once.
    fn abort(&mut self);
}

/// Temp block destination backed by a [`BlockAllocator`].
pub struct BlockWriteTarget {
    allocator: Arc<dyn BlockAllocator>,
    key: StreamKey,
    tier_alias: String,
    sink: Option<Box<dyn BlockSink>>,
}

impl BlockWriteTarget {
    pub fn new(allocator: Arc<dyn BlockAllocator>, key: StreamKey, tier_alias: String) -> Self {
        Self {
            allocator,
            key,
            tier_alias,
            sink: None,
        }
    }
}

impl std::fmt::Debug for BlockWriteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockWriteTarget")
            .field("key", &self.key)
            .field("tier_alias", &self.tier_alias)
            .field("sink_open", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

impl WriteTarget for BlockWriteTarget {
    fn key(&self) -> StreamKey {
        self.key
    }

    fn allocate_first_write(&mut self, len: u64) -> Result<(), WriteError> {
        if self.sink.is_some() {
            return Err(WriteError::protocol(format!(
                "temp block already created for {}",
                self.key
            )));
        }
        let sink = self.allocator.create_temp(
            self.key.session_id,
            self.key.block_id,
            &self.tier_alias,
            len,
        )?;
        self.sink = Some(sink);
        Ok(())
    }

    fn allocate_continuation(&mut self, len: u64) -> Result<(), WriteError> {
        self.allocator
            .reserve_space(self.key.session_id, self.key.block_id, len)?;
        Ok(())
    }

    fn writable_sink(&mut self) -> Result<&mut dyn BlockSink, WriteError> {
        match self.sink.as_deref_mut() {
            Some(sink) => Ok(sink),
            None => Err(WriteError::Io(format!("no open sink for {}", self.key))),
        }
    }

    fn commit(&mut self) -> Result<(), WriteError> {
        match self.sink.take() {
            Some(sink) => sink.commit().map_err(WriteError::from),
            None => Ok(()),
        }
    }

    fn abort(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.abort();
        }
    }
}

impl Drop for BlockWriteTarget {
    fn drop(&mut self) {
        self.abort();
    }
}
