//! Write-side data path of a bop block storage worker.
//!
//! A connection delivers a stream of block-write packets. The [`WriteHandler`]
//! validates them and pushes each onto a bounded packet queue; a
//! [`PacketWriter`] on the shared [`WriterPool`] drains the queue in order,
//! asking the [`BlockAllocator`] for space before every append. Each stream
//! ends with exactly one [`WriteResponse`].

pub mod allocator;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod local_store;
pub mod metrics;
pub mod packet;
pub mod protocol;
pub mod queue;
pub mod runtime;
pub mod server;
pub mod target;
pub mod test_support;
pub mod tier;
pub mod writer;

pub use allocator::{BlockAllocator, BlockSink};
pub use config::DataServerConfig;
pub use connection::{ConnectionStats, serve_connection};
pub use error::{AllocationError, ConfigError, ErrorCode, ErrorStatus, WriteError};
pub use handler::{HandlerState, WriteContext, WriteHandler};
pub use local_store::{FileBlockSink, LocalBlockStore, LocalBlockStoreConfig};
pub use metrics::{WriteMetrics, WriteMetricsSnapshot};
pub use packet::{Packet, PacketLedger};
pub use protocol::{
    BlockId, InboundEvent, SessionId, StreamKey, WriteRequest, WriteRequestKind, WriteResponse,
};
pub use queue::{PacketReceiver, PacketSender, PushError, QueueItem, packet_queue};
pub use runtime::{DataServerRuntime, DataServerRuntimeOptions, RuntimeError};
pub use server::{DataServer, ServerError};
pub use target::{BlockWriteTarget, WriteTarget};
pub use tier::{DEFAULT_TIER_ALIASES, StorageTierAssoc, TEMP_BLOCK_TIER_ORDINAL};
pub use writer::{PacketWriter, WriteReport, WriteSummary, WriterHandle, WriterPool};
