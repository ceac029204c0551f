//! Logical messages exchanged with a write client.
//!
//! Framing and transport live outside this crate; the decoder hands the
//! connection loop fully typed [`WriteRequest`]s and the loop emits
//! [`WriteResponse`]s. Cancellation and transport failures arrive out of band
//! as [`InboundEvent::Cancel`] / [`InboundEvent::Error`].

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ErrorStatus;

/// Client session that owns a temp block.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SessionId(pub i64);

impl SessionId {
    #[inline]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Block being written.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BlockId(pub i64);

impl BlockId {
    #[inline]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the temp block targeted by a stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub session_id: SessionId,
    pub block_id: BlockId,
}

impl StreamKey {
    pub const fn new(session_id: SessionId, block_id: BlockId) -> Self {
        Self {
            session_id,
            block_id,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session={} block={}", self.session_id, self.block_id)
    }
}

/// Message type carried by a [`WriteRequest`].
#[derive(Debug)]
pub enum WriteRequestKind {
    /// Bytes to append at `offset`.
    Packet { offset: u64, payload: Bytes },
    /// No more packets follow for this stream.
    EndOfStream,
}

/// One decoded write-request message.
#[derive(Debug)]
pub struct WriteRequest {
    pub session_id: SessionId,
    pub block_id: BlockId,
    pub kind: WriteRequestKind,
}

impl WriteRequest {
    pub fn packet(
        session_id: SessionId,
        block_id: BlockId,
        offset: u64,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            session_id,
            block_id,
            kind: WriteRequestKind::Packet {
                offset,
                payload: payload.into(),
            },
        }
    }

    pub fn end_of_stream(session_id: SessionId, block_id: BlockId) -> Self {
        Self {
            session_id,
            block_id,
            kind: WriteRequestKind::EndOfStream,
        }
    }

    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.session_id, self.block_id)
    }
}

/// Terminal answer for a stream, or the rejection of a single message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WriteResponse {
    Completed {
        session_id: SessionId,
        block_id: BlockId,
        bytes_written: u64,
    },
    Failed {
        session_id: SessionId,
        block_id: BlockId,
        error: ErrorStatus,
    },
    Cancelled {
        session_id: SessionId,
        block_id: BlockId,
    },
}

impl WriteResponse {
    pub(crate) fn completed(key: StreamKey, bytes_written: u64) -> Self {
        Self::Completed {
            session_id: key.session_id,
            block_id: key.block_id,
            bytes_written,
        }
    }

    pub(crate) fn failed(key: StreamKey, error: ErrorStatus) -> Self {
        Self::Failed {
            session_id: key.session_id,
            block_id: key.block_id,
            error,
        }
    }

    pub(crate) fn cancelled(key: StreamKey) -> Self {
        Self::Cancelled {
            session_id: key.session_id,
            block_id: key.block_id,
        }
    }

    pub fn key(&self) -> StreamKey {
        match self {
            WriteResponse::Completed {
                session_id,
                block_id,
                ..
            }
            | WriteResponse::Failed {
                session_id,
                block_id,
                ..
            }
            | WriteResponse::Cancelled {
                session_id,
                block_id,
            } => StreamKey::new(*session_id, *block_id),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, WriteResponse::Completed { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, WriteResponse::Cancelled { .. })
    }

    pub fn error(&self) -> Option<&ErrorStatus> {
        match self {
            WriteResponse::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Everything the connection loop can receive from the transport.
#[derive(Debug)]
pub enum InboundEvent {
    Request(WriteRequest),
    /// Client asked to abandon the active stream.
    Cancel,
    /// Transport-level failure; the connection is going away.
    Error(String),
}

impl From<WriteRequest> for InboundEvent {
    fn from(value: WriteRequest) -> Self {
        InboundEvent::Request(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn response_serializes_with_status_tag() {
        let key = StreamKey::new(SessionId::new(7), BlockId::new(42));
        let json = serde_json::to_value(WriteResponse::completed(key, 8202)).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["session_id"], 7);
        assert_eq!(json["block_id"], 42);
        assert_eq!(json["bytes_written"], 8202);

        let failed = WriteResponse::failed(
            key,
            ErrorStatus {
                code: ErrorCode::IoFailure,
                message: "boom".into(),
            },
        );
        let decoded: WriteResponse =
            serde_json::from_str(&serde_json::to_string(&failed).unwrap()).unwrap();
        assert_eq!(decoded, failed);
        assert_eq!(decoded.key(), key);
        assert_eq!(decoded.error().map(|e| e.code), Some(ErrorCode::IoFailure));
    }

    #[test]
    fn request_key_names_target_block() {
        let request = WriteRequest::packet(SessionId::new(1), BlockId::new(2), 0, vec![1u8, 2]);
        assert_eq!(request.key().to_string(), "session=1 block=2");
    }
}
