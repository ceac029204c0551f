//! Test doubles for the write path: a recording, fault-injecting allocator with
//! in-memory sinks, plus helpers for waiting on asynchronous outcomes.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;

use crate::allocator::{BlockAllocator, BlockSink};
use crate::error::AllocationError;
use crate::protocol::{BlockId, SessionId, StreamKey, WriteResponse};

/// One call observed by [`RecordingAllocator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocatorCall {
    CreateTemp {
        key: StreamKey,
        tier_alias: String,
        initial_bytes: u64,
    },
    ReserveSpace {
        key: StreamKey,
        additional_bytes: u64,
    },
}

impl AllocatorCall {
    pub fn create_temp(key: StreamKey, tier_alias: &str, initial_bytes: u64) -> Self {
        Self::CreateTemp {
            key,
            tier_alias: tier_alias.to_string(),
            initial_bytes,
        }
    }

    pub fn reserve_space(key: StreamKey, additional_bytes: u64) -> Self {
        Self::ReserveSpace {
            key,
            additional_bytes,
        }
    }
}

/// What happened to one in-memory sink.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkRecord {
    pub bytes: Vec<u8>,
    /// Append attempts, including a failing one.
    pub appends: u64,
    pub committed: bool,
    pub aborted: bool,
}

#[derive(Debug, Default)]
struct AllocatorState {
    calls: Vec<AllocatorCall>,
    sinks: HashMap<StreamKey, SinkRecord>,
    reserves: u64,
    appends: u64,
    fail_append_at: Option<u64>,
    fail_reserve_at: Option<u64>,
    fail_create: Option<AllocationError>,
    panic_on_append: bool,
}

/// Blocks sink appends while closed.
#[derive(Debug, Default)]
struct WriteGate {
    closed: Mutex<bool>,
    waiting: Mutex<usize>,
    cv: Condvar,
}

impl WriteGate {
    fn wait(&self) {
        let mut closed = self.closed.lock();
        if !*closed {
            return;
        }
        *self.waiting.lock() += 1;
        while *closed {
            self.cv.wait(&mut closed);
        }
        *self.waiting.lock() -= 1;
    }

    fn set(&self, closed: bool) {
        *self.closed.lock() = closed;
        self.cv.notify_all();
    }
}

/// Allocator that records every call and hands out in-memory sinks.
#[derive(Debug, Default)]
pub struct RecordingAllocator {
    state: Arc<Mutex<AllocatorState>>,
    gate: Arc<WriteGate>,
}

impl RecordingAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<AllocatorCall> {
        self.state.lock().calls.clone()
    }

    pub fn create_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, AllocatorCall::CreateTemp { .. }))
            .count()
    }

    pub fn reserve_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, AllocatorCall::ReserveSpace { .. }))
            .count()
    }

    pub fn sink(&self, key: StreamKey) -> Option<SinkRecord> {
        self.state.lock().sinks.get(&key).cloned()
    }

    /// Fail the `n`-th append (1-based, counted across all sinks).
    pub fn fail_append_at(&self, n: u64) {
        self.state.lock().fail_append_at = Some(n);
    }

    /// Fail the `n`-th reserve call (1-based) with `NoSpace`.
    pub fn fail_reserve_at(&self, n: u64) {
        self.state.lock().fail_reserve_at = Some(n);
    }

    pub fn fail_create(&self, error: AllocationError) {
        self.state.lock().fail_create = Some(error);
    }

    pub fn panic_on_append(&self) {
        self.state.lock().panic_on_append = true;
    }

    /// Make every append block until [`release_writes`](Self::release_writes).
    pub fn hold_writes(&self) {
        self.gate.set(true);
    }

    pub fn release_writes(&self) {
        self.gate.set(false);
    }

    /// Appends currently parked on the gate.
    pub fn held_writes(&self) -> usize {
        *self.gate.waiting.lock()
    }
}

impl BlockAllocator for RecordingAllocator {
    fn create_temp(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        tier_alias: &str,
        initial_bytes: u64,
    ) -> Result<Box<dyn BlockSink>, AllocationError> {
        let key = StreamKey::new(session_id, block_id);
        let mut state = self.state.lock();
        state
            .calls
            .push(AllocatorCall::create_temp(key, tier_alias, initial_bytes));
        if let Some(error) = state.fail_create.clone() {
            return Err(error);
        }
        if state.sinks.contains_key(&key) {
            return Err(AllocationError::AlreadyExists {
                session_id,
                block_id,
            });
        }
        state.sinks.insert(key, SinkRecord::default());
        Ok(Box::new(MemorySink {
            key,
            position: 0,
            state: Arc::clone(&self.state),
            gate: Arc::clone(&self.gate),
        }))
    }

    fn reserve_space(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        additional_bytes: u64,
    ) -> Result<(), AllocationError> {
        let key = StreamKey::new(session_id, block_id);
        let mut state = self.state.lock();
        state
            .calls
            .push(AllocatorCall::reserve_space(key, additional_bytes));
        state.reserves += 1;
        if state.fail_reserve_at == Some(state.reserves) {
            return Err(AllocationError::NoSpace {
                requested: additional_bytes,
                available: 0,
            });
        }
        if !state.sinks.contains_key(&key) {
            return Err(AllocationError::NotFound {
                session_id,
                block_id,
            });
        }
        Ok(())
    }
}

struct MemorySink {
    key: StreamKey,
    position: u64,
    state: Arc<Mutex<AllocatorState>>,
    gate: Arc<WriteGate>,
}

impl BlockSink for MemorySink {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.gate.wait();
        let mut state = self.state.lock();
        state.appends += 1;
        let attempt = state.appends;
        let fail = state.fail_append_at == Some(attempt);
        let panic = state.panic_on_append;
        if let Some(record) = state.sinks.get_mut(&self.key) {
            record.appends += 1;
            if !fail && !panic {
                record.bytes.extend_from_slice(data);
            }
        }
        drop(state);

        if panic {
            panic!("injected panic on append {attempt}");
        }
        if fail {
            return Err(io::Error::other(format!(
                "injected append failure {attempt}"
            )));
        }
        self.position += data.len() as u64;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn commit(self: Box<Self>) -> io::Result<()> {
        if let Some(record) = self.state.lock().sinks.get_mut(&self.key) {
            record.committed = true;
        }
        Ok(())
    }

    fn abort(self: Box<Self>) {
        if let Some(record) = self.state.lock().sinks.get_mut(&self.key) {
            record.aborted = true;
        }
    }
}

/// Polls `predicate` until it holds, panicking after `timeout`.
pub fn wait_for<F: Fn() -> bool>(predicate: F, timeout: Duration) {
    let start = Instant::now();
    while !predicate() {
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Async flavour of [`wait_for`].
pub async fn wait_until<F: Fn() -> bool>(predicate: F, timeout: Duration) {
    let start = Instant::now();
    while !predicate() {
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Next response, panicking if none arrives within five seconds.
pub async fn next_response(responses: &mut mpsc::Receiver<WriteResponse>) -> WriteResponse {
    match tokio::time::timeout(Duration::from_secs(5), responses.recv()).await {
        Ok(Some(response)) => response,
        Ok(None) => panic!("response channel closed"),
        Err(_) => panic!("no response within 5s"),
    }
}

/// Asserts that no response shows up within `window`.
pub async fn assert_no_response(responses: &mut mpsc::Receiver<WriteResponse>, window: Duration) {
    if let Ok(Some(response)) = tokio::time::timeout(window, responses.recv()).await {
        panic!("unexpected response {response:?}");
    }
}
