use std::collections::HashMap as StdHashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bop_dataserver::test_support::{
    AllocatorCall, RecordingAllocator, assert_no_response, next_response, wait_for, wait_until,
};
use bop_dataserver::{
    BlockId, DataServer, DataServerConfig, ErrorCode, InboundEvent, LocalBlockStore,
    LocalBlockStoreConfig, SessionId, StorageTierAssoc, StreamKey, WriteRequest, WriteResponse,
};
use tempfile::TempDir;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::Subscriber;
use tracing::field::{Field, Visit};
use tracing_subscriber::{
    Layer, Registry, layer::Context, layer::SubscriberExt, registry::LookupSpan,
};

const SESSION: SessionId = SessionId::new(42);

fn key(block: i64) -> StreamKey {
    StreamKey::new(SESSION, BlockId::new(block))
}

fn packet(block: i64, offset: u64, bytes: Vec<u8>) -> InboundEvent {
    WriteRequest::packet(SESSION, BlockId::new(block), offset, bytes).into()
}

fn eos(block: i64) -> InboundEvent {
    WriteRequest::end_of_stream(SESSION, BlockId::new(block)).into()
}

struct Connection {
    inbound: mpsc::Sender<InboundEvent>,
    responses: mpsc::Receiver<WriteResponse>,
}

fn server_with(config: DataServerConfig) -> (DataServer, Arc<RecordingAllocator>) {
    let allocator = RecordingAllocator::new();
    let server = DataServer::with_handle(config, allocator.clone(), Handle::current())
        .expect("server");
    (server, allocator)
}

fn connect(server: &DataServer) -> Connection {
    let (inbound, inbound_rx) = mpsc::channel(64);
    let (responses_tx, responses) = mpsc::channel(64);
    drop(server.accept(inbound_rx, responses_tx));
    Connection { inbound, responses }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn three_packet_stream_over_a_connection() {
    let (server, allocator) = server_with(DataServerConfig::default());
    let mut conn = connect(&server);

    conn.inbound.send(packet(1, 0, vec![0xA; 4096])).await.unwrap();
    conn.inbound.send(packet(1, 4096, vec![0xB; 4096])).await.unwrap();
    conn.inbound.send(packet(1, 8192, vec![0xC; 10])).await.unwrap();
    conn.inbound.send(eos(1)).await.unwrap();

    let response = next_response(&mut conn.responses).await;
    assert_eq!(
        response,
        WriteResponse::Completed {
            session_id: SESSION,
            block_id: BlockId::new(1),
            bytes_written: 8202,
        }
    );
    assert_no_response(&mut conn.responses, Duration::from_millis(50)).await;

    assert_eq!(
        allocator.calls(),
        vec![
            AllocatorCall::create_temp(key(1), "MEM", 4096),
            AllocatorCall::reserve_space(key(1), 4096),
            AllocatorCall::reserve_space(key(1), 10),
        ]
    );
    let sink = allocator.sink(key(1)).unwrap();
    let mut expected = vec![0xA; 4096];
    expected.extend(vec![0xB; 4096]);
    expected.extend(vec![0xC; 10]);
    assert_eq!(sink.bytes, expected);
    assert!(sink.committed);

    let metrics = server.metrics();
    assert_eq!(metrics.streams_completed, 1);
    assert_eq!(metrics.packets_written, 3);
    assert_eq!(server.ledger().outstanding_packets(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ordering_holds_across_queue_pauses() {
    let (server, allocator) = server_with(DataServerConfig {
        packet_queue_capacity: 2,
        ..Default::default()
    });
    let mut conn = connect(&server);
    allocator.hold_writes();

    let mut expected = Vec::new();
    let mut offset = 0u64;
    for i in 0..20u8 {
        let bytes: Vec<u8> = (0..(i as usize + 1) * 7).map(|b| b as u8 ^ i).collect();
        expected.extend_from_slice(&bytes);
        let len = bytes.len() as u64;
        conn.inbound.send(packet(2, offset, bytes)).await.unwrap();
        offset += len;
    }
    conn.inbound.send(eos(2)).await.unwrap();

    wait_until(
        || server.metrics().backpressure_pauses >= 1,
        Duration::from_secs(2),
    )
    .await;
    allocator.release_writes();

    let response = next_response(&mut conn.responses).await;
    assert_eq!(
        response,
        WriteResponse::Completed {
            session_id: SESSION,
            block_id: BlockId::new(2),
            bytes_written: expected.len() as u64,
        }
    );
    assert_eq!(allocator.sink(key(2)).unwrap().bytes, expected);
    assert_eq!(allocator.create_calls(), 1);
    assert_eq!(allocator.reserve_calls(), 19);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_second_stream_is_a_protocol_violation() {
    let (server, allocator) = server_with(DataServerConfig::default());
    let mut conn = connect(&server);

    conn.inbound.send(packet(3, 0, vec![1; 16])).await.unwrap();
    conn.inbound.send(packet(4, 0, vec![2; 16])).await.unwrap();
    let rejected = next_response(&mut conn.responses).await;
    assert_eq!(rejected.key(), key(4));
    assert_eq!(
        rejected.error().map(|status| status.code),
        Some(ErrorCode::ProtocolViolation)
    );

    conn.inbound.send(packet(3, 16, vec![3; 16])).await.unwrap();
    conn.inbound.send(eos(3)).await.unwrap();
    let done = next_response(&mut conn.responses).await;
    assert!(done.is_completed());
    assert_eq!(done.key(), key(3));
    assert_eq!(allocator.sink(key(3)).unwrap().bytes.len(), 32);
    assert!(allocator.sink(key(4)).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_releases_queued_packets() {
    let (server, allocator) = server_with(DataServerConfig::default());
    let mut conn = connect(&server);
    allocator.hold_writes();

    for i in 0..5u64 {
        conn.inbound
            .send(packet(5, i * 64, vec![i as u8; 64]))
            .await
            .unwrap();
    }
    let held = Arc::clone(&allocator);
    wait_until(move || held.held_writes() == 1, Duration::from_secs(2)).await;
    conn.inbound.send(InboundEvent::Cancel).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    allocator.release_writes();

    let response = next_response(&mut conn.responses).await;
    assert!(response.is_cancelled());
    assert_no_response(&mut conn.responses, Duration::from_millis(50)).await;

    let sink = allocator.sink(key(5)).unwrap();
    assert!(sink.aborted);
    assert!(!sink.committed);
    assert_eq!(sink.appends, 1);

    let ledger = server.ledger();
    assert_eq!(ledger.outstanding_packets(), 0);
    assert_eq!(ledger.acquired(), 5);
    assert_eq!(ledger.released(), 5);
    assert_eq!(server.metrics().streams_cancelled, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn io_fault_on_packet_k_is_terminal_and_singular() {
    const N: u64 = 6;
    const K: u64 = 3;
    let (server, allocator) = server_with(DataServerConfig::default());
    let mut conn = connect(&server);
    allocator.fail_append_at(K);
    allocator.hold_writes();

    for i in 0..N {
        conn.inbound
            .send(packet(6, i * 32, vec![i as u8; 32]))
            .await
            .unwrap();
    }
    conn.inbound.send(eos(6)).await.unwrap();
    let inbound = conn.inbound.clone();
    wait_until(
        move || inbound.capacity() == inbound.max_capacity(),
        Duration::from_secs(2),
    )
    .await;
    allocator.release_writes();

    let response = next_response(&mut conn.responses).await;
    assert_eq!(response.key(), key(6));
    assert_eq!(
        response.error().map(|status| status.code),
        Some(ErrorCode::IoFailure)
    );
    assert_no_response(&mut conn.responses, Duration::from_millis(100)).await;

    let sink = allocator.sink(key(6)).unwrap();
    assert_eq!(sink.appends, K);
    assert_eq!(sink.bytes.len() as u64, (K - 1) * 32);
    assert!(sink.aborted);
    assert!(!sink.committed);
    // One create plus a reservation for packets 2..=K only.
    assert_eq!(allocator.calls().len() as u64, K);
    assert_eq!(server.ledger().outstanding_packets(), 0);
    assert_eq!(server.metrics().streams_failed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_cancels_active_streams() {
    let (server, allocator) = server_with(DataServerConfig::default());
    let (inbound, inbound_rx) = mpsc::channel(8);
    let (responses_tx, mut responses) = mpsc::channel(8);
    let connection = server.accept(inbound_rx, responses_tx);
    allocator.hold_writes();

    inbound.send(packet(7, 0, vec![9; 8])).await.unwrap();
    let held = Arc::clone(&allocator);
    wait_until(move || held.held_writes() == 1, Duration::from_secs(2)).await;

    server.shutdown();
    tokio::time::sleep(Duration::from_millis(20)).await;
    allocator.release_writes();

    let response = next_response(&mut responses).await;
    assert!(response.is_cancelled());
    let stats = tokio::time::timeout(Duration::from_secs(2), connection)
        .await
        .expect("connection loop exits")
        .unwrap();
    assert_eq!(stats.requests, 1);
    assert!(server.is_shutdown());
    assert_eq!(server.active_writers(), 0);
}

#[test]
fn owned_runtime_shutdown_answers_active_streams() {
    let allocator = RecordingAllocator::new();
    let server = DataServer::new(
        DataServerConfig {
            runtime_worker_threads: Some(2),
            shutdown_timeout_ms: 2_000,
            ..Default::default()
        },
        allocator.clone(),
    )
    .unwrap();
    let (inbound, inbound_rx) = mpsc::channel(8);
    let (responses_tx, mut responses) = mpsc::channel(8);
    let _connection = server.accept(inbound_rx, responses_tx);

    inbound.blocking_send(packet(10, 0, vec![3; 8])).unwrap();
    let appended = Arc::clone(&allocator);
    wait_for(
        move || appended.sink(key(10)).is_some_and(|s| s.appends == 1),
        Duration::from_secs(2),
    );

    server.shutdown();
    assert!(server.is_shutdown());

    let response = responses
        .blocking_recv()
        .expect("active stream is answered before the runtime stops");
    assert_eq!(response.key(), key(10));
    assert!(response.is_cancelled(), "unexpected {response:?}");
    assert!(responses.blocking_recv().is_none());

    let sink = allocator.sink(key(10)).unwrap();
    assert!(sink.aborted);
    assert!(!sink.committed);
    assert_eq!(server.ledger().outstanding_packets(), 0);
}

#[test]
fn local_block_store_end_to_end() {
    let temp = TempDir::new().unwrap();
    let store = LocalBlockStore::open(
        LocalBlockStoreConfig {
            root_dir: temp.path().to_path_buf(),
            capacity_bytes: 1 << 20,
        },
        StorageTierAssoc::worker_default(),
    )
    .unwrap();
    let server = DataServer::new(
        DataServerConfig {
            runtime_worker_threads: Some(2),
            shutdown_timeout_ms: 500,
            ..Default::default()
        },
        store.clone(),
    )
    .unwrap();

    let (inbound, inbound_rx) = mpsc::channel(16);
    let (responses_tx, mut responses) = mpsc::channel(16);
    let _connection = server.accept(inbound_rx, responses_tx);

    let chunks: Vec<Vec<u8>> = (0..4u8).map(|i| vec![b'a' + i; 1000]).collect();
    let mut offset = 0;
    for chunk in &chunks {
        inbound
            .blocking_send(packet(8, offset, chunk.clone()))
            .unwrap();
        offset += chunk.len() as u64;
    }
    inbound.blocking_send(eos(8)).unwrap();

    let response = responses.blocking_recv().expect("response");
    assert!(response.is_completed(), "unexpected {response:?}");
    assert_eq!(store.temp_block_len(SESSION, BlockId::new(8)).unwrap(), 4000);
    assert_eq!(store.used_bytes(), 4000);

    let committed = store.commit_block(SESSION, BlockId::new(8)).unwrap();
    assert_eq!(std::fs::read(committed).unwrap(), chunks.concat());
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn allocation_failure_reaches_the_client() {
    let temp = TempDir::new().unwrap();
    let store = LocalBlockStore::open(
        LocalBlockStoreConfig {
            root_dir: temp.path().to_path_buf(),
            capacity_bytes: 100,
        },
        StorageTierAssoc::worker_default(),
    )
    .unwrap();
    let server =
        DataServer::with_handle(DataServerConfig::default(), store.clone(), Handle::current())
            .unwrap();
    let mut conn = connect(&server);

    conn.inbound.send(packet(9, 0, vec![1; 80])).await.unwrap();
    conn.inbound.send(packet(9, 80, vec![2; 80])).await.unwrap();

    let response = next_response(&mut conn.responses).await;
    let status = response.error().expect("error response");
    assert_eq!(status.code, ErrorCode::AllocationFailure);
    assert!(status.message.contains("no space"), "{}", status.message);
    assert_eq!(store.temp_block_len(SESSION, BlockId::new(9)).unwrap(), 80);
}

#[derive(Clone, Debug)]
struct CapturedEvent {
    fields: StdHashMap<String, String>,
}

#[derive(Clone)]
struct RecordingLayer {
    events: Arc<StdMutex<Vec<CapturedEvent>>>,
}

struct FieldVisitor<'a> {
    fields: &'a mut StdHashMap<String, String>,
}

impl Visit for FieldVisitor<'_> {
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), value.to_string());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.fields
            .insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.fields
            .insert(field.name().to_string(), format!("{value:?}"));
    }
}

impl<S> Layer<S> for RecordingLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut captured = CapturedEvent {
            fields: StdHashMap::new(),
        };
        event.record(&mut FieldVisitor {
            fields: &mut captured.fields,
        });
        if let Ok(mut events) = self.events.lock() {
            events.push(captured);
        }
    }
}

// Current-thread runtime so the handler's events land on the subscribed thread.
#[tokio::test]
async fn failures_are_logged_with_error_codes() {
    let events = Arc::new(StdMutex::new(Vec::new()));
    let subscriber = Registry::default().with(RecordingLayer {
        events: events.clone(),
    });
    let _guard = tracing::subscriber::set_default(subscriber);

    let (server, allocator) = server_with(DataServerConfig::default());
    allocator.fail_append_at(1);
    let (responses_tx, mut responses) = mpsc::channel(8);
    let mut handler = server.handler(responses_tx);

    let rejected = handler
        .handle(WriteRequest::end_of_stream(SESSION, BlockId::new(10)))
        .await;
    assert!(rejected.is_err());
    assert!(next_response(&mut responses).await.error().is_some());

    handler
        .handle(WriteRequest::packet(SESSION, BlockId::new(11), 0, vec![1; 4]))
        .await
        .unwrap();
    let report = handler.writer_exited().await;
    handler.on_writer_exit(report).await;
    let failed = next_response(&mut responses).await;
    assert_eq!(
        failed.error().map(|status| status.code),
        Some(ErrorCode::IoFailure)
    );

    let events = events.lock().unwrap();
    let codes: Vec<&str> = events
        .iter()
        .filter_map(|event| event.fields.get("code").map(String::as_str))
        .collect();
    assert!(codes.contains(&"protocol_violation"), "{codes:?}");
    assert!(codes.contains(&"io_failure"), "{codes:?}");
    let failure = events
        .iter()
        .find(|event| {
            event.fields.get("message").map(String::as_str) == Some("write stream failed")
        })
        .expect("stream failure event");
    assert_eq!(failure.fields.get("block_id").map(String::as_str), Some("11"));
}
