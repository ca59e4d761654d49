//! End-to-end behavior of the multiplexer over an in-memory stream log.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use streampoll::{
    CancelToken, Cursor, CursorSet, EntryId, Fields, IdRequest, LogStore, Multiplexer, MuxConfig,
    ReadOutcome, ReaderStatus, Result, StoreError, StreamLog, StreamName,
};

const DELIVERY: Duration = Duration::from_secs(5);

fn start(store: &Arc<StreamLog>) -> Multiplexer {
    let store: Arc<dyn LogStore> = Arc::clone(store) as Arc<dyn LogStore>;
    Multiplexer::start(store, MuxConfig::default()).unwrap()
}

fn append(store: &StreamLog, stream: &str, id: &str, fields: Fields) -> EntryId {
    store
        .append(&StreamName::from(stream), id.parse().unwrap(), fields)
        .unwrap()
}

fn blocked_on(pairs: &[(&str, u64)]) -> ReaderStatus {
    let snapshot: CursorSet = pairs
        .iter()
        .map(|(stream, cursor)| (StreamName::from(*stream), Cursor(*cursor)))
        .collect();
    ReaderStatus::Blocked(snapshot)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + DELIVERY;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lower_cursor_restarts_read() {
    let store = Arc::new(StreamLog::in_memory());
    let mux = start(&store);

    let high = mux.register("s", Cursor(7));
    wait_until(|| mux.reader_status() == blocked_on(&[("s", 7)])).await;

    let low = mux.register("s", Cursor(3));
    wait_until(|| mux.reader_status() == blocked_on(&[("s", 3)])).await;
    assert_eq!(mux.stats().restarts, 1);

    append(&store, "s", "5-0", Fields::new().with("n", "5"));

    let delivered = low.recv_timeout(DELIVERY).await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].id, EntryId::new(5, 0));

    // Cursor 7 has nothing newer yet and stays parked.
    wait_until(|| mux.reader_status() == blocked_on(&[("s", 7)])).await;
    assert_eq!(mux.waiter_count(), 1);
    drop(high);
    wait_until(|| mux.waiter_count() == 0).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_higher_or_equal_cursor_keeps_read() {
    let store = Arc::new(StreamLog::in_memory());
    let mux = start(&store);

    let _first = mux.register("s", Cursor(3));
    wait_until(|| mux.reader_status() == blocked_on(&[("s", 3)])).await;
    let reads = mux.stats().reads_issued;

    let _same = mux.register("s", Cursor(3));
    let _higher = mux.register("s", Cursor(9));

    assert_eq!(mux.stats().restarts, 0);
    assert_eq!(mux.stats().reads_issued, reads);
    assert_eq!(mux.reader_status(), blocked_on(&[("s", 3)]));
    assert_eq!(mux.waiter_count(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_new_stream_restarts_read() {
    let store = Arc::new(StreamLog::in_memory());
    let mux = start(&store);

    let _a = mux.register("a", Cursor(10));
    wait_until(|| mux.reader_status() == blocked_on(&[("a", 10)])).await;

    let b = mux.register("b", Cursor(0));
    wait_until(|| mux.reader_status() == blocked_on(&[("a", 10), ("b", 0)])).await;
    assert_eq!(mux.stats().restarts, 1);

    append(&store, "b", "1-0", Fields::new().with("k", "v"));
    let delivered = b.recv_timeout(DELIVERY).await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(mux.stream_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_only_waiters_below_entry_are_satisfied() {
    let store = Arc::new(StreamLog::in_memory());
    let mux = start(&store);

    let low = mux.register("s", Cursor(3));
    let mut high = mux.register("s", Cursor(7));
    wait_until(|| mux.reader_status() == blocked_on(&[("s", 3)])).await;

    append(&store, "s", "5-0", Fields::new().with("n", "5"));

    let delivered = low.recv_timeout(DELIVERY).await;
    assert_eq!(delivered.len(), 1);
    assert!(high.try_recv().is_none());
    assert_eq!(mux.waiter_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_removes_only_that_waiter() {
    let store = Arc::new(StreamLog::in_memory());
    let mux = start(&store);

    let impatient = mux.register("s", Cursor(4));
    let patient = mux.register("s", Cursor(4));

    let expired = impatient.recv_timeout(Duration::from_millis(30)).await;
    assert!(expired.is_empty());
    assert_eq!(mux.waiter_count(), 1);

    append(&store, "s", "5-0", Fields::new().with("n", "5"));
    let delivered = patient.recv_timeout(DELIVERY).await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(mux.waiter_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_orders_scenario() {
    let store = Arc::new(StreamLog::in_memory());
    let mux = start(&store);

    let before = mux.register("orders", Cursor(4));
    wait_until(|| mux.reader_status() == blocked_on(&[("orders", 4)])).await;

    append(&store, "orders", "5-0", Fields::new().with("a", "1"));
    let delivered = before.recv_timeout(DELIVERY).await;
    let fields: Vec<Fields> = delivered.into_iter().map(|entry| entry.fields).collect();
    assert_eq!(fields, vec![Fields::new().with("a", "1")]);

    let after = mux
        .wait("orders", Cursor(5), Duration::from_millis(50))
        .await;
    assert!(after.is_empty());
    assert_eq!(mux.waiter_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_existing_entries_are_delivered_immediately() {
    let store = Arc::new(StreamLog::in_memory());
    append(&store, "s", "1-0", Fields::new().with("n", "1"));
    append(&store, "s", "2-0", Fields::new().with("n", "2"));
    append(&store, "s", "2-1", Fields::new().with("n", "2b"));
    let mux = start(&store);

    let from_one = mux.wait("s", Cursor(1), DELIVERY).await;
    let ids: Vec<EntryId> = from_one.iter().map(|entry| entry.id).collect();
    assert_eq!(ids, vec![EntryId::new(2, 0), EntryId::new(2, 1)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delivered_waiter_is_gone() {
    let store = Arc::new(StreamLog::in_memory());
    let mux = start(&store);

    let wait = mux.register("s", Cursor(0));
    append(&store, "s", "1-0", Fields::new());
    assert_eq!(wait.recv_timeout(DELIVERY).await.len(), 1);

    assert_eq!(mux.waiter_count(), 0);
    assert_eq!(mux.stream_count(), 0);
    wait_until(|| mux.reader_status() == ReaderStatus::Idle).await;
    assert_eq!(mux.stats().delivered, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_many_waiters_across_streams() {
    let store = Arc::new(StreamLog::in_memory());
    let mux = Arc::new(start(&store));

    let mut handles = Vec::new();
    for i in 0..40u64 {
        let mux = Arc::clone(&mux);
        let stream = format!("doc-{}", i % 4);
        handles.push(tokio::spawn(async move {
            mux.wait(stream, Cursor(i % 3), DELIVERY).await
        }));
    }
    wait_until(|| mux.waiter_count() == 40).await;

    for doc in 0..4 {
        append(&store, &format!("doc-{doc}"), "10-0", Fields::new().with("doc", doc.to_string()));
    }

    for handle in handles {
        let delivered = handle.await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].id, EntryId::new(10, 0));
    }
    assert_eq!(mux.waiter_count(), 0);
}

/// Fails the first few reads, then behaves like the wrapped log.
struct FlakyStore {
    inner: StreamLog,
    failures_left: AtomicUsize,
}

impl LogStore for FlakyStore {
    fn append(&self, stream: &StreamName, id: IdRequest, fields: Fields) -> Result<EntryId> {
        self.inner.append(stream, id, fields)
    }

    fn blocking_read(
        &self,
        cursors: &CursorSet,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ReadOutcome> {
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Io(std::io::Error::other("connection reset")));
        }
        self.inner.blocking_read(cursors, timeout, cancel)
    }

    fn tail_id(&self, stream: &StreamName) -> Result<Option<EntryId>> {
        self.inner.tail_id(stream)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_read_failures_are_retried() {
    let store = Arc::new(FlakyStore {
        inner: StreamLog::in_memory(),
        failures_left: AtomicUsize::new(3),
    });
    let mux = Multiplexer::start(
        Arc::clone(&store) as Arc<dyn LogStore>,
        MuxConfig::default(),
    )
    .unwrap();

    let wait = mux.register("s", Cursor(0));
    store
        .append(&StreamName::from("s"), IdRequest::Explicit(EntryId::new(1, 0)), Fields::new())
        .unwrap();

    assert_eq!(wait.recv_timeout(DELIVERY).await.len(), 1);
    assert_eq!(mux.stats().read_failures, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_short_read_timeout_reissues() {
    let store = Arc::new(StreamLog::in_memory());
    let mux = Multiplexer::start(
        Arc::clone(&store) as Arc<dyn LogStore>,
        MuxConfig {
            read_timeout: Duration::from_millis(10),
        },
    )
    .unwrap();

    let wait = mux.register("s", Cursor(0));
    wait_until(|| mux.stats().reads_issued >= 3).await;

    append(&store, "s", "1-0", Fields::new());
    assert_eq!(wait.recv_timeout(DELIVERY).await.len(), 1);
}

/// Holds its first read at a gate, deaf to cancellation, then reads normally.
struct GatedStore {
    inner: StreamLog,
    gate: crossbeam_channel::Receiver<()>,
    gated: AtomicBool,
}

impl LogStore for GatedStore {
    fn append(&self, stream: &StreamName, id: IdRequest, fields: Fields) -> Result<EntryId> {
        self.inner.append(stream, id, fields)
    }

    fn blocking_read(
        &self,
        cursors: &CursorSet,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ReadOutcome> {
        if !self.gated.swap(true, Ordering::SeqCst) {
            let _ = self.gate.recv();
            // Complete with whatever the stale snapshot sees.
            return self
                .inner
                .blocking_read(cursors, timeout, &CancelToken::new());
        }
        self.inner.blocking_read(cursors, timeout, cancel)
    }

    fn tail_id(&self, stream: &StreamName) -> Result<Option<EntryId>> {
        self.inner.tail_id(stream)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_read_finishing_after_restart_is_discarded() {
    let (open_gate, gate) = crossbeam_channel::bounded(1);
    let store = Arc::new(GatedStore {
        inner: StreamLog::in_memory(),
        gate,
        gated: AtomicBool::new(false),
    });
    let mux = Multiplexer::start(
        Arc::clone(&store) as Arc<dyn LogStore>,
        MuxConfig::default(),
    )
    .unwrap();

    let high = mux.register("s", Cursor(7));
    wait_until(|| mux.reader_status() == blocked_on(&[("s", 7)])).await;

    append(&store.inner, "s", "5-0", Fields::new().with("n", "5"));
    append(&store.inner, "s", "8-0", Fields::new().with("n", "8"));
    let low = mux.register("s", Cursor(3));
    assert_eq!(mux.reader_status(), ReaderStatus::Restarting);

    // The read still covers only cursor 7 and returns 8-0 alone. Dispatching
    // it would hand cursor 3 a batch without 5-0.
    open_gate.send(()).unwrap();

    let low_ids: Vec<EntryId> = low
        .recv_timeout(DELIVERY)
        .await
        .into_iter()
        .map(|entry| entry.id)
        .collect();
    assert_eq!(low_ids, vec![EntryId::new(5, 0), EntryId::new(8, 0)]);

    let high_ids: Vec<EntryId> = high
        .recv_timeout(DELIVERY)
        .await
        .into_iter()
        .map(|entry| entry.id)
        .collect();
    assert_eq!(high_ids, vec![EntryId::new(8, 0)]);

    let stats = mux.stats();
    assert_eq!(stats.restarts, 1);
    assert!(stats.reads_issued >= 2);
}
