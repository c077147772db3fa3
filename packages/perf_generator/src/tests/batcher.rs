use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crate::{
    batcher::{BatchDispatcher, BatchLimits},
    converter::ClientRequestConverter,
    errors::{SignError, TransportError},
    metrics::{GeneratorCounters, LogStats},
    model::{BatchUserRequest, ReplicaId, Request},
    ports::{DefaultDispatchHooks, DispatchHooks, DropReason, ReplicaCommunicatorType, SignerType},
    queue::{QueueItem, StagingQueue},
    tests::test_utils::{MockSigner, MockTransport, RecordingTransport},
};

struct Fixture {
    queue: Arc<StagingQueue>,
    stop: Arc<AtomicBool>,
    counters: Arc<GeneratorCounters>,
    stats: Arc<LogStats>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            queue: Arc::new(StagingQueue::new(1_000)),
            stop: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(GeneratorCounters::default()),
            stats: Arc::new(LogStats::new()),
        }
    }

    fn dispatcher(&self, transport: Arc<ReplicaCommunicatorType>, signer: Option<Arc<SignerType>>, limits: BatchLimits) -> BatchDispatcher {
        self.dispatcher_with_hooks(transport, signer, limits, Arc::new(DefaultDispatchHooks))
    }

    fn dispatcher_with_hooks(
        &self,
        transport: Arc<ReplicaCommunicatorType>,
        signer: Option<Arc<SignerType>>,
        limits: BatchLimits,
        hooks: Arc<dyn DispatchHooks>,
    ) -> BatchDispatcher {
        BatchDispatcher::new(
            7,
            Arc::clone(&self.queue),
            Arc::clone(&self.stop),
            Arc::new(ClientRequestConverter::new(7, signer)),
            transport,
            hooks,
            self.stats.clone(),
            Arc::clone(&self.counters),
            limits,
        )
    }

    fn push(&self, count: usize) {
        for i in 0..count {
            self.queue.try_push(QueueItem::new(format!("req-{i}").into_bytes())).unwrap();
        }
    }
}

fn limits(min: usize, max: usize) -> BatchLimits {
    BatchLimits {
        min_batch_size: min,
        max_batch_size: max,
        batch_timeout: Duration::from_millis(20),
        idle_sleep: Duration::from_micros(100),
    }
}

fn items(count: usize) -> Vec<QueueItem> {
    (0..count).map(|i| QueueItem::new(vec![i as u8])).collect()
}

#[test]
fn batch_is_sent_to_primary() {
    let fixture = Fixture::new();
    let transport = RecordingTransport::new(3);
    let dispatcher = fixture.dispatcher(transport.clone(), None, limits(1, 10));

    assert_eq!(dispatcher.do_batch(items(4)), Ok(3));
    assert_eq!(dispatcher.do_batch(items(2)), Ok(3));

    let batches = transport.sent_batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].user_requests.len(), 4);
    assert_eq!(batches[0].proxy_id, 7);
    assert_ne!(batches[0].batch_id, batches[1].batch_id);
    assert_eq!(fixture.counters.batch_num.load(Ordering::Relaxed), 2);
    assert_eq!(fixture.stats.snapshot().batches, 2);
}

#[test]
fn sign_failure_drops_batch_without_dispatch() {
    let fixture = Fixture::new();
    let mut transport = MockTransport::new();
    transport.expect_resolve_primary().never();
    transport.expect_send_message().never();

    let mut signer = MockSigner::new();
    signer.expect_sign_message().once().returning(|_| Err(SignError::new("hsm offline".into())));

    let dispatcher = fixture.dispatcher(Arc::new(transport), Some(Arc::new(signer)), limits(1, 10));
    assert_eq!(dispatcher.do_batch(items(3)), Err(DropReason::Conversion));
    assert_eq!(fixture.counters.dropped_batch_num.load(Ordering::Relaxed), 1);
    assert_eq!(fixture.counters.batch_num.load(Ordering::Relaxed), 0);
}

#[test]
fn unknown_primary_drops_batch() {
    let fixture = Fixture::new();
    let mut transport = MockTransport::new();
    transport
        .expect_resolve_primary()
        .once()
        .returning(|| Err(TransportError::new_primary_unknown("view change in progress".into())));
    transport.expect_send_message().never();

    let dispatcher = fixture.dispatcher(Arc::new(transport), None, limits(1, 10));
    assert_eq!(dispatcher.do_batch(items(1)), Err(DropReason::PrimaryUnknown));
    assert_eq!(fixture.stats.snapshot().dropped, 1);
}

#[test]
fn send_failure_drops_batch() {
    let fixture = Fixture::new();
    let mut transport = MockTransport::new();
    transport.expect_resolve_primary().returning(|| Ok(1));
    transport
        .expect_send_message()
        .once()
        .returning(|_, _| Err(TransportError::new_send("connection reset".into(), "io".into())));

    let dispatcher = fixture.dispatcher(Arc::new(transport), None, limits(1, 10));
    assert_eq!(dispatcher.do_batch(items(2)), Err(DropReason::Transport));
    assert_eq!(fixture.counters.dropped_batch_num.load(Ordering::Relaxed), 1);
}

#[test]
fn signed_batch_reaches_transport() {
    let fixture = Fixture::new();
    let mut signer = MockSigner::new();
    signer.expect_sign_message().once().returning(|_| Ok(crate::model::Signature(vec![9; 64])));

    let mut transport = MockTransport::new();
    transport.expect_resolve_primary().returning(|| Ok(2));
    transport
        .expect_send_message()
        .once()
        .withf(|replica, envelope| {
            let request = Request::from_envelope(envelope).unwrap();
            *replica == 2 && request.data_signature().map(|s| s.0.len()) == Some(64)
        })
        .returning(|_, _| Ok(()));

    let dispatcher = fixture.dispatcher(Arc::new(transport), Some(Arc::new(signer)), limits(1, 10));
    assert_eq!(dispatcher.do_batch(items(1)), Ok(2));
}

struct FixedPrimary {
    primary: ReplicaId,
    post_sends: AtomicU64,
}

impl DispatchHooks for FixedPrimary {
    fn get_primary(&self, _transport: &ReplicaCommunicatorType) -> Result<ReplicaId, TransportError> {
        Ok(self.primary)
    }

    fn post_send(&self) {
        self.post_sends.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn hooks_choose_primary_and_observe_sends() {
    let fixture = Fixture::new();
    let hooks = Arc::new(FixedPrimary {
        primary: 5,
        post_sends: AtomicU64::new(0),
    });
    let mut transport = MockTransport::new();
    transport.expect_resolve_primary().never();
    transport.expect_send_message().times(2).returning(|_, _| Ok(()));

    let dispatcher = fixture.dispatcher_with_hooks(Arc::new(transport), None, limits(1, 10), hooks.clone());
    assert_eq!(dispatcher.do_batch(items(1)), Ok(5));
    assert_eq!(dispatcher.do_batch(items(1)), Ok(5));
    assert_eq!(hooks.post_sends.load(Ordering::Relaxed), 2);
}

#[test]
fn collect_batch_respects_max_size() {
    let fixture = Fixture::new();
    fixture.push(25);
    let dispatcher = fixture.dispatcher(RecordingTransport::new(1), None, limits(1, 10));

    assert_eq!(dispatcher.collect_batch().len(), 10);
    assert_eq!(dispatcher.collect_batch().len(), 10);
    assert_eq!(dispatcher.collect_batch().len(), 5);
    assert!(dispatcher.collect_batch().is_empty());
}

#[test]
fn collect_batch_waits_for_min_size_until_timeout() {
    let fixture = Fixture::new();
    fixture.push(3);
    let dispatcher = fixture.dispatcher(RecordingTransport::new(1), None, limits(5, 10));

    let started = Instant::now();
    let batch = dispatcher.collect_batch();
    assert_eq!(batch.len(), 3);
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[test]
fn batcher_thread_sends_everything_and_stops() {
    let fixture = Fixture::new();
    let transport = RecordingTransport::new(1);
    let handle = fixture.dispatcher(transport.clone(), None, limits(1, 8)).spawn().unwrap();

    fixture.push(50);
    let deadline = Instant::now() + Duration::from_secs(5);
    while fixture.queue.popped_count() < 50 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    fixture.stop.store(true, Ordering::Release);
    handle.join().unwrap();

    let sent: usize = transport.sent_batches().iter().map(|b: &BatchUserRequest| b.user_requests.len()).sum();
    assert_eq!(sent, 50);
    assert!(transport.sent_batches().iter().all(|b| b.user_requests.len() <= 8));
}

#[test]
fn batcher_thread_keeps_sending_after_a_dropped_batch() {
    let fixture = Fixture::new();
    let sends = Arc::new(AtomicU64::new(0));
    let mut transport = MockTransport::new();
    transport.expect_resolve_primary().returning(|| Ok(1));
    let calls = Arc::clone(&sends);
    transport.expect_send_message().returning(move |_, _| {
        if calls.fetch_add(1, Ordering::Relaxed) == 0 {
            Err(TransportError::new_send("connection reset".into(), "io".into()))
        } else {
            Ok(())
        }
    });

    let handle = fixture.dispatcher(Arc::new(transport), None, limits(1, 1)).spawn().unwrap();
    fixture.push(3);

    let deadline = Instant::now() + Duration::from_secs(5);
    while sends.load(Ordering::Relaxed) < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    fixture.stop.store(true, Ordering::Release);
    handle.join().unwrap();

    assert_eq!(fixture.counters.dropped_batch_num.load(Ordering::Relaxed), 1);
    assert_eq!(fixture.counters.batch_num.load(Ordering::Relaxed), 2);
}
