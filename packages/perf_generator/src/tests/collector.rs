use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Barrier, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use crate::{
    collector::{AtomicTransactionStatus, CollectorPool, CollectorResultCode, ResponseMessage, TransactionStatus},
    config::CollectorConfig,
    model::{ReplicaId, RequestType},
    ports::CompletionCallback,
};

fn response(transaction_id: &str, sender_id: ReplicaId, payload: &[u8]) -> ResponseMessage {
    ResponseMessage {
        transaction_id: transaction_id.to_string(),
        sender_id,
        response_type: RequestType::Response,
        payload: payload.to_vec(),
    }
}

/// Callback counting its invocations and keeping the last payload.
fn recording_callback() -> (Arc<AtomicUsize>, Arc<Mutex<Option<Vec<u8>>>>, impl Fn() -> CompletionCallback) {
    let calls = Arc::new(AtomicUsize::new(0));
    let payload = Arc::new(Mutex::new(None));
    let (c, p) = (Arc::clone(&calls), Arc::clone(&payload));
    let make = move || -> CompletionCallback {
        let (c, p) = (Arc::clone(&c), Arc::clone(&p));
        Box::new(move |data: &[u8]| {
            c.fetch_add(1, Ordering::SeqCst);
            *p.lock().unwrap() = Some(data.to_vec());
        })
    };
    (calls, payload, make)
}

#[test]
fn callback_fires_on_third_matching_response() {
    let pool = CollectorPool::new(3, CollectorConfig::default());
    let (calls, payload, callback) = recording_callback();

    assert_eq!(pool.add_response_msg(response("tx-7", 1, b"result"), callback()), CollectorResultCode::Created);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(pool.add_response_msg(response("tx-7", 2, b"result"), callback()), CollectorResultCode::Incremented);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(pool.add_response_msg(response("tx-7", 3, b"result"), callback()), CollectorResultCode::QuorumReached);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(payload.lock().unwrap().as_deref(), Some(&b"result"[..]));
    assert_eq!(pool.status_of("tx-7"), Some(TransactionStatus::Done));
}

#[test]
fn non_matching_response_does_not_count_towards_quorum() {
    let pool = CollectorPool::new(3, CollectorConfig::default());
    let (calls, payload, callback) = recording_callback();

    pool.add_response_msg(response("tx-9", 1, b"ok"), callback());
    pool.add_response_msg(response("tx-9", 2, b"ok"), callback());
    assert_eq!(pool.add_response_msg(response("tx-9", 3, b"forged"), callback()), CollectorResultCode::Incremented);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(pool.received_count("tx-9"), Some(2));

    assert_eq!(pool.add_response_msg(response("tx-9", 4, b"ok"), callback()), CollectorResultCode::QuorumReached);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(payload.lock().unwrap().as_deref(), Some(&b"ok"[..]));
}

#[test]
fn late_responses_after_done_are_ignored() {
    let pool = CollectorPool::new(2, CollectorConfig::default());
    let (calls, payload, callback) = recording_callback();

    pool.add_response_msg(response("tx-1", 1, b"ok"), callback());
    pool.add_response_msg(response("tx-1", 2, b"ok"), callback());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(pool.add_response_msg(response("tx-1", 2, b"ok"), callback()), CollectorResultCode::AlreadyDone);
    assert_eq!(pool.add_response_msg(response("tx-1", 3, b"ok"), callback()), CollectorResultCode::AlreadyDone);
    assert_eq!(pool.add_response_msg(response("tx-1", 4, b"other"), callback()), CollectorResultCode::AlreadyDone);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(pool.received_count("tx-1"), Some(2));
    assert_eq!(payload.lock().unwrap().as_deref(), Some(&b"ok"[..]));
}

#[test]
fn repeated_sender_is_counted_once() {
    let pool = CollectorPool::new(2, CollectorConfig::default());
    let (calls, _, callback) = recording_callback();

    pool.add_response_msg(response("tx-2", 1, b"ok"), callback());
    assert_eq!(pool.add_response_msg(response("tx-2", 1, b"ok"), callback()), CollectorResultCode::DuplicateSender);
    assert_eq!(pool.add_response_msg(response("tx-2", 1, b"changed"), callback()), CollectorResultCode::DuplicateSender);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(pool.status_of("tx-2"), Some(TransactionStatus::Pending));
}

#[test]
fn quorum_of_one_completes_on_first_response() {
    let pool = CollectorPool::new(1, CollectorConfig::default());
    let (calls, _, callback) = recording_callback();

    assert_eq!(pool.add_response_msg(response("tx-3", 1, b"ok"), callback()), CollectorResultCode::QuorumReached);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn only_replica_responses_move_the_status() {
    let pool = CollectorPool::new(1, CollectorConfig::default());
    let (calls, _, callback) = recording_callback();

    let mut message = response("tx-4", 1, b"ok");
    message.response_type = RequestType::ClientRequest;
    assert_eq!(pool.add_response_msg(message, callback()), CollectorResultCode::Created);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let status = AtomicTransactionStatus::new(TransactionStatus::Pending);
    assert!(!pool.may_consensus_change_status(RequestType::Custom(1), 5, &status));
    assert!(!pool.may_consensus_change_status(RequestType::Response, 0, &status));
    assert!(pool.may_consensus_change_status(RequestType::Response, 1, &status));
    assert!(!pool.may_consensus_change_status(RequestType::Response, 2, &status));
    assert_eq!(status.load(), TransactionStatus::Committed);
}

#[test]
fn only_the_callback_of_the_first_response_is_kept() {
    let pool = CollectorPool::new(2, CollectorConfig::default());
    let (first_calls, _, first) = recording_callback();
    let (second_calls, _, second) = recording_callback();

    pool.add_response_msg(response("tx-5", 1, b"ok"), first());
    pool.add_response_msg(response("tx-5", 2, b"ok"), second());

    assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    assert_eq!(second_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn concurrent_quorum_is_reached_exactly_once() {
    for round in 0..50 {
        let quorum = 3;
        let pool = Arc::new(CollectorPool::new(quorum, CollectorConfig::default()));
        let (calls, _, callback) = recording_callback();
        let callback = Arc::new(callback);
        let barrier = Arc::new(Barrier::new(quorum));
        let transaction_id = format!("tx-{round}");

        let handles: Vec<_> = (0..quorum as ReplicaId)
            .map(|sender| {
                let pool = Arc::clone(&pool);
                let callback = Arc::clone(&callback);
                let barrier = Arc::clone(&barrier);
                let transaction_id = transaction_id.clone();
                thread::spawn(move || {
                    barrier.wait();
                    pool.add_response_msg(response(&transaction_id, sender, b"same"), callback())
                })
            })
            .collect();

        let codes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = codes.iter().filter(|c| **c == CollectorResultCode::QuorumReached).count();
        assert_eq!(winners, 1, "round {round}: {codes:?}");
        assert!(codes
            .iter()
            .all(|c| matches!(c, CollectorResultCode::QuorumReached | CollectorResultCode::Created | CollectorResultCode::Incremented)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn concurrent_duplicates_never_fire_twice() {
    let pool = Arc::new(CollectorPool::new(2, CollectorConfig::default()));
    let (calls, _, callback) = recording_callback();
    let callback = Arc::new(callback);

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let pool = Arc::clone(&pool);
            let callback = Arc::clone(&callback);
            thread::spawn(move || {
                for i in 0..200 {
                    pool.add_response_msg(response(&format!("tx-{i}"), (t % 4) as ReplicaId, b"ok"), callback());
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 200);
    assert_eq!(pool.stats().completed, 200);
}

fn short_retention() -> CollectorConfig {
    CollectorConfig {
        done_retention_ms: 20,
        pending_timeout_ms: 40,
        sweep_interval_ms: 0,
        sweep_batch: 1_024,
        max_records: 1_000,
    }
}

#[test]
fn sweep_evicts_done_and_expired_records() {
    let pool = CollectorPool::new(2, short_retention());
    let (_, _, callback) = recording_callback();

    pool.add_response_msg(response("done", 1, b"ok"), callback());
    pool.add_response_msg(response("done", 2, b"ok"), callback());
    pool.add_response_msg(response("stuck", 1, b"ok"), callback());
    assert_eq!(pool.len(), 2);
    assert_eq!(pool.pending_eviction_entries(), 2);

    let now = Instant::now();
    assert_eq!(pool.sweep(now).evicted_done, 0);
    assert_eq!(pool.len(), 2);

    let report = pool.sweep(now + Duration::from_millis(30));
    assert_eq!(report.evicted_done, 1);
    assert_eq!(report.expired_pending, 0);
    assert_eq!(pool.status_of("done"), None);
    assert_eq!(pool.status_of("stuck"), Some(TransactionStatus::Pending));

    let report = pool.sweep(now + Duration::from_millis(100));
    assert_eq!(report.expired_pending, 1);
    assert!(pool.is_empty());

    let stats = pool.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.evicted_done, 1);
    assert_eq!(stats.expired_pending, 1);
}

#[test]
fn pool_stays_bounded_under_sustained_load() {
    let config = CollectorConfig {
        max_records: 1_000_000,
        ..short_retention()
    };
    let pool = CollectorPool::new(1, config);
    let (calls, _, callback) = recording_callback();

    let started = Instant::now();
    let mut i = 0_u64;
    while started.elapsed() < Duration::from_millis(200) {
        pool.add_response_msg(response(&format!("tx-{i}"), 1, b"ok"), callback());
        i += 1;
        if i % 100 == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }

    assert_eq!(calls.load(Ordering::SeqCst) as u64, i);
    let stats = pool.stats();
    assert!(stats.evicted_done > 0);
    assert_eq!(stats.rejected, 0);
    assert!((pool.len() as u64) < i, "{} of {i} records still tracked", pool.len());
}

#[test]
fn full_pool_rejects_new_transactions() {
    let config = CollectorConfig {
        max_records: 2,
        sweep_interval_ms: 60_000,
        ..CollectorConfig::default()
    };
    let pool = CollectorPool::new(2, config);
    let (calls, _, callback) = recording_callback();

    pool.add_response_msg(response("a", 1, b"ok"), callback());
    pool.add_response_msg(response("b", 1, b"ok"), callback());
    assert_eq!(pool.add_response_msg(response("c", 1, b"ok"), callback()), CollectorResultCode::Rejected);
    assert_eq!(pool.stats().rejected, 1);

    // known transactions still complete
    assert_eq!(pool.add_response_msg(response("a", 2, b"ok"), callback()), CollectorResultCode::QuorumReached);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(pool.finalize("a"));
    assert!(!pool.finalize("b"), "pending transactions are not finalized");
    assert_eq!(pool.add_response_msg(response("c", 1, b"ok"), callback()), CollectorResultCode::Created);
}

#[test]
fn late_quorum_after_retention_does_not_complete_again() {
    let pool = CollectorPool::new(2, short_retention());
    let (calls, _, callback) = recording_callback();

    pool.add_response_msg(response("tx-1", 1, b"ok"), callback());
    assert_eq!(pool.add_response_msg(response("tx-1", 2, b"ok"), callback()), CollectorResultCode::QuorumReached);

    let report = pool.sweep(Instant::now() + Duration::from_millis(30));
    assert_eq!(report.evicted_done, 1);
    assert_eq!(pool.status_of("tx-1"), None);

    // the remaining replicas alone would form a second quorum
    assert_eq!(pool.add_response_msg(response("tx-1", 3, b"ok"), callback()), CollectorResultCode::AlreadyDone);
    assert_eq!(pool.add_response_msg(response("tx-1", 4, b"ok"), callback()), CollectorResultCode::AlreadyDone);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().completed, 1);
    assert!(pool.is_empty());
}

#[test]
fn batch_ids_below_the_closed_floor_are_done() {
    let pool = CollectorPool::new(1, CollectorConfig::default());
    let (calls, _, callback) = recording_callback();

    for id in ["7-1", "7-2"] {
        assert_eq!(pool.add_response_msg(response(id, 1, b"ok"), callback()), CollectorResultCode::QuorumReached);
        assert!(pool.finalize(id));
    }
    assert_eq!(pool.closed_len(), 0, "contiguous batch ids collapse into the floor");

    assert_eq!(pool.add_response_msg(response("7-1", 2, b"ok"), callback()), CollectorResultCode::AlreadyDone);
    assert_eq!(pool.add_response_msg(response("7-2", 3, b"ok"), callback()), CollectorResultCode::AlreadyDone);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // the same batch id of another proxy is a different transaction
    assert_eq!(pool.add_response_msg(response("8-1", 1, b"ok"), callback()), CollectorResultCode::QuorumReached);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn record_is_dropped_once_every_replica_answered() {
    let pool = CollectorPool::new(2, CollectorConfig::default()).with_replica_num(4);
    let (calls, _, callback) = recording_callback();

    pool.add_response_msg(response("3-1", 1, b"ok"), callback());
    assert_eq!(pool.add_response_msg(response("3-1", 2, b"ok"), callback()), CollectorResultCode::QuorumReached);
    assert_eq!(pool.add_response_msg(response("3-1", 3, b"ok"), callback()), CollectorResultCode::AlreadyDone);
    assert_eq!(pool.status_of("3-1"), Some(TransactionStatus::Done));

    assert_eq!(pool.add_response_msg(response("3-1", 4, b"bad"), callback()), CollectorResultCode::AlreadyDone);
    assert_eq!(pool.status_of("3-1"), None);
    assert_eq!(pool.stats().evicted_done, 1);

    assert_eq!(pool.add_response_msg(response("3-1", 4, b"bad"), callback()), CollectorResultCode::AlreadyDone);
    assert_eq!(pool.add_response_msg(response("3-1", 1, b"ok"), callback()), CollectorResultCode::AlreadyDone);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(pool.is_empty());
}

#[test]
fn all_replicas_answering_before_quorum_retires_on_completion() {
    let pool = CollectorPool::new(3, CollectorConfig::default()).with_replica_num(3);
    let (calls, _, callback) = recording_callback();

    pool.add_response_msg(response("tx-6", 1, b"ok"), callback());
    pool.add_response_msg(response("tx-6", 2, b"ok"), callback());
    assert_eq!(pool.add_response_msg(response("tx-6", 3, b"ok"), callback()), CollectorResultCode::QuorumReached);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(pool.status_of("tx-6"), None);
    assert_eq!(pool.add_response_msg(response("tx-6", 3, b"ok"), callback()), CollectorResultCode::AlreadyDone);
}

#[test]
fn sweep_forced_by_a_full_pool_is_bounded() {
    let config = CollectorConfig {
        pending_timeout_ms: 10,
        sweep_interval_ms: 60_000,
        sweep_batch: 1,
        max_records: 2,
        ..CollectorConfig::default()
    };
    let pool = CollectorPool::new(2, config);
    let (_, _, callback) = recording_callback();

    pool.add_response_msg(response("a", 1, b"ok"), callback());
    pool.add_response_msg(response("b", 1, b"ok"), callback());
    thread::sleep(Duration::from_millis(20));

    assert_eq!(pool.add_response_msg(response("c", 1, b"ok"), callback()), CollectorResultCode::Created);
    assert_eq!(pool.stats().expired_pending, 1, "one sweep batch per new transaction");
    assert_eq!(pool.status_of("a"), None);
    assert_eq!(pool.status_of("b"), Some(TransactionStatus::Pending));

    assert_eq!(pool.add_response_msg(response("d", 1, b"ok"), callback()), CollectorResultCode::Created);
    assert_eq!(pool.stats().expired_pending, 2);
    assert_eq!(pool.len(), 2);
}
