mod closed;
mod record;

pub use record::{AtomicTransactionStatus, TransactionRecord, TransactionStatus};

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Instant,
};

use ahash::AHashMap;

use crate::{
    config::CollectorConfig,
    crypto::calculate_hash,
    model::{ReplicaId, RequestType},
    ports::CompletionCallback,
};
use closed::ClosedTransactions;
use record::VoteOutcome;

/// A single replica response routed to the collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMessage {
    pub transaction_id: String,
    pub sender_id: ReplicaId,
    pub response_type: RequestType,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CollectorResultCode {
    /// First response for this transaction, the record was created.
    Created,
    /// Counted, quorum not reached yet.
    Incremented,
    /// The sender has already answered this transaction. Not counted.
    DuplicateSender,
    /// This response completed the quorum and the callback was invoked.
    QuorumReached,
    /// The transaction has completed before. Ignored.
    AlreadyDone,
    /// The pool is full, the transaction is not tracked.
    Rejected,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectorStats {
    pub tracked: usize,
    pub completed: u64,
    pub evicted_done: u64,
    pub expired_pending: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted_done: usize,
    pub expired_pending: usize,
}

struct EvictionEntry {
    deadline: Instant,
    transaction_id: String,
}

struct Records {
    active: AHashMap<String, Arc<TransactionRecord>>,
    /// Completed transactions already removed from `active`.
    closed: ClosedTransactions,
}

enum Lookup {
    Found(Arc<TransactionRecord>),
    Created(Arc<TransactionRecord>),
    Closed,
    Full,
}

/// Deadlines grow monotonically within each queue, so a sweep only looks at the front.
#[derive(Default)]
struct EvictionQueues {
    pending: VecDeque<EvictionEntry>,
    done: VecDeque<EvictionEntry>,
}

/// Tracks responses per transaction until `quorum` matching responses arrive.
///
/// Locks held here guard O(1) work only. Callbacks run outside of any lock, on the thread delivering the deciding response.
///
/// A completed transaction leaves the pool once every replica has answered it, or after `done_retention`.
/// Its id is then remembered in a bounded index, so late responses never open a second round.
pub struct CollectorPool {
    quorum: usize,
    replica_num: Option<usize>,
    config: CollectorConfig,
    records: Mutex<Records>,
    eviction: Mutex<EvictionQueues>,
    epoch: Instant,
    last_sweep_ms: AtomicU64,
    completed: AtomicU64,
    evicted_done: AtomicU64,
    expired_pending: AtomicU64,
    rejected: AtomicU64,
}

impl CollectorPool {
    pub fn new(quorum: usize, config: CollectorConfig) -> Self {
        Self {
            quorum: quorum.max(1),
            replica_num: None,
            records: Mutex::new(Records {
                active: AHashMap::new(),
                closed: ClosedTransactions::new(config.max_records),
            }),
            config,
            eviction: Mutex::new(EvictionQueues::default()),
            epoch: Instant::now(),
            last_sweep_ms: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            evicted_done: AtomicU64::new(0),
            expired_pending: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Size of the replica set. A completed transaction is dropped as soon as all of them have answered.
    pub fn with_replica_num(mut self, replica_num: usize) -> Self {
        self.replica_num = Some(replica_num);
        self
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Counts the response. `call_back` is kept only when this response creates the record,
    /// it is invoked at most once, when the quorum of matching responses is reached.
    pub fn add_response_msg(&self, response: ResponseMessage, call_back: CompletionCallback) -> CollectorResultCode {
        let now = Instant::now();
        self.maybe_sweep(now);

        let (record, created) = match self.get_or_create(&response.transaction_id, call_back, now) {
            Lookup::Found(record) => (record, false),
            Lookup::Created(record) => (record, true),
            Lookup::Closed => return CollectorResultCode::AlreadyDone,
            Lookup::Full => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Collector pool is full ({} records). Response for '{}' from replica {} is not tracked.",
                    self.config.max_records,
                    response.transaction_id,
                    response.sender_id
                );
                return CollectorResultCode::Rejected;
            }
        };

        let fingerprint = calculate_hash(&response.payload);
        let outcome = record.vote(response.sender_id, fingerprint, &response.payload, |received_count, status| {
            self.may_consensus_change_status(response.response_type, received_count, status)
        });

        match outcome {
            VoteOutcome::Closed { voters } => {
                if record.status() == TransactionStatus::Done {
                    self.retire_if_all_answered(&response.transaction_id, voters);
                }
                CollectorResultCode::AlreadyDone
            }
            VoteOutcome::DuplicateSender => {
                log::debug!("Replica {} has already answered '{}'", response.sender_id, response.transaction_id);
                CollectorResultCode::DuplicateSender
            }
            VoteOutcome::Counted { .. } if created => CollectorResultCode::Created,
            VoteOutcome::Counted { .. } => CollectorResultCode::Incremented,
            VoteOutcome::Committed { payload } => {
                if let Some(call_back) = record.take_call_back() {
                    call_back(&payload);
                }
                let done_at = Instant::now();
                record.mark_done(done_at);
                self.completed.fetch_add(1, Ordering::Relaxed);
                // late senders may have answered while the callback ran
                if !self.retire_if_all_answered(&response.transaction_id, record.voters_count()) {
                    self.schedule_done_eviction(response.transaction_id, done_at);
                }
                CollectorResultCode::QuorumReached
            }
        }
    }

    /// Decides whether the record leaves `Pending`. Only replica responses count towards the quorum.
    ///
    /// The change is a single compare-and-exchange, of all concurrent callers only one can observe `true`.
    pub fn may_consensus_change_status(&self, response_type: RequestType, received_count: usize, status: &AtomicTransactionStatus) -> bool {
        if response_type != RequestType::Response {
            return false;
        }
        received_count >= self.quorum && status.transition(TransactionStatus::Pending, TransactionStatus::Committed)
    }

    pub fn status_of(&self, transaction_id: &str) -> Option<TransactionStatus> {
        self.find(transaction_id).map(|r| r.status())
    }

    pub fn received_count(&self, transaction_id: &str) -> Option<usize> {
        self.find(transaction_id).map(|r| r.received_count())
    }

    pub fn len(&self) -> usize {
        self.lock_records().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            tracked: self.len(),
            completed: self.completed.load(Ordering::Relaxed),
            evicted_done: self.evicted_done.load(Ordering::Relaxed),
            expired_pending: self.expired_pending.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Number of completed transactions remembered outside the pool, beyond the per-proxy floors.
    pub fn closed_len(&self) -> usize {
        self.lock_records().closed.tracked()
    }

    /// Forgets a completed transaction right away. Pending transactions are left alone.
    /// Later responses for it are still answered with [`CollectorResultCode::AlreadyDone`].
    pub fn finalize(&self, transaction_id: &str) -> bool {
        let closed = {
            let mut records = self.lock_records();
            Self::close_done(&mut records, transaction_id)
        };
        if closed {
            self.evicted_done.fetch_add(1, Ordering::Relaxed);
        }
        closed
    }

    fn retire_if_all_answered(&self, transaction_id: &str, voters: usize) -> bool {
        match self.replica_num {
            Some(replica_num) if voters >= replica_num => self.finalize(transaction_id),
            _ => false,
        }
    }

    fn close_done(records: &mut Records, transaction_id: &str) -> bool {
        let is_done = records.active.get(transaction_id).map(|r| r.status() == TransactionStatus::Done).unwrap_or(false);
        if is_done {
            records.active.remove(transaction_id);
            records.closed.close(transaction_id);
        }
        is_done
    }

    /// Evicts records whose retention or pending timeout has passed by `now`. Inspects at most `limit` due entries.
    pub fn sweep_with_limit(&self, now: Instant, limit: usize) -> SweepReport {
        let (due_pending, due_done) = {
            let mut queues = self.eviction.lock().unwrap_or_else(PoisonError::into_inner);
            let pending = Self::drain_due(&mut queues.pending, now, limit);
            let done = Self::drain_due(&mut queues.done, now, limit.saturating_sub(pending.len()));
            (pending, done)
        };

        if due_pending.is_empty() && due_done.is_empty() {
            return SweepReport::default();
        }

        let mut report = SweepReport::default();
        let mut expired = Vec::new();
        {
            let mut records = self.lock_records();
            for entry in due_pending.iter().chain(due_done.iter()) {
                let Some(record) = records.active.get(&entry.transaction_id) else {
                    continue;
                };
                match record.status() {
                    TransactionStatus::Done => {
                        let retained = record.done_at().map(|t| t + self.config.done_retention() > now).unwrap_or(true);
                        if !retained && Self::close_done(&mut records, &entry.transaction_id) {
                            report.evicted_done += 1;
                        }
                    }
                    TransactionStatus::Pending => {
                        if record.created_at() + self.config.pending_timeout() <= now {
                            // logged once the pool lock is released
                            if let Some(record) = records.active.remove(&entry.transaction_id) {
                                expired.push((entry.transaction_id.as_str(), record));
                            }
                        }
                    }
                    // callback in flight, the done entry scheduled afterwards takes care of it
                    TransactionStatus::Committed => {}
                }
            }
        }
        report.expired_pending = expired.len();

        for (transaction_id, record) in &expired {
            log::debug!(
                "Transaction '{transaction_id}' expired with {} matching of {} required responses",
                record.received_count(),
                self.quorum
            );
        }
        if !expired.is_empty() {
            log::warn!(
                "{} transactions expired after {:?} without reaching quorum",
                expired.len(),
                self.config.pending_timeout()
            );
        }

        self.evicted_done.fetch_add(report.evicted_done as u64, Ordering::Relaxed);
        self.expired_pending.fetch_add(report.expired_pending as u64, Ordering::Relaxed);
        if report.evicted_done > 0 || report.expired_pending > 0 {
            log::debug!("Collector sweep {:?}", report);
        }
        report
    }

    pub fn sweep(&self, now: Instant) -> SweepReport {
        self.sweep_with_limit(now, self.config.sweep_batch)
    }

    fn drain_due(queue: &mut VecDeque<EvictionEntry>, now: Instant, limit: usize) -> Vec<EvictionEntry> {
        let mut due = Vec::new();
        while due.len() < limit {
            match queue.front() {
                Some(entry) if entry.deadline <= now => {
                    if let Some(entry) = queue.pop_front() {
                        due.push(entry);
                    }
                }
                _ => break,
            }
        }
        due
    }

    fn maybe_sweep(&self, now: Instant) {
        let now_ms = now.saturating_duration_since(self.epoch).as_millis() as u64;
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < self.config.sweep_interval_ms {
            return;
        }
        // one sweeper at a time, others carry on with their response
        if self.last_sweep_ms.compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
            self.sweep(now);
        }
    }

    fn get_or_create(&self, transaction_id: &str, call_back: CompletionCallback, now: Instant) -> Lookup {
        if let Some(record) = self.find(transaction_id) {
            return Lookup::Found(record);
        }

        if self.len() >= self.config.max_records {
            // same bound as an opportunistic sweep, the response path never pays for a full scan
            self.sweep_with_limit(now, self.config.sweep_batch.max(1));
        }

        let lookup = {
            let mut records = self.lock_records();
            if let Some(existing) = records.active.get(transaction_id) {
                Lookup::Found(Arc::clone(existing))
            } else if records.closed.contains(transaction_id) {
                Lookup::Closed
            } else if records.active.len() >= self.config.max_records {
                Lookup::Full
            } else {
                let record = Arc::new(TransactionRecord::new(call_back, now));
                records.active.insert(transaction_id.to_string(), Arc::clone(&record));
                Lookup::Created(record)
            }
        };

        if matches!(lookup, Lookup::Created(_)) {
            self.schedule_pending_eviction(transaction_id.to_string(), now);
        }
        lookup
    }

    fn schedule_pending_eviction(&self, transaction_id: String, created_at: Instant) {
        let mut queues = self.eviction.lock().unwrap_or_else(PoisonError::into_inner);
        queues.pending.push_back(EvictionEntry {
            deadline: created_at + self.config.pending_timeout(),
            transaction_id,
        });
    }

    fn schedule_done_eviction(&self, transaction_id: String, done_at: Instant) {
        let mut queues = self.eviction.lock().unwrap_or_else(PoisonError::into_inner);
        queues.done.push_back(EvictionEntry {
            deadline: done_at + self.config.done_retention(),
            transaction_id,
        });
    }

    fn find(&self, transaction_id: &str) -> Option<Arc<TransactionRecord>> {
        self.lock_records().active.get(transaction_id).cloned()
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn pending_eviction_entries(&self) -> usize {
        self.eviction.lock().unwrap_or_else(PoisonError::into_inner).pending.len()
    }
}

impl std::fmt::Debug for CollectorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorPool").field("quorum", &self.quorum).field("stats", &self.stats()).finish()
    }
}

