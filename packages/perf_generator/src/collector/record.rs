use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Mutex, PoisonError,
    },
    time::Instant,
};

use ahash::AHashMap;

use crate::{
    model::{Digest, ReplicaId},
    ports::CompletionCallback,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[repr(u8)]
pub enum TransactionStatus {
    /// Collecting responses.
    Pending = 0,
    /// Quorum reached, the callback is being delivered.
    Committed = 1,
    /// Callback delivered. Kept only to recognise late responses.
    Done = 2,
}

impl TransactionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TransactionStatus::Pending,
            1 => TransactionStatus::Committed,
            _ => TransactionStatus::Done,
        }
    }
}

pub struct AtomicTransactionStatus(AtomicU8);

impl AtomicTransactionStatus {
    pub fn new(status: TransactionStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn load(&self) -> TransactionStatus {
        TransactionStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// The only way to change status. Succeeds for exactly one caller observing `from`.
    pub fn transition(&self, from: TransactionStatus, to: TransactionStatus) -> bool {
        self.0.compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }
}

/// Responses carrying the same fingerprint.
struct Tally {
    count: usize,
    payload: Vec<u8>,
}

struct Votes {
    voters: Vec<ReplicaId>,
    tallies: AHashMap<Digest, Tally>,
}

pub(crate) enum VoteOutcome {
    /// The record is no longer collecting. `voters` includes late senders.
    Closed { voters: usize },
    /// This replica has already answered.
    DuplicateSender,
    /// Counted, `count` is the number of responses matching the same fingerprint.
    Counted { count: usize },
    /// Counted and the record moved to `Committed`. Only one caller ever gets this.
    Committed { payload: Vec<u8> },
}

pub struct TransactionRecord {
    status: AtomicTransactionStatus,
    votes: Mutex<Votes>,
    call_back: Mutex<Option<CompletionCallback>>,
    created_at: Instant,
    done_at: Mutex<Option<Instant>>,
}

impl TransactionRecord {
    pub(crate) fn new(call_back: CompletionCallback, created_at: Instant) -> Self {
        Self {
            status: AtomicTransactionStatus::new(TransactionStatus::Pending),
            votes: Mutex::new(Votes {
                voters: Vec::with_capacity(4),
                tallies: AHashMap::new(),
            }),
            call_back: Mutex::new(Some(call_back)),
            created_at,
            done_at: Mutex::new(None),
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.status.load()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn done_at(&self) -> Option<Instant> {
        *self.done_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of responses counted under the leading fingerprint.
    pub fn received_count(&self) -> usize {
        let votes = self.votes.lock().unwrap_or_else(PoisonError::into_inner);
        votes.tallies.values().map(|t| t.count).max().unwrap_or(0)
    }

    /// Number of distinct replicas which answered.
    pub fn voters_count(&self) -> usize {
        self.votes.lock().unwrap_or_else(PoisonError::into_inner).voters.len()
    }

    /// Counts the response and lets `may_change_status` decide on the status transition.
    ///
    /// Status is checked and changed while the votes are locked, nothing is counted once the record left `Pending`.
    /// Late senders are still remembered, so the pool knows when every replica has answered.
    pub(crate) fn vote<F>(&self, sender: ReplicaId, fingerprint: Digest, payload: &[u8], may_change_status: F) -> VoteOutcome
    where
        F: FnOnce(usize, &AtomicTransactionStatus) -> bool,
    {
        let mut votes = self.votes.lock().unwrap_or_else(PoisonError::into_inner);
        if self.status.load() != TransactionStatus::Pending {
            if !votes.voters.contains(&sender) {
                votes.voters.push(sender);
            }
            return VoteOutcome::Closed { voters: votes.voters.len() };
        }
        if votes.voters.contains(&sender) {
            return VoteOutcome::DuplicateSender;
        }
        votes.voters.push(sender);

        let tally = votes.tallies.entry(fingerprint).or_insert_with(|| Tally {
            count: 0,
            payload: payload.to_vec(),
        });
        tally.count += 1;
        let count = tally.count;

        if may_change_status(count, &self.status) {
            VoteOutcome::Committed { payload: tally.payload.clone() }
        } else {
            VoteOutcome::Counted { count }
        }
    }

    pub(crate) fn take_call_back(&self) -> Option<CompletionCallback> {
        self.call_back.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// `Committed -> Done`, stamping the completion time.
    pub(crate) fn mark_done(&self, now: Instant) -> bool {
        let mut done_at = self.done_at.lock().unwrap_or_else(PoisonError::into_inner);
        if self.status.transition(TransactionStatus::Committed, TransactionStatus::Done) {
            *done_at = Some(now);
            true
        } else {
            false
        }
    }
}
