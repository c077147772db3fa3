use std::collections::{BTreeSet, VecDeque};

use ahash::{AHashMap, AHashSet};

use crate::model::{parse_transaction_id, ReplicaId};

/// Closed batch ids of one proxy. Everything at or below `floor` counts as closed.
#[derive(Default)]
struct ProxyWindow {
    floor: u64,
    above: BTreeSet<u64>,
}

impl ProxyWindow {
    fn contains(&self, batch_id: u64) -> bool {
        batch_id <= self.floor || self.above.contains(&batch_id)
    }

    fn close(&mut self, batch_id: u64, capacity: usize) {
        if batch_id <= self.floor {
            return;
        }
        self.above.insert(batch_id);
        // past capacity the oldest ids fold into the floor, gaps below them count as closed
        while self.above.len() > capacity {
            if let Some(oldest) = self.above.pop_first() {
                self.floor = oldest;
            }
        }
        while self.above.remove(&(self.floor + 1)) {
            self.floor += 1;
        }
    }
}

/// Transactions removed from the pool after completion. Responses for them must not open a new record.
///
/// Batch ids (`"{proxy_id}-{batch_id}"`) are kept per proxy as a floor plus the closed ids above it.
/// Other ids are kept in a FIFO of `capacity` entries.
pub(crate) struct ClosedTransactions {
    capacity: usize,
    proxies: AHashMap<ReplicaId, ProxyWindow>,
    others: AHashSet<String>,
    others_order: VecDeque<String>,
}

impl ClosedTransactions {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            proxies: AHashMap::new(),
            others: AHashSet::new(),
            others_order: VecDeque::new(),
        }
    }

    pub(crate) fn contains(&self, transaction_id: &str) -> bool {
        match parse_transaction_id(transaction_id) {
            Some((proxy_id, batch_id)) => self.proxies.get(&proxy_id).map(|w| w.contains(batch_id)).unwrap_or(false),
            None => self.others.contains(transaction_id),
        }
    }

    pub(crate) fn close(&mut self, transaction_id: &str) {
        match parse_transaction_id(transaction_id) {
            Some((proxy_id, batch_id)) => self.proxies.entry(proxy_id).or_default().close(batch_id, self.capacity),
            None => {
                if self.others.insert(transaction_id.to_string()) {
                    self.others_order.push_back(transaction_id.to_string());
                }
                while self.others_order.len() > self.capacity {
                    if let Some(oldest) = self.others_order.pop_front() {
                        self.others.remove(&oldest);
                    }
                }
            }
        }
    }

    pub(crate) fn tracked(&self) -> usize {
        self.proxies.values().map(|w| w.above.len()).sum::<usize>() + self.others.len()
    }
}
