use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use time::OffsetDateTime;

use crate::{
    converter::RequestConverterType,
    errors::GeneratorError,
    metrics::GeneratorCounters,
    model::{BatchUserRequest, ReplicaId},
    ports::{DispatchHooksType, DropReason, ReplicaCommunicatorType, StatsSinkType},
    queue::{QueueItem, StagingQueue},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub batch_timeout: Duration,
    pub idle_sleep: Duration,
}

/// Drains the staging queue into batches and sends every batch to the primary.
pub struct BatchDispatcher {
    self_id: ReplicaId,
    queue: Arc<StagingQueue>,
    stop: Arc<AtomicBool>,
    converter: Arc<RequestConverterType>,
    transport: Arc<ReplicaCommunicatorType>,
    hooks: Arc<DispatchHooksType>,
    stats: Arc<StatsSinkType>,
    counters: Arc<GeneratorCounters>,
    limits: BatchLimits,
    next_batch_id: AtomicU64,
}

impl BatchDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: ReplicaId,
        queue: Arc<StagingQueue>,
        stop: Arc<AtomicBool>,
        converter: Arc<RequestConverterType>,
        transport: Arc<ReplicaCommunicatorType>,
        hooks: Arc<DispatchHooksType>,
        stats: Arc<StatsSinkType>,
        counters: Arc<GeneratorCounters>,
        limits: BatchLimits,
    ) -> Self {
        Self {
            self_id,
            queue,
            stop,
            converter,
            transport,
            hooks,
            stats,
            counters,
            limits,
            next_batch_id: AtomicU64::new(1),
        }
    }

    pub fn spawn(self) -> Result<JoinHandle<()>, GeneratorError> {
        thread::Builder::new()
            .name("batcher".into())
            .spawn(move || self.run())
            .map_err(|e| GeneratorError::new_thread("Unable to spawn batcher".into(), e))
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn run(&self) {
        log::info!(
            "Batcher started with batch size {}..{} and timeout {:?}",
            self.limits.min_batch_size,
            self.limits.max_batch_size,
            self.limits.batch_timeout
        );

        while !self.is_stopped() {
            let items = self.collect_batch();
            if items.is_empty() {
                thread::sleep(self.limits.idle_sleep);
                continue;
            }
            if let Err(reason) = self.do_batch(items) {
                log::trace!("Batch dropped ({reason:?}), continuing with the next one");
            }
        }

        let mut abandoned = 0_usize;
        loop {
            let left = self.queue.pop_batch(self.limits.max_batch_size.max(1));
            if left.is_empty() {
                break;
            }
            abandoned += left.len();
        }
        if abandoned > 0 {
            log::warn!("Batcher stopped with {abandoned} requests left in the staging queue. They were not sent.");
        }
        log::info!("Batcher finished");
    }

    /// Waits until at least `min_batch_size` items are available or the batch timeout passes.
    /// Returns an empty vec only when nothing arrived before the timeout or stop was raised.
    pub fn collect_batch(&self) -> Vec<QueueItem> {
        let max = self.limits.max_batch_size.max(1);
        let min = self.limits.min_batch_size.clamp(1, max);
        let deadline = Instant::now() + self.limits.batch_timeout;

        let mut items = Vec::with_capacity(max);
        loop {
            items.extend(self.queue.pop_batch(max - items.len()));
            if items.len() >= min || self.is_stopped() || Instant::now() >= deadline {
                return items;
            }
            thread::sleep(self.limits.idle_sleep);
        }
    }

    /// Converts and sends one batch. Any failure drops the whole batch.
    pub fn do_batch(&self, items: Vec<QueueItem>) -> Result<ReplicaId, DropReason> {
        let size = items.len();
        let batch = BatchUserRequest {
            batch_id: self.next_batch_id.fetch_add(1, Ordering::Relaxed),
            proxy_id: self.self_id,
            created_at_ns: OffsetDateTime::now_utc().unix_timestamp_nanos(),
            user_requests: items.into_iter().map(|item| item.user_request).collect(),
        };

        let envelope = match self.converter.convert(&batch) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::error!("Unable to convert batch {}. Error: {e}", batch.batch_id);
                return Err(self.drop_batch(size, DropReason::Conversion));
            }
        };

        let primary = match self.hooks.get_primary(self.transport.as_ref()) {
            Ok(primary) => primary,
            Err(e) => {
                log::error!("No primary to send batch {} to. Error: {e}", batch.batch_id);
                return Err(self.drop_batch(size, DropReason::PrimaryUnknown));
            }
        };

        if let Err(e) = self.transport.send_message(primary, &envelope) {
            log::error!("Failed to send batch {} to replica {primary}. Error: {e}", batch.batch_id);
            return Err(self.drop_batch(size, DropReason::Transport));
        }

        self.hooks.post_send();
        self.counters.batch_num.fetch_add(1, Ordering::Relaxed);
        self.stats.batch_dispatched(size);
        log::debug!("Batch {} with {size} requests sent to replica {primary}", batch.batch_id);
        Ok(primary)
    }

    fn drop_batch(&self, size: usize, reason: DropReason) -> DropReason {
        self.counters.dropped_batch_num.fetch_add(1, Ordering::Relaxed);
        self.stats.batch_dropped(size, reason);
        reason
    }
}
