use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use time::OffsetDateTime;

use crate::{
    errors::GeneratorError,
    ports::{DropReason, StatsSink},
};

/// Monotonic counters of one generator instance.
#[derive(Debug, Default)]
pub struct GeneratorCounters {
    /// Requests accepted by the staging queue.
    pub send_num: AtomicU64,
    /// User requests answered by a quorum.
    pub total_num: AtomicU64,
    pub batch_num: AtomicU64,
    pub dropped_batch_num: AtomicU64,
    pub generation_failures: AtomicU64,
}

impl GeneratorCounters {
    pub fn snapshot(&self) -> Counters {
        Counters {
            send_num: self.send_num.load(Ordering::Relaxed),
            total_num: self.total_num.load(Ordering::Relaxed),
            batch_num: self.batch_num.load(Ordering::Relaxed),
            dropped_batch_num: self.dropped_batch_num.load(Ordering::Relaxed),
            generation_failures: self.generation_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub send_num: u64,
    pub total_num: u64,
    pub batch_num: u64,
    pub dropped_batch_num: u64,
    pub generation_failures: u64,
}

/// Rates observed between two counter snapshots.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub send_tps: f32,
    pub complete_tps: f32,
    /// Sent but not yet answered by a quorum.
    pub in_flight: u64,
}

impl Throughput {
    pub fn between(previous: &Counters, current: &Counters, elapsed: Duration) -> Self {
        let elapsed_sec = elapsed.as_secs_f32();
        let rate = |from: u64, to: u64| if elapsed_sec > 0.0 { to.saturating_sub(from) as f32 / elapsed_sec } else { 0.0 };

        Self {
            send_tps: rate(previous.send_num, current.send_num),
            complete_tps: rate(previous.total_num, current.total_num),
            in_flight: current.send_num.saturating_sub(current.total_num),
        }
    }
}

/// Stats sink counting events in memory. Dropped batches and backpressure are logged.
#[derive(Debug, Default)]
pub struct LogStats {
    sent: AtomicU64,
    responses: AtomicU64,
    batches: AtomicU64,
    dropped: AtomicU64,
    backpressure: AtomicU64,
    generation_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub responses: u64,
    pub batches: u64,
    pub dropped: u64,
    pub backpressure: u64,
    pub generation_failures: u64,
}

impl LogStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            backpressure: self.backpressure.load(Ordering::Relaxed),
            generation_failures: self.generation_failures.load(Ordering::Relaxed),
        }
    }
}

impl StatsSink for LogStats {
    fn send_num_inc(&self, count: u64) {
        self.sent.fetch_add(count, Ordering::Relaxed);
    }

    fn response_num_inc(&self, count: u64) {
        self.responses.fetch_add(count, Ordering::Relaxed);
    }

    fn batch_dispatched(&self, _size: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    fn batch_dropped(&self, size: usize, reason: DropReason) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        log::warn!("Dropped batch of {size} requests. Reason: {reason}. Dropped so far: {dropped}");
    }

    fn backpressure(&self) {
        let count = self.backpressure.fetch_add(1, Ordering::Relaxed) + 1;
        // one line per 1000 events is enough to spot a slow batcher
        if count % 1_000 == 1 {
            log::warn!("Staging queue is full, producers are backing off. Events so far: {count}");
        }
    }

    fn generation_failed(&self) {
        self.generation_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Background thread logging send and completion rates.
pub struct ThroughputReporter;

impl ThroughputReporter {
    pub fn spawn(counters: Arc<GeneratorCounters>, stop: Arc<AtomicBool>, interval: Duration) -> Result<JoinHandle<()>, GeneratorError> {
        thread::Builder::new()
            .name("throughput-reporter".into())
            .spawn(move || Self::run(&counters, &stop, interval))
            .map_err(|e| GeneratorError::new_thread("Unable to spawn throughput reporter".into(), e))
    }

    fn run(counters: &GeneratorCounters, stop: &AtomicBool, interval: Duration) {
        let tick = interval.min(Duration::from_millis(50)).max(Duration::from_millis(1));
        let started_at = OffsetDateTime::now_utc().unix_timestamp_nanos();
        let mut printed_at = started_at;
        let mut previous = counters.snapshot();

        while !stop.load(Ordering::Acquire) {
            thread::sleep(tick);
            let now = OffsetDateTime::now_utc().unix_timestamp_nanos();
            let elapsed = Duration::from_nanos((now - printed_at).max(0) as u64);
            if elapsed < interval {
                continue;
            }

            let current = counters.snapshot();
            let throughput = Throughput::between(&previous, &current, elapsed);
            log::info!(
                "Sent: {:>9} ({:>9.2} tps), completed: {:>9} ({:>9.2} tps), in flight: {:>7}, dropped batches: {}",
                current.send_num,
                throughput.send_tps,
                current.total_num,
                throughput.complete_tps,
                throughput.in_flight,
                current.dropped_batch_num
            );
            previous = current;
            printed_at = now;
        }

        let now = OffsetDateTime::now_utc().unix_timestamp_nanos();
        let total = counters.snapshot();
        let overall = Throughput::between(&Counters::default(), &total, Duration::from_nanos((now - started_at).max(0) as u64));
        log::info!(
            "Throughput reporter finished. Sent: {} ({:.2} tps), completed: {} ({:.2} tps)",
            total.send_num,
            overall.send_tps,
            total.total_num,
            overall.complete_tps
        );
    }
}
