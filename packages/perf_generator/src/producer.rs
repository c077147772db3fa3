use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use perf_common_utils::sync::{retry_with_backoff, RetryConfig};
use time::OffsetDateTime;

use crate::{
    errors::GeneratorError,
    gate::EvaluationGate,
    metrics::GeneratorCounters,
    ports::{DataFunc, StatsSinkType},
    queue::{QueueItem, StagingQueue},
};

/// How often a producer blocked on the gate or on pacing re-checks the stop flag.
pub(crate) const STOP_POLL: Duration = Duration::from_millis(50);

/// Holds the data function. Once frozen by the start of evaluation, it can no longer be replaced.
#[derive(Default)]
pub struct DataFuncSlot {
    inner: Mutex<(Option<DataFunc>, bool)>,
}

impl DataFuncSlot {
    /// Returns `false` when the slot is already frozen.
    pub fn set(&self, data_func: DataFunc) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.1 {
            return false;
        }
        inner.0 = Some(data_func);
        true
    }

    pub fn freeze(&self) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).1 = true;
    }

    pub fn get(&self) -> Option<DataFunc> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).0.clone()
    }
}

/// Keeps a producer at `target_rate` requests per second by sleeping when it is ahead of schedule.
pub(crate) struct RatePacer {
    started_at: i128,
    target_rate: f64,
    generated: u64,
}

impl RatePacer {
    pub(crate) fn new(target_rate: f64) -> Self {
        Self {
            started_at: OffsetDateTime::now_utc().unix_timestamp_nanos(),
            target_rate,
            generated: 0,
        }
    }

    /// How long to wait at `now` (unix nanos) before the next request is due.
    pub(crate) fn delay_at(&self, now: i128) -> Option<Duration> {
        let elapsed_sec = Duration::from_nanos((now - self.started_at).max(0) as u64).as_secs_f64();
        let expected = elapsed_sec * self.target_rate;
        let delta = expected - self.generated as f64;
        if delta < 0.0 {
            // too fast, need to slow down
            Some(Duration::from_secs_f64(-delta / self.target_rate))
        } else {
            None
        }
    }

    fn record(&mut self) {
        self.generated += 1;
    }

    fn pace(&self, stop: &AtomicBool) {
        let Some(mut remaining) = self.delay_at(OffsetDateTime::now_utc().unix_timestamp_nanos()) else {
            return;
        };
        while !remaining.is_zero() && !stop.load(Ordering::Acquire) {
            let slice = remaining.min(STOP_POLL);
            thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
    }
}

/// State shared by all producer threads.
pub(crate) struct ProducerContext {
    pub queue: Arc<StagingQueue>,
    pub gate: Arc<EvaluationGate>,
    pub stop: Arc<AtomicBool>,
    pub data_func: Arc<DataFuncSlot>,
    pub counters: Arc<GeneratorCounters>,
    pub stats: Arc<StatsSinkType>,
    pub target_rate: Option<f64>,
    pub push_retry: RetryConfig,
}

impl ProducerContext {
    /// A retry budget without any bound would never give the producer a chance to notice stop.
    pub(crate) fn bounded_retry(mut retry: RetryConfig) -> RetryConfig {
        if retry.max_retry_attempts.is_none() && retry.max_retry_duration_ms.is_none() {
            retry.max_retry_duration_ms = Some(STOP_POLL.as_millis() as u64);
        }
        retry
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Hands the item to the queue. Keeps retrying while the queue is full, until stop is raised.
    fn enqueue(&self, item: QueueItem) -> bool {
        let mut item = item;
        loop {
            match retry_with_backoff(|i| self.queue.try_push(i), item, &self.push_retry) {
                Ok(_) => return true,
                Err(exhausted) => {
                    self.stats.backpressure();
                    if self.is_stopped() {
                        log::debug!("Abandoning request after {} attempts, generator is stopping", exhausted.attempts);
                        return false;
                    }
                    item = exhausted.item;
                }
            }
        }
    }
}

pub(crate) fn spawn_producers(ctx: Arc<ProducerContext>, count: usize) -> Result<Vec<JoinHandle<()>>, GeneratorError> {
    let mut handles = Vec::with_capacity(count);
    for index in 0..count {
        let ctx = Arc::clone(&ctx);
        let handle = thread::Builder::new()
            .name(format!("producer-{index}"))
            .spawn(move || run(&ctx, index))
            .map_err(|e| GeneratorError::new_thread(format!("Unable to spawn producer {index}"), e))?;
        handles.push(handle);
    }
    Ok(handles)
}

pub(crate) fn run(ctx: &ProducerContext, index: usize) {
    if !ctx.gate.wait(&ctx.stop, STOP_POLL) {
        log::debug!("Producer {index} stopped before evaluation started");
        return;
    }

    let Some(data_func) = ctx.data_func.get() else {
        log::error!("Producer {index} has no data function to call. Exiting.");
        return;
    };

    let mut pacer = ctx.target_rate.map(RatePacer::new);
    let mut failures = 0_u64;

    while !ctx.is_stopped() {
        if let Some(pacer) = pacer.as_mut() {
            pacer.pace(&ctx.stop);
            pacer.record();
            if ctx.is_stopped() {
                break;
            }
        }

        let data = match data_func() {
            Ok(data) if !data.is_empty() => data,
            outcome => {
                failures += 1;
                ctx.counters.generation_failures.fetch_add(1, Ordering::Relaxed);
                ctx.stats.generation_failed();
                let reason = match outcome {
                    Err(e) => e.reason,
                    Ok(_) => "empty payload".to_string(),
                };
                if failures == 1 {
                    log::warn!("Producer {index} failed to generate a request. Reason: {reason}");
                } else {
                    log::debug!("Producer {index} failed to generate a request ({failures} so far). Reason: {reason}");
                }
                continue;
            }
        };

        if ctx.enqueue(QueueItem::new(data)) {
            ctx.counters.send_num.fetch_add(1, Ordering::Relaxed);
            ctx.stats.send_num_inc(1);
        }
    }

    log::debug!("Producer {index} finished");
}
