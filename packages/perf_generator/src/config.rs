use std::time::Duration;

use logger::logs::SerdeLogging;
use perf_common_utils::{env_var_with_defaults, sync::RetryConfig};
use serde::{Deserialize, Serialize};

use crate::{errors::GeneratorError, model::ReplicaId};

/// Retention policy of the quorum collector pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// How long a completed transaction is remembered so late replies are recognised as duplicates.
    /// - **Defaults to 30_000ms.**
    pub done_retention_ms: u64,
    /// How long a transaction may wait for quorum before it is forgotten.
    /// - **Defaults to 60_000ms.**
    pub pending_timeout_ms: u64,
    /// Min interval between two opportunistic sweeps triggered from the response path.
    /// - **Defaults to 100ms.**
    pub sweep_interval_ms: u64,
    /// Max number of eviction entries inspected by one opportunistic sweep.
    /// - **Defaults to 1_024.**
    pub sweep_batch: usize,
    /// Hard bound on tracked transactions. New transactions are rejected once reached.
    /// - **Defaults to 1_000_000.**
    pub max_records: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            done_retention_ms: 30_000,
            pending_timeout_ms: 60_000,
            sweep_interval_ms: 100,
            sweep_batch: 1_024,
            max_records: 1_000_000,
        }
    }
}

impl CollectorConfig {
    pub fn done_retention(&self) -> Duration {
        Duration::from_millis(self.done_retention_ms)
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Identity stamped into every outgoing request as `proxy_id`.
    pub self_id: ReplicaId,
    /// Size of the replica set. `f = (replica_num - 1) / 3`.
    pub replica_num: usize,
    /// Replaces the derived `f + 1` quorum when set.
    pub quorum_override: Option<usize>,
    /// - **Defaults to 16.**
    pub producer_threads: usize,
    /// - **Defaults to 100_000.**
    pub queue_capacity: usize,
    /// - **Defaults to 100.**
    pub max_batch_size: usize,
    /// The batcher waits for this many items, or until `batch_timeout_ms` passes.
    /// - **Defaults to 1.**
    pub min_batch_size: usize,
    /// - **Defaults to 10ms.**
    pub batch_timeout_ms: u64,
    /// Sleep of the batcher between polls of an empty queue.
    /// - **Defaults to 100us.**
    pub idle_sleep_us: u64,
    /// Requests per second generated by each producer. `None` generates as fast as possible.
    pub target_rate_per_producer: Option<f64>,
    /// Backoff used by producers while the staging queue is full.
    pub push_retry: RetryConfig,
    pub collector: CollectorConfig,
    /// Interval of the throughput report in the log. `None` disables the reporter.
    pub report_interval_ms: Option<u64>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            self_id: 1,
            replica_num: 4,
            quorum_override: None,
            producer_threads: 16,
            queue_capacity: 100_000,
            max_batch_size: 100,
            min_batch_size: 1,
            batch_timeout_ms: 10,
            idle_sleep_us: 100,
            target_rate_per_producer: None,
            push_retry: RetryConfig::default(),
            collector: CollectorConfig::default(),
            report_interval_ms: None,
        }
    }
}

impl GeneratorConfig {
    /// Build the config using env. variables with defaults applied.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let retry_defaults = defaults.push_retry.clone();
        let collector_defaults = defaults.collector.clone();

        let config = Self {
            self_id: env_var_with_defaults!("PERF_SELF_ID", ReplicaId, defaults.self_id),
            replica_num: env_var_with_defaults!("PERF_REPLICA_NUM", usize, defaults.replica_num),
            quorum_override: env_var_with_defaults!("PERF_QUORUM", Option::<usize>),
            producer_threads: env_var_with_defaults!("PERF_PRODUCER_THREADS", usize, defaults.producer_threads),
            queue_capacity: env_var_with_defaults!("PERF_QUEUE_CAPACITY", usize, defaults.queue_capacity),
            max_batch_size: env_var_with_defaults!("PERF_MAX_BATCH_SIZE", usize, defaults.max_batch_size),
            min_batch_size: env_var_with_defaults!("PERF_MIN_BATCH_SIZE", usize, defaults.min_batch_size),
            batch_timeout_ms: env_var_with_defaults!("PERF_BATCH_TIMEOUT_MS", u64, defaults.batch_timeout_ms),
            idle_sleep_us: env_var_with_defaults!("PERF_IDLE_SLEEP_US", u64, defaults.idle_sleep_us),
            target_rate_per_producer: env_var_with_defaults!("PERF_TARGET_RATE_PER_PRODUCER", Option::<f64>),
            push_retry: RetryConfig {
                base_sleep_us: env_var_with_defaults!("PERF_PUSH_RETRY_BASE_SLEEP_US", u64, retry_defaults.base_sleep_us),
                max_sleep_us: env_var_with_defaults!("PERF_PUSH_RETRY_MAX_SLEEP_US", u64, retry_defaults.max_sleep_us),
                max_retry_duration_ms: env_var_with_defaults!("PERF_PUSH_RETRY_MAX_DURATION_MS", Option::<u64>).or(retry_defaults.max_retry_duration_ms),
                max_retry_attempts: env_var_with_defaults!("PERF_PUSH_RETRY_MAX_ATTEMPTS", Option::<u32>).or(retry_defaults.max_retry_attempts),
            },
            collector: CollectorConfig {
                done_retention_ms: env_var_with_defaults!("PERF_COLLECTOR_DONE_RETENTION_MS", u64, collector_defaults.done_retention_ms),
                pending_timeout_ms: env_var_with_defaults!("PERF_COLLECTOR_PENDING_TIMEOUT_MS", u64, collector_defaults.pending_timeout_ms),
                sweep_interval_ms: env_var_with_defaults!("PERF_COLLECTOR_SWEEP_INTERVAL_MS", u64, collector_defaults.sweep_interval_ms),
                sweep_batch: env_var_with_defaults!("PERF_COLLECTOR_SWEEP_BATCH", usize, collector_defaults.sweep_batch),
                max_records: env_var_with_defaults!("PERF_COLLECTOR_MAX_RECORDS", usize, collector_defaults.max_records),
            },
            report_interval_ms: env_var_with_defaults!("PERF_REPORT_INTERVAL_MS", Option::<u64>),
        };

        log::info!("Performance generator config {}", config.as_json_str());
        config
    }

    pub fn builder() -> GeneratorConfigBuilder {
        GeneratorConfigBuilder::default()
    }

    /// Max number of faulty replicas tolerated by the replica set.
    pub fn max_faulty(&self) -> usize {
        self.replica_num.saturating_sub(1) / 3
    }

    /// Number of matching responses required to accept a result.
    pub fn quorum(&self) -> usize {
        self.quorum_override.unwrap_or_else(|| self.max_faulty() + 1)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_micros(self.idle_sleep_us)
    }

    pub fn validate(&self) -> Result<(), GeneratorError> {
        if self.replica_num == 0 {
            return Err(GeneratorError::new_config("replica_num must be greater than 0".into()));
        }
        if self.quorum() == 0 {
            return Err(GeneratorError::new_config("quorum must be greater than 0".into()));
        }
        if self.quorum() > self.replica_num {
            return Err(GeneratorError::new_config(format!(
                "quorum ({}) can never be reached with {} replicas",
                self.quorum(),
                self.replica_num
            )));
        }
        if self.producer_threads == 0 {
            return Err(GeneratorError::new_config("producer_threads must be greater than 0".into()));
        }
        if self.queue_capacity == 0 {
            return Err(GeneratorError::new_config("queue_capacity must be greater than 0".into()));
        }
        if self.max_batch_size == 0 {
            return Err(GeneratorError::new_config("max_batch_size must be greater than 0".into()));
        }
        if self.min_batch_size > self.max_batch_size {
            return Err(GeneratorError::new_config(format!(
                "min_batch_size ({}) must be less or equal to the max_batch_size ({})",
                self.min_batch_size, self.max_batch_size
            )));
        }
        if self.batch_timeout_ms == 0 && self.idle_sleep_us == 0 {
            return Err(GeneratorError::new_config(
                "batch_timeout_ms and idle_sleep_us cannot both be 0, the batcher would never pause on an empty queue".into(),
            ));
        }
        if let Some(rate) = self.target_rate_per_producer {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(GeneratorError::new_config(format!("target_rate_per_producer must be a positive number, got {rate}")));
            }
        }
        if self.collector.max_records == 0 {
            return Err(GeneratorError::new_config("collector.max_records must be greater than 0".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct GeneratorConfigBuilder {
    self_id: Option<ReplicaId>,
    replica_num: Option<usize>,
    quorum_override: Option<usize>,
    producer_threads: Option<usize>,
    queue_capacity: Option<usize>,
    max_batch_size: Option<usize>,
    min_batch_size: Option<usize>,
    batch_timeout_ms: Option<u64>,
    idle_sleep_us: Option<u64>,
    target_rate_per_producer: Option<f64>,
    push_retry: Option<RetryConfig>,
    collector: Option<CollectorConfig>,
    report_interval_ms: Option<u64>,
}

impl GeneratorConfigBuilder {
    pub fn self_id(mut self, id: ReplicaId) -> Self {
        self.self_id = Some(id);
        self
    }

    pub fn replica_num(mut self, n: usize) -> Self {
        self.replica_num = Some(n);
        self
    }

    pub fn quorum(mut self, quorum: usize) -> Self {
        self.quorum_override = Some(quorum);
        self
    }

    pub fn producer_threads(mut self, threads: usize) -> Self {
        self.producer_threads = Some(threads);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size);
        self
    }

    pub fn min_batch_size(mut self, size: usize) -> Self {
        self.min_batch_size = Some(size);
        self
    }

    pub fn batch_timeout_ms(mut self, timeout: u64) -> Self {
        self.batch_timeout_ms = Some(timeout);
        self
    }

    pub fn idle_sleep_us(mut self, sleep: u64) -> Self {
        self.idle_sleep_us = Some(sleep);
        self
    }

    pub fn target_rate_per_producer(mut self, rate: f64) -> Self {
        self.target_rate_per_producer = Some(rate);
        self
    }

    pub fn push_retry(mut self, retry: RetryConfig) -> Self {
        self.push_retry = Some(retry);
        self
    }

    pub fn collector(mut self, collector: CollectorConfig) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn report_interval_ms(mut self, interval: u64) -> Self {
        self.report_interval_ms = Some(interval);
        self
    }

    pub fn build(self) -> GeneratorConfig {
        let defaults = GeneratorConfig::default();

        GeneratorConfig {
            self_id: self.self_id.unwrap_or(defaults.self_id),
            replica_num: self.replica_num.unwrap_or(defaults.replica_num),
            quorum_override: self.quorum_override.or(defaults.quorum_override),
            producer_threads: self.producer_threads.unwrap_or(defaults.producer_threads),
            queue_capacity: self.queue_capacity.unwrap_or(defaults.queue_capacity),
            max_batch_size: self.max_batch_size.unwrap_or(defaults.max_batch_size),
            min_batch_size: self.min_batch_size.unwrap_or(defaults.min_batch_size),
            batch_timeout_ms: self.batch_timeout_ms.unwrap_or(defaults.batch_timeout_ms),
            idle_sleep_us: self.idle_sleep_us.unwrap_or(defaults.idle_sleep_us),
            target_rate_per_producer: self.target_rate_per_producer.or(defaults.target_rate_per_producer),
            push_retry: self.push_retry.unwrap_or(defaults.push_retry),
            collector: self.collector.unwrap_or(defaults.collector),
            report_interval_ms: self.report_interval_ms.or(defaults.report_interval_ms),
        }
    }
}
