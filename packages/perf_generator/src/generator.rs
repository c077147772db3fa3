use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    batcher::{BatchDispatcher, BatchLimits},
    collector::{CollectorPool, CollectorResultCode, ResponseMessage},
    config::GeneratorConfig,
    converter::{ClientRequestConverter, RequestConverterType},
    errors::GeneratorError,
    gate::EvaluationGate,
    metrics::{Counters, GeneratorCounters, ThroughputReporter},
    model::{BatchUserResponse, Request},
    ports::{DataFunc, DefaultDispatchHooks, DispatchHooksType, NoopStats, ReplicaCommunicatorType, SignerType, StatsSinkType},
    producer::{spawn_producers, DataFuncSlot, ProducerContext},
    queue::StagingQueue,
};

#[derive(Default)]
pub struct PerformanceGeneratorBuilder {
    config: GeneratorConfig,
    signer: Option<Arc<SignerType>>,
    stats: Option<Arc<StatsSinkType>>,
    hooks: Option<Arc<DispatchHooksType>>,
    converter: Option<Arc<RequestConverterType>>,
    data_func: Option<DataFunc>,
}

impl PerformanceGeneratorBuilder {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config, ..Default::default() }
    }

    /// Signs the outgoing batches. Ignored when a custom converter is installed.
    pub fn with_signer(mut self, signer: Arc<SignerType>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_stats(mut self, stats: Arc<StatsSinkType>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<DispatchHooksType>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_converter(mut self, converter: Arc<RequestConverterType>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn with_data_func(mut self, data_func: DataFunc) -> Self {
        self.data_func = Some(data_func);
        self
    }

    /// Validates the config and starts all worker threads. They stay idle until [`PerformanceGenerator::start_eval`].
    pub fn build(self, transport: Arc<ReplicaCommunicatorType>) -> Result<PerformanceGenerator, GeneratorError> {
        self.config.validate()?;
        let config = self.config;

        let converter = self
            .converter
            .unwrap_or_else(|| Arc::new(ClientRequestConverter::new(config.self_id, self.signer.clone())));
        let stats = self.stats.unwrap_or_else(|| Arc::new(NoopStats));
        let hooks = self.hooks.unwrap_or_else(|| Arc::new(DefaultDispatchHooks));

        let data_func = Arc::new(DataFuncSlot::default());
        if let Some(f) = self.data_func {
            data_func.set(f);
        }

        let mut generator = PerformanceGenerator {
            queue: Arc::new(StagingQueue::new(config.queue_capacity)),
            gate: Arc::new(EvaluationGate::new()),
            stop: Arc::new(AtomicBool::new(false)),
            eval_started: AtomicBool::new(false),
            data_func,
            counters: Arc::new(GeneratorCounters::default()),
            collector: Arc::new(CollectorPool::new(config.quorum(), config.collector.clone()).with_replica_num(config.replica_num)),
            stats,
            handles: Mutex::new(Vec::new()),
            config,
        };

        // on failure the threads spawned so far are stopped by drop
        let handles = generator.spawn_workers(converter, transport, hooks)?;
        generator.handles = Mutex::new(handles);

        log::info!(
            "Performance generator {} ready. Replicas: {}, quorum: {}, producers: {}",
            generator.config.self_id,
            generator.config.replica_num,
            generator.collector.quorum(),
            generator.config.producer_threads
        );
        Ok(generator)
    }
}

/// Generates load against the replica set and collects the quorum responses.
pub struct PerformanceGenerator {
    config: GeneratorConfig,
    queue: Arc<StagingQueue>,
    gate: Arc<EvaluationGate>,
    stop: Arc<AtomicBool>,
    eval_started: AtomicBool,
    data_func: Arc<DataFuncSlot>,
    counters: Arc<GeneratorCounters>,
    collector: Arc<CollectorPool>,
    stats: Arc<StatsSinkType>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PerformanceGenerator {
    pub fn builder(config: GeneratorConfig) -> PerformanceGeneratorBuilder {
        PerformanceGeneratorBuilder::new(config)
    }

    fn spawn_workers(
        &mut self,
        converter: Arc<RequestConverterType>,
        transport: Arc<ReplicaCommunicatorType>,
        hooks: Arc<DispatchHooksType>,
    ) -> Result<Vec<JoinHandle<()>>, GeneratorError> {
        let mut handles = Vec::with_capacity(self.config.producer_threads + 2);

        let batcher = BatchDispatcher::new(
            self.config.self_id,
            Arc::clone(&self.queue),
            Arc::clone(&self.stop),
            converter,
            transport,
            hooks,
            Arc::clone(&self.stats),
            Arc::clone(&self.counters),
            BatchLimits {
                min_batch_size: self.config.min_batch_size,
                max_batch_size: self.config.max_batch_size,
                batch_timeout: self.config.batch_timeout(),
                idle_sleep: self.config.idle_sleep(),
            },
        );
        handles.push(batcher.spawn()?);

        let producer_ctx = Arc::new(ProducerContext {
            queue: Arc::clone(&self.queue),
            gate: Arc::clone(&self.gate),
            stop: Arc::clone(&self.stop),
            data_func: Arc::clone(&self.data_func),
            counters: Arc::clone(&self.counters),
            stats: Arc::clone(&self.stats),
            target_rate: self.config.target_rate_per_producer,
            push_retry: ProducerContext::bounded_retry(self.config.push_retry.clone()),
        });
        match spawn_producers(producer_ctx, self.config.producer_threads) {
            Ok(producers) => handles.extend(producers),
            Err(e) => {
                self.handles = Mutex::new(handles);
                return Err(e);
            }
        }

        if let Some(interval_ms) = self.config.report_interval_ms {
            match ThroughputReporter::spawn(Arc::clone(&self.counters), Arc::clone(&self.stop), Duration::from_millis(interval_ms)) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.handles = Mutex::new(handles);
                    return Err(e);
                }
            }
        }

        Ok(handles)
    }

    /// Releases the producers. Only the first call has an effect and returns `true`.
    pub fn start_eval(&self) -> bool {
        if self.eval_started.swap(true, Ordering::AcqRel) {
            log::debug!("Evaluation has already started");
            return false;
        }
        self.data_func.freeze();
        self.gate.open();
        log::info!("Evaluation started");
        true
    }

    pub fn is_started(&self) -> bool {
        self.eval_started.load(Ordering::Acquire)
    }

    /// Installs the payload function. Has no effect once evaluation started.
    pub fn set_data_func(&self, data_func: DataFunc) -> bool {
        let installed = self.data_func.set(data_func);
        if !installed {
            log::warn!("Evaluation has already started, the data function is not replaced");
        }
        installed
    }

    /// Stops all worker threads and waits for them to finish. Safe to call more than once.
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            log::info!("Stopping performance generator {}", self.config.self_id);
        }
        self.gate.wake_all();

        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                log::error!("Thread '{name}' panicked before it could be stopped");
            }
        }
    }

    /// Entry point for a reply from a replica. `envelope` is the serialized [`Request`] carrying a [`BatchUserResponse`].
    pub fn process_response_msg(&self, envelope: &[u8]) -> Result<CollectorResultCode, GeneratorError> {
        let request = Request::from_envelope(envelope).map_err(|e| GeneratorError::new_decode("Unable to decode response envelope".into(), e.to_string()))?;
        if !request.is_intact() {
            return Err(GeneratorError::new_decode(
                format!("Response from replica {} is corrupted", request.sender_id()),
                format!("payload hash does not match {}", request.hash()),
            ));
        }

        let batch_response: BatchUserResponse = serde_json::from_slice(request.data())
            .map_err(|e| GeneratorError::new_decode(format!("Unable to decode batch response from replica {}", request.sender_id()), e.to_string()))?;

        let response = ResponseMessage {
            transaction_id: batch_response.transaction_id(),
            sender_id: request.sender_id(),
            response_type: request.request_type(),
            payload: request.into_data(),
        };

        let counters = Arc::clone(&self.counters);
        let stats = Arc::clone(&self.stats);
        let code = self.collector.add_response_msg(
            response,
            Box::new(move |payload: &[u8]| send_response_to_client(&counters, stats.as_ref(), payload)),
        );
        Ok(code)
    }

    pub fn counters(&self) -> Counters {
        self.counters.snapshot()
    }

    pub fn collector(&self) -> &Arc<CollectorPool> {
        &self.collector
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for PerformanceGenerator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Completion of a transaction. Counts the user requests answered by the batch.
pub(crate) fn send_response_to_client(counters: &GeneratorCounters, stats: &StatsSinkType, payload: &[u8]) {
    match serde_json::from_slice::<BatchUserResponse>(payload) {
        Ok(batch_response) => {
            let answered = batch_response.responses.len() as u64;
            counters.total_num.fetch_add(answered, Ordering::Relaxed);
            stats.response_num_inc(answered);
            log::debug!("Batch {} completed with {answered} responses", batch_response.transaction_id());
        }
        Err(e) => log::error!("Completed transaction carries an unreadable batch response. Error: {e}"),
    }
}
