use std::{sync::Arc, time::Duration};

use log::{error, info, warn};
use logger::logs;
use perf_common_utils::env_var_with_defaults;
use perf_generator::{
    crypto::{calculate_hash, Ed25519Signer},
    errors::{GeneratorError, TransportError},
    metrics::LogStats,
    model::{BatchUserRequest, BatchUserResponse, ReplicaId, Request, RequestType},
    ports::ReplicaCommunicator,
    GeneratorConfig, PerformanceGenerator,
};
use rand::Rng;
use tokio::{
    signal,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};

/// In-memory stand-in for the replica set. Every sent batch is answered by all replicas.
struct SimulatedReplicas {
    primary: ReplicaId,
    tx: UnboundedSender<Vec<u8>>,
}

impl ReplicaCommunicator for SimulatedReplicas {
    fn send_message(&self, replica: ReplicaId, envelope: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(envelope.to_vec())
            .map_err(|e| TransportError::new_send(format!("Replica {replica} is gone"), e.to_string()))
    }

    fn resolve_primary(&self) -> Result<ReplicaId, TransportError> {
        Ok(self.primary)
    }
}

fn replica_answer(replica: ReplicaId, faulty: bool, batch: &BatchUserRequest) -> Option<Vec<u8>> {
    let responses = batch
        .user_requests
        .iter()
        .map(|r| {
            let mut answer = calculate_hash(&r.data).0.to_vec();
            if faulty {
                answer.reverse();
            }
            answer
        })
        .collect();
    let response = BatchUserResponse {
        batch_id: batch.batch_id,
        proxy_id: batch.proxy_id,
        created_at_ns: batch.created_at_ns,
        responses,
    };
    let data = serde_json::to_vec(&response).ok()?;
    Request::new(RequestType::Response, data, None, batch.proxy_id, replica).to_envelope().ok()
}

async fn run_replicas(mut rx: UnboundedReceiver<Vec<u8>>, generator: Arc<PerformanceGenerator>, replica_num: usize) {
    let faulty_replicas = generator.config().max_faulty() as ReplicaId;

    while let Some(envelope) = rx.recv().await {
        let batch: BatchUserRequest = match Request::from_envelope(&envelope).map(|r| serde_json::from_slice(r.data())) {
            Ok(Ok(batch)) => batch,
            _ => {
                warn!("Replicas received an unreadable request");
                continue;
            }
        };

        for replica in 1..=replica_num as ReplicaId {
            let delay = Duration::from_micros(rand::thread_rng().gen_range(0..2_000));
            // the last `f` replicas disagree with everybody else
            let faulty = replica > replica_num as ReplicaId - faulty_replicas;
            let Some(answer) = replica_answer(replica, faulty, &batch) else {
                continue;
            };
            let generator = Arc::clone(&generator);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = generator.process_response_msg(&answer) {
                    error!("Response from replica {replica} rejected. Error: {e}");
                }
            });
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), GeneratorError> {
    logs::init("perf-generator");

    let mut config = GeneratorConfig::from_env();
    config.report_interval_ms.get_or_insert(1_000);
    let run_duration = Duration::from_millis(env_var_with_defaults!("PERF_RUN_DURATION_MS", u64, 10_000));
    let payload_size = env_var_with_defaults!("PERF_PAYLOAD_SIZE", usize, 64);
    let replica_num = config.replica_num;

    let (tx, rx) = mpsc::unbounded_channel();
    let transport = Arc::new(SimulatedReplicas { primary: 1, tx });
    let signer = Arc::new(Ed25519Signer::from_secret(rand::thread_rng().gen()));

    let generator = Arc::new(
        PerformanceGenerator::builder(config)
            .with_signer(signer)
            .with_stats(Arc::new(LogStats::new()))
            .with_data_func(Arc::new(move || {
                let mut payload = vec![0_u8; payload_size];
                rand::thread_rng().fill(&mut payload[..]);
                Ok(payload)
            }))
            .build(transport)?,
    );

    let replicas = tokio::spawn(run_replicas(rx, Arc::clone(&generator), replica_num));

    info!("Performance generator starting for {run_duration:?}...");
    generator.start_eval();

    tokio::select! {
        _ = tokio::time::sleep(run_duration) => {
            info!("Run duration elapsed");
        }
        _ = signal::ctrl_c() => {
            info!("CTRL + C TERMINATION!!!!");
        }
    }

    let stopping = Arc::clone(&generator);
    if tokio::task::spawn_blocking(move || stopping.stop()).await.is_err() {
        error!("Performance generator did not stop cleanly");
    }
    // let responses in flight land before the summary
    tokio::time::sleep(Duration::from_millis(100)).await;
    replicas.abort();

    let counters = generator.counters();
    let collector = generator.collector().stats();
    info!(
        "\nPerformance generator has finished:\n  Sent:            {}\n  Completed:       {}\n  Batches:         {}\n  Dropped batches: {}\n  Tracked txns:    {}\n  Expired txns:    {}",
        counters.send_num,
        counters.total_num,
        counters.batch_num,
        counters.dropped_batch_num,
        collector.tracked,
        collector.expired_pending
    );

    Ok(())
}
