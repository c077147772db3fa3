use std::sync::Arc;

use crate::{
    errors::{GenerationError, SignError, TransportError},
    model::{ReplicaId, Signature},
};

/// Replica transport and addressing.
pub trait ReplicaCommunicator: Send + Sync {
    fn send_message(&self, replica: ReplicaId, envelope: &[u8]) -> Result<(), TransportError>;
    /// The replica currently acting as primary. Fails when no primary is known.
    fn resolve_primary(&self) -> Result<ReplicaId, TransportError>;
}

pub type ReplicaCommunicatorType = dyn ReplicaCommunicator;

pub trait Signer: Send + Sync {
    fn sign_message(&self, data: &[u8]) -> Result<Signature, SignError>;
}

pub type SignerType = dyn Signer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum DropReason {
    Conversion,
    PrimaryUnknown,
    Transport,
}

/// Fire-and-forget statistics. Implementations must not block.
pub trait StatsSink: Send + Sync {
    fn send_num_inc(&self, _count: u64) {}
    fn response_num_inc(&self, _count: u64) {}
    fn batch_dispatched(&self, _size: usize) {}
    fn batch_dropped(&self, _size: usize, _reason: DropReason) {}
    fn backpressure(&self) {}
    fn generation_failed(&self) {}
}

pub type StatsSinkType = dyn StatsSink;

pub struct NoopStats;

impl StatsSink for NoopStats {}

/// Extension points around dispatching a batch.
pub trait DispatchHooks: Send + Sync {
    fn get_primary(&self, transport: &ReplicaCommunicatorType) -> Result<ReplicaId, TransportError> {
        transport.resolve_primary()
    }

    /// Called after every successful send, e.g. for pacing.
    fn post_send(&self) {}
}

pub type DispatchHooksType = dyn DispatchHooks;

pub struct DefaultDispatchHooks;

impl DispatchHooks for DefaultDispatchHooks {}

/// Invoked once with the aggregated response when a transaction reaches quorum.
pub type CompletionCallback = Box<dyn FnOnce(&[u8]) + Send>;

/// Produces payload of one synthetic request.
pub type DataFunc = Arc<dyn Fn() -> Result<Vec<u8>, GenerationError> + Send + Sync>;
