use std::fmt::{Debug, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::crypto::calculate_hash;

pub type ReplicaId = u64;

/// SHA-256 content hash. Also used as the fingerprint of a response payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in self.0.iter().take(8) {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", self)
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl Debug for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature([{} bytes])", self.0.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum RequestType {
    ClientRequest,
    Response,
    Custom(u32),
}

/// Single synthetic request as produced by the data function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRequest {
    pub data: Vec<u8>,
}

/// Requests sharing one wire-level envelope. `(proxy_id, batch_id)` is the batch identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUserRequest {
    pub batch_id: u64,
    pub proxy_id: ReplicaId,
    pub created_at_ns: i128,
    pub user_requests: Vec<UserRequest>,
}

impl BatchUserRequest {
    pub fn transaction_id(&self) -> String {
        transaction_id(self.proxy_id, self.batch_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUserResponse {
    pub batch_id: u64,
    pub proxy_id: ReplicaId,
    pub created_at_ns: i128,
    pub responses: Vec<Vec<u8>>,
}

impl BatchUserResponse {
    pub fn transaction_id(&self) -> String {
        transaction_id(self.proxy_id, self.batch_id)
    }
}

pub fn transaction_id(proxy_id: ReplicaId, batch_id: u64) -> String {
    format!("{proxy_id}-{batch_id}")
}

/// Reverse of [`transaction_id`]. `None` for ids not produced by a batch.
pub fn parse_transaction_id(transaction_id: &str) -> Option<(ReplicaId, u64)> {
    let (proxy_id, batch_id) = transaction_id.split_once('-')?;
    Some((proxy_id.parse().ok()?, batch_id.parse().ok()?))
}

/// The envelope exchanged with replicas.
///
/// Fields are only set on construction, a changed payload needs a new `Request`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    request_type: RequestType,
    data: Vec<u8>,
    data_signature: Option<Signature>,
    hash: Digest,
    proxy_id: ReplicaId,
    sender_id: ReplicaId,
}

impl Request {
    /// Builds the envelope, hashing `data`.
    pub fn new(request_type: RequestType, data: Vec<u8>, data_signature: Option<Signature>, proxy_id: ReplicaId, sender_id: ReplicaId) -> Self {
        let hash = calculate_hash(&data);
        Self {
            request_type,
            data,
            data_signature,
            hash,
            proxy_id,
            sender_id,
        }
    }

    pub fn request_type(&self) -> RequestType {
        self.request_type
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_signature(&self) -> Option<&Signature> {
        self.data_signature.as_ref()
    }

    pub fn hash(&self) -> &Digest {
        &self.hash
    }

    pub fn proxy_id(&self) -> ReplicaId {
        self.proxy_id
    }

    pub fn sender_id(&self) -> ReplicaId {
        self.sender_id
    }

    /// True when the carried hash matches the payload.
    pub fn is_intact(&self) -> bool {
        calculate_hash(&self.data) == self.hash
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn to_envelope(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_envelope(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
