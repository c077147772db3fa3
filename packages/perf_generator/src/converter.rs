use std::sync::Arc;

use crate::{
    errors::ConvertError,
    model::{BatchUserRequest, ReplicaId, Request, RequestType},
    ports::SignerType,
};

/// Turns a batch into the envelope bytes handed to the transport.
pub trait RequestConverter: Send + Sync {
    fn convert(&self, batch: &BatchUserRequest) -> Result<Vec<u8>, ConvertError>;
}

pub type RequestConverterType = dyn RequestConverter;

/// Wraps the serialized batch into a signed `ClientRequest`.
pub struct ClientRequestConverter {
    self_id: ReplicaId,
    signer: Option<Arc<SignerType>>,
    request_type: RequestType,
}

impl ClientRequestConverter {
    pub fn new(self_id: ReplicaId, signer: Option<Arc<SignerType>>) -> Self {
        Self {
            self_id,
            signer,
            request_type: RequestType::ClientRequest,
        }
    }

    /// Same conversion, stamped with a different request type.
    pub fn with_request_type(mut self, request_type: RequestType) -> Self {
        self.request_type = request_type;
        self
    }
}

impl RequestConverter for ClientRequestConverter {
    fn convert(&self, batch: &BatchUserRequest) -> Result<Vec<u8>, ConvertError> {
        let data = serde_json::to_vec(batch).map_err(|source| ConvertError::Serialization { what: "batch", source })?;

        let data_signature = match &self.signer {
            Some(signer) => Some(signer.sign_message(&data)?),
            None => None,
        };

        let request = Request::new(self.request_type, data, data_signature, self.self_id, self.self_id);
        request.to_envelope().map_err(|source| ConvertError::Serialization { what: "request", source })
    }
}
