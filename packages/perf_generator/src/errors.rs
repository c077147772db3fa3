use strum::Display;
use thiserror::Error as ThisError;

#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum GeneratorErrorKind {
    Config,
    Thread,
    Decode,
}

#[derive(Debug, ThisError, Clone)]
#[error("Performance generator error: '{kind}'.\nReason: {reason}\nCause: {cause:?}")]
pub struct GeneratorError {
    pub kind: GeneratorErrorKind,
    pub reason: String,
    pub cause: Option<String>,
}

impl GeneratorError {
    pub fn new_config(reason: String) -> Self {
        GeneratorError {
            kind: GeneratorErrorKind::Config,
            reason,
            cause: None,
        }
    }

    pub fn new_thread(reason: String, cause: std::io::Error) -> Self {
        GeneratorError {
            kind: GeneratorErrorKind::Thread,
            reason,
            cause: Some(cause.to_string()),
        }
    }

    pub fn new_decode(reason: String, cause: String) -> Self {
        GeneratorError {
            kind: GeneratorErrorKind::Decode,
            reason,
            cause: Some(cause),
        }
    }
}

#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum TransportErrorKind {
    PrimaryUnknown,
    Send,
}

#[derive(Debug, ThisError, Clone)]
#[error("'{kind}' error with replica transport.\nReason: {reason}\nCause: {cause:?}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub reason: String,
    pub cause: Option<String>,
}

impl TransportError {
    pub fn new_primary_unknown(reason: String) -> Self {
        TransportError {
            kind: TransportErrorKind::PrimaryUnknown,
            reason,
            cause: None,
        }
    }

    pub fn new_send(reason: String, cause: String) -> Self {
        TransportError {
            kind: TransportErrorKind::Send,
            reason,
            cause: Some(cause),
        }
    }
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
#[error("Unable to sign message. Reason: {reason}")]
pub struct SignError {
    pub reason: String,
}

impl SignError {
    pub fn new(reason: String) -> Self {
        SignError { reason }
    }
}

/// Batch could not be turned into a wire request. The batch is dropped.
#[derive(Debug, ThisError)]
pub enum ConvertError {
    #[error("Unable to serialize {what}: {source}")]
    Serialization {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Signing(#[from] SignError),
}

/// The data function could not produce a usable payload.
#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
#[error("Unable to generate request payload. Reason: {reason}")]
pub struct GenerationError {
    pub reason: String,
}

impl From<String> for GenerationError {
    fn from(reason: String) -> Self {
        GenerationError { reason }
    }
}
