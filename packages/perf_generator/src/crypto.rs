use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use sha2::{Digest as _, Sha256};

use crate::{
    errors::SignError,
    model::{Digest, Signature},
    ports::Signer,
};

/// Deterministic content hash of the payload.
pub fn calculate_hash(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Digest(hasher.finalize().into())
}

/// Signs payloads with a local ed25519 key.
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn from_secret(secret: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&secret),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn verify(key: &VerifyingKey, data: &[u8], signature: &Signature) -> bool {
        match ed25519_dalek::Signature::from_slice(&signature.0) {
            Ok(sig) => key.verify(data, &sig).is_ok(),
            Err(_) => false,
        }
    }
}

impl Signer for Ed25519Signer {
    fn sign_message(&self, data: &[u8]) -> Result<Signature, SignError> {
        let signature = self
            .key
            .try_sign(data)
            .map_err(|e| SignError::new(format!("ed25519 signing failed: {e}")))?;
        Ok(Signature(signature.to_bytes().to_vec()))
    }
}
