//! Enclave-side envelope construction

use rand::RngCore;
use serde_json::Value;

use super::envelope::{canonical_hash, AttestationEnvelope, SignedFields};
use super::envelope::{ENCLAVE_MEASUREMENT_FIELD, RECEIPT_ID_FIELD};
use crate::crypto::EvmSigner;
use crate::error::AttestationError;
use crate::types::Address;

/// Builds signed attestation envelopes bound to one verifier registry.
#[derive(Debug, Clone)]
pub struct AttestationSigner {
    signer: EvmSigner,
    registry: Address,
}

impl AttestationSigner {
    pub fn new(signer: EvmSigner, registry: Address) -> Self {
        Self { signer, registry }
    }

    pub fn address(&self) -> &Address {
        self.signer.address()
    }

    /// Sign `payload` with an explicit nonce and unix timestamp.
    pub fn sign(
        &self,
        payload: Value,
        nonce: impl Into<String>,
        timestamp: i64,
    ) -> Result<AttestationEnvelope, AttestationError> {
        let nonce = nonce.into();
        let attestation_hash = canonical_hash(&payload)?;
        let receipt_id = payload
            .get(RECEIPT_ID_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default();
        let measurement = payload
            .get(ENCLAVE_MEASUREMENT_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default();

        let message_hash = SignedFields {
            receipt_id,
            attestation_hash: &attestation_hash,
            nonce: &nonce,
            timestamp: timestamp.max(0) as u64,
            enclave_measurement: measurement,
            registry: &self.registry,
        }
        .message_hash();
        let signature = self.signer.sign(&message_hash)?;

        Ok(AttestationEnvelope {
            attestation: payload,
            attestation_hash: Some(attestation_hash.to_hex()),
            signature: Some(signature),
            nonce: Some(nonce),
            timestamp: Some(timestamp),
            signer: None,
        })
    }

    /// Sign `payload` now with a fresh random nonce.
    pub fn sign_now(&self, payload: Value) -> Result<AttestationEnvelope, AttestationError> {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.sign(payload, hex::encode(nonce), chrono::Utc::now().timestamp())
    }
}
