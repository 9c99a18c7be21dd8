//! Attestation envelope and its hashes

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::{keccak256, u256_word};
use crate::error::AttestationError;
use crate::types::{Address, Bytes32};

/// Payload field holding the id of the receipt being attested.
pub const RECEIPT_ID_FIELD: &str = "receipt_id";

/// Payload field holding the enclave measurement (MRENCLAVE / MRTD).
pub const ENCLAVE_MEASUREMENT_FIELD: &str = "enclave_measurement";

/// Domain separator for attestation message hashes.
pub const ATTESTATION_DOMAIN: &[u8] = b"warden.attestation.v1";

/// Signed statement produced by an enclave about what it computed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationEnvelope {
    /// Structured payload; must carry `receipt_id` and `enclave_measurement`.
    pub attestation: Value,

    #[serde(default)]
    pub attestation_hash: Option<String>,

    #[serde(default)]
    pub signature: Option<String>,

    #[serde(default)]
    pub nonce: Option<String>,

    /// Unix seconds.
    #[serde(default)]
    pub timestamp: Option<i64>,

    /// Recovered signer, set by the verifier on success only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<Address>,
}

impl AttestationEnvelope {
    pub fn receipt_id(&self) -> Option<&str> {
        self.attestation.get(RECEIPT_ID_FIELD).and_then(Value::as_str)
    }

    pub fn enclave_measurement(&self) -> Option<&str> {
        self.attestation
            .get(ENCLAVE_MEASUREMENT_FIELD)
            .and_then(Value::as_str)
    }
}

/// Hash of the RFC 8785 canonical encoding of `payload`.
///
/// Key order and whitespace never change the result.
pub fn canonical_hash(payload: &Value) -> Result<Bytes32, AttestationError> {
    let canonical = serde_jcs::to_vec(payload)
        .map_err(|e| AttestationError::Canonicalization(e.to_string()))?;
    Ok(keccak256(canonical))
}

/// Fields covered by the enclave signature, in signing order
#[derive(Debug, Clone, Copy)]
pub struct SignedFields<'a> {
    pub receipt_id: &'a str,
    pub attestation_hash: &'a Bytes32,
    pub nonce: &'a str,
    pub timestamp: u64,
    pub enclave_measurement: &'a str,
    pub registry: &'a Address,
}

impl SignedFields<'_> {
    /// Domain-separated message hash. Variable-length fields are hashed first
    /// so the packed encoding stays unambiguous.
    pub fn message_hash(&self) -> Bytes32 {
        let mut material = Vec::with_capacity(ATTESTATION_DOMAIN.len() + 32 * 5 + 20);
        material.extend_from_slice(ATTESTATION_DOMAIN);
        material.extend_from_slice(keccak256(self.receipt_id).as_bytes());
        material.extend_from_slice(self.attestation_hash.as_bytes());
        material.extend_from_slice(keccak256(self.nonce).as_bytes());
        material.extend_from_slice(&u256_word(self.timestamp));
        material.extend_from_slice(keccak256(self.enclave_measurement).as_bytes());
        material.extend_from_slice(&self.registry.to_bytes());
        keccak256(material)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_hash_ignores_key_order() {
        let a: Value =
            serde_json::from_str(r#"{"receipt_id":"r1","score":{"b":2,"a":1}}"#).unwrap();
        let b: Value =
            serde_json::from_str(r#"{ "score": {"a": 1, "b": 2}, "receipt_id": "r1" }"#).unwrap();
        assert_eq!(canonical_hash(&a).unwrap(), canonical_hash(&b).unwrap());
    }

    #[test]
    fn test_canonical_hash_detects_changes() {
        let a = json!({"receipt_id": "r1", "score": 700});
        let b = json!({"receipt_id": "r1", "score": 701});
        assert_ne!(canonical_hash(&a).unwrap(), canonical_hash(&b).unwrap());
    }

    #[test]
    fn test_message_hash_binds_registry() {
        let hash = keccak256(b"payload");
        let registry_a = Address::from_bytes([1u8; 20]);
        let registry_b = Address::from_bytes([2u8; 20]);
        let fields = SignedFields {
            receipt_id: "r1",
            attestation_hash: &hash,
            nonce: "n1",
            timestamp: 1_700_000_000,
            enclave_measurement: "m1",
            registry: &registry_a,
        };
        let other = SignedFields {
            registry: &registry_b,
            ..fields
        };
        assert_ne!(fields.message_hash(), other.message_hash());
    }

    #[test]
    fn test_payload_accessors() {
        let envelope = AttestationEnvelope {
            attestation: json!({"receipt_id": "r1", "enclave_measurement": "m1"}),
            attestation_hash: None,
            signature: None,
            nonce: None,
            timestamp: None,
            signer: None,
        };
        assert_eq!(envelope.receipt_id(), Some("r1"));
        assert_eq!(envelope.enclave_measurement(), Some("m1"));
    }
}
