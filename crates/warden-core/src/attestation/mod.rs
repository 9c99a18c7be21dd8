//! Attestation verification
//!
//! An enclave signs a statement about what it computed. Before anything
//! downstream trusts that statement the verifier checks, in order and
//! short-circuiting on the first failure:
//!
//! 1. required fields are present
//! 2. the timestamp is neither too far ahead nor expired
//! 3. the payload's canonical hash matches the declared hash
//! 4. the signature recovers to a signer
//! 5. the `(signer, nonce)` pair has not been seen before
//!
//! The verifier never stores anything for a rejected envelope.

mod envelope;
mod replay;
mod signer;

pub use envelope::{
    canonical_hash, AttestationEnvelope, SignedFields, ATTESTATION_DOMAIN,
    ENCLAVE_MEASUREMENT_FIELD, RECEIPT_ID_FIELD,
};
pub use replay::{InMemoryReplayStore, ReplayStore, SqliteReplayStore};
pub use signer::AttestationSigner;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::crypto::recover_signer;
use crate::error::AttestationError;
use crate::types::{Address, Bytes32};

/// Why an envelope was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MissingFields,
    TimestampFuture,
    TimestampExpired,
    AttestationHashMismatch,
    InvalidSignature,
    ReplayDetected,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MissingFields => "missing_fields",
            RejectReason::TimestampFuture => "timestamp_future",
            RejectReason::TimestampExpired => "timestamp_expired",
            RejectReason::AttestationHashMismatch => "attestation_hash_mismatch",
            RejectReason::InvalidSignature => "invalid_signature",
            RejectReason::ReplayDetected => "replay_detected",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of verifying one envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer: Option<Address>,
}

impl Verdict {
    pub fn accepted(signer: Address) -> Self {
        Self {
            ok: true,
            reason: None,
            signer: Some(signer),
        }
    }

    pub fn rejected(reason: RejectReason) -> Self {
        Self {
            ok: false,
            reason: Some(reason),
            signer: None,
        }
    }
}

/// Verifier settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// Registry the enclave binds its signature to.
    pub registry_address: Address,

    /// Maximum age of an envelope, in seconds.
    #[serde(default = "default_expiry_window")]
    pub expiry_window_secs: u64,

    /// How far ahead of local time a timestamp may be, in seconds.
    #[serde(default = "default_future_tolerance")]
    pub future_tolerance_secs: u64,
}

fn default_expiry_window() -> u64 {
    3600
}

fn default_future_tolerance() -> u64 {
    300
}

impl VerifierConfig {
    pub fn new(registry_address: Address) -> Self {
        Self {
            registry_address,
            expiry_window_secs: default_expiry_window(),
            future_tolerance_secs: default_future_tolerance(),
        }
    }
}

/// Fields extracted in step 1; all borrowed from the envelope.
struct Complete<'a> {
    receipt_id: &'a str,
    measurement: &'a str,
    attestation_hash: &'a str,
    signature: &'a str,
    nonce: &'a str,
    timestamp: i64,
}

fn complete_fields(envelope: &AttestationEnvelope) -> Option<Complete<'_>> {
    fn non_empty(value: Option<&String>) -> Option<&str> {
        value.map(String::as_str).filter(|s| !s.is_empty())
    }

    Some(Complete {
        receipt_id: envelope.receipt_id().filter(|s| !s.is_empty())?,
        measurement: envelope.enclave_measurement().filter(|s| !s.is_empty())?,
        attestation_hash: non_empty(envelope.attestation_hash.as_ref())?,
        signature: non_empty(envelope.signature.as_ref())?,
        nonce: non_empty(envelope.nonce.as_ref())?,
        timestamp: envelope.timestamp?,
    })
}

/// Verifies signed attestation envelopes against one registry
#[derive(Clone)]
pub struct AttestationVerifier {
    config: VerifierConfig,
    replay: Arc<dyn ReplayStore>,
}

impl fmt::Debug for AttestationVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttestationVerifier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AttestationVerifier {
    pub fn new(config: VerifierConfig, replay: Arc<dyn ReplayStore>) -> Self {
        Self { config, replay }
    }

    /// Verifier backed by a process-local replay store.
    pub fn in_memory(config: VerifierConfig) -> Self {
        Self::new(config, Arc::new(InMemoryReplayStore::new()))
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Verify against the current wall clock. On success the recovered
    /// signer is written back into `envelope.signer`.
    pub async fn verify_envelope(
        &self,
        envelope: &mut AttestationEnvelope,
    ) -> Result<Verdict, AttestationError> {
        self.verify_at(envelope, chrono::Utc::now().timestamp()).await
    }

    /// Verify as if the current time were `now` (unix seconds).
    pub async fn verify_at(
        &self,
        envelope: &mut AttestationEnvelope,
        now: i64,
    ) -> Result<Verdict, AttestationError> {
        // A caller-supplied signer is never trusted.
        envelope.signer = None;

        let verdict = self.check(envelope, now).await?;
        match (&verdict.reason, &verdict.signer) {
            (None, Some(signer)) => {
                debug!(
                    "Attestation {} accepted from {}",
                    envelope.receipt_id().unwrap_or_default(),
                    signer
                );
                envelope.signer = Some(signer.clone());
            }
            (Some(reason), _) => {
                warn!(
                    "Attestation {} rejected: {}",
                    envelope.receipt_id().unwrap_or("<none>"),
                    reason
                );
            }
            _ => {}
        }
        Ok(verdict)
    }

    async fn check(
        &self,
        envelope: &AttestationEnvelope,
        now: i64,
    ) -> Result<Verdict, AttestationError> {
        let fields = match complete_fields(envelope) {
            Some(fields) => fields,
            None => return Ok(Verdict::rejected(RejectReason::MissingFields)),
        };

        let tolerance = self.config.future_tolerance_secs as i64;
        let expiry = self.config.expiry_window_secs as i64;
        if fields.timestamp > now.saturating_add(tolerance) {
            return Ok(Verdict::rejected(RejectReason::TimestampFuture));
        }
        if now.saturating_sub(fields.timestamp) > expiry {
            return Ok(Verdict::rejected(RejectReason::TimestampExpired));
        }

        let computed = canonical_hash(&envelope.attestation)?;
        let declared = match Bytes32::from_hex(fields.attestation_hash) {
            Ok(hash) => hash,
            Err(_) => return Ok(Verdict::rejected(RejectReason::AttestationHashMismatch)),
        };
        if computed != declared {
            return Ok(Verdict::rejected(RejectReason::AttestationHashMismatch));
        }

        // Timestamps before the epoch cannot have been signed by a live enclave.
        let timestamp = match u64::try_from(fields.timestamp) {
            Ok(ts) => ts,
            Err(_) => return Ok(Verdict::rejected(RejectReason::TimestampExpired)),
        };

        let message_hash = SignedFields {
            receipt_id: fields.receipt_id,
            attestation_hash: &computed,
            nonce: fields.nonce,
            timestamp,
            enclave_measurement: fields.measurement,
            registry: &self.config.registry_address,
        }
        .message_hash();

        let signer = match recover_signer(&message_hash, fields.signature) {
            Ok(signer) => signer,
            Err(_) => return Ok(Verdict::rejected(RejectReason::InvalidSignature)),
        };

        if !self.replay.insert_if_absent(&signer, fields.nonce).await? {
            return Ok(Verdict::rejected(RejectReason::ReplayDetected));
        }

        Ok(Verdict::accepted(signer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EvmSigner;
    use serde_json::json;

    const NOW: i64 = 1_760_000_000;

    fn registry() -> Address {
        Address::from_bytes([0x42; 20])
    }

    fn payload() -> serde_json::Value {
        json!({
            "receipt_id": "receipt-1",
            "enclave_measurement": "mrenclave-abc",
            "result": {"score": 712, "tier": "B"}
        })
    }

    fn fixture() -> (AttestationSigner, AttestationVerifier) {
        let signer = AttestationSigner::new(EvmSigner::random(), registry());
        let verifier = AttestationVerifier::in_memory(VerifierConfig::new(registry()));
        (signer, verifier)
    }

    #[tokio::test]
    async fn test_valid_envelope_is_accepted() {
        let (signer, verifier) = fixture();
        let mut envelope = signer.sign(payload(), "nonce-1", NOW).unwrap();

        let verdict = verifier.verify_at(&mut envelope, NOW).await.unwrap();
        assert!(verdict.ok);
        assert_eq!(verdict.signer.as_ref(), Some(signer.address()));
        assert_eq!(envelope.signer.as_ref(), Some(signer.address()));
    }

    #[tokio::test]
    async fn test_missing_fields() {
        let (signer, verifier) = fixture();
        let mut envelope = signer.sign(payload(), "nonce-1", NOW).unwrap();
        envelope.nonce = None;
        let verdict = verifier.verify_at(&mut envelope, NOW).await.unwrap();
        assert_eq!(verdict.reason, Some(RejectReason::MissingFields));

        let mut envelope = signer
            .sign(json!({"receipt_id": "r"}), "nonce-2", NOW)
            .unwrap();
        let verdict = verifier.verify_at(&mut envelope, NOW).await.unwrap();
        assert_eq!(verdict.reason, Some(RejectReason::MissingFields));
    }

    #[tokio::test]
    async fn test_timestamp_window() {
        let (signer, verifier) = fixture();

        let mut ahead = signer.sign(payload(), "n-future", NOW + 301).unwrap();
        let verdict = verifier.verify_at(&mut ahead, NOW).await.unwrap();
        assert_eq!(verdict.reason, Some(RejectReason::TimestampFuture));

        let mut edge = signer.sign(payload(), "n-edge", NOW - 3600).unwrap();
        assert!(verifier.verify_at(&mut edge, NOW).await.unwrap().ok);

        let mut stale = signer.sign(payload(), "n-stale", NOW - 3601).unwrap();
        let verdict = verifier.verify_at(&mut stale, NOW).await.unwrap();
        assert_eq!(verdict.reason, Some(RejectReason::TimestampExpired));
    }

    #[tokio::test]
    async fn test_tampered_payload_is_rejected() {
        let (signer, verifier) = fixture();
        let mut envelope = signer.sign(payload(), "nonce-1", NOW).unwrap();
        envelope.attestation["result"]["score"] = json!(850);

        let verdict = verifier.verify_at(&mut envelope, NOW).await.unwrap();
        assert_eq!(verdict.reason, Some(RejectReason::AttestationHashMismatch));
        assert!(envelope.signer.is_none());
    }

    #[tokio::test]
    async fn test_garbage_signature_is_rejected() {
        let (signer, verifier) = fixture();
        let mut envelope = signer.sign(payload(), "nonce-1", NOW).unwrap();
        envelope.signature = Some("0xdeadbeef".to_string());

        let verdict = verifier.verify_at(&mut envelope, NOW).await.unwrap();
        assert_eq!(verdict.reason, Some(RejectReason::InvalidSignature));
    }

    #[tokio::test]
    async fn test_wrong_registry_recovers_different_signer() {
        let signer = AttestationSigner::new(EvmSigner::random(), Address::from_bytes([1; 20]));
        let verifier = AttestationVerifier::in_memory(VerifierConfig::new(registry()));
        let mut envelope = signer.sign(payload(), "nonce-1", NOW).unwrap();

        let verdict = verifier.verify_at(&mut envelope, NOW).await.unwrap();
        assert!(verdict.ok);
        assert_ne!(verdict.signer.as_ref(), Some(signer.address()));
    }

    #[tokio::test]
    async fn test_replay_is_rejected() {
        let (signer, verifier) = fixture();
        let envelope = signer.sign(payload(), "nonce-1", NOW).unwrap();

        let mut first = envelope.clone();
        let mut second = envelope;
        assert!(verifier.verify_at(&mut first, NOW).await.unwrap().ok);
        let verdict = verifier.verify_at(&mut second, NOW).await.unwrap();
        assert_eq!(verdict.reason, Some(RejectReason::ReplayDetected));
    }

    #[tokio::test]
    async fn test_preset_signer_is_cleared() {
        let (signer, verifier) = fixture();
        let mut envelope = signer.sign(payload(), "nonce-1", NOW + 10_000).unwrap();
        envelope.signer = Some(Address::from_bytes([7; 20]));

        let verdict = verifier.verify_at(&mut envelope, NOW).await.unwrap();
        assert!(!verdict.ok);
        assert!(envelope.signer.is_none());
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(
            serde_json::to_value(RejectReason::AttestationHashMismatch).unwrap(),
            "attestation_hash_mismatch"
        );
        assert_eq!(RejectReason::ReplayDetected.to_string(), "replay_detected");
    }
}
