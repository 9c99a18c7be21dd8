//! Warden Core - confidential job lifecycle and attestation verification
//!
//! Warden runs specialised workloads inside hardware enclaves rented from a
//! third-party compute marketplace, then checks the enclave's signed account
//! of what it computed before anyone relies on the result.
//!
//! # Architecture
//!
//! 1. **Confidentiality tag** (`tag`): isolation requirement bitmask
//! 2. **Orders and deals** (`order`, `deal`): signed immutable orders, task ids, receipts
//! 3. **Broker** (`broker`): cheapest compatible orders matched into a deal
//! 4. **Tracker** (`tracker`): polls tasks to a terminal state and builds receipts
//! 5. **Attestation** (`attestation`): envelope verification with replay protection
//!
//! # Quick Start
//!
//! ```
//! use warden_core::attestation::{AttestationSigner, AttestationVerifier, VerifierConfig};
//! use warden_core::crypto::EvmSigner;
//! use warden_core::types::Address;
//!
//! # tokio_test::block_on(async {
//! let registry = Address::from_bytes([0x42; 20]);
//! let enclave = AttestationSigner::new(EvmSigner::random(), registry.clone());
//! let verifier = AttestationVerifier::in_memory(VerifierConfig::new(registry));
//!
//! let payload = serde_json::json!({
//!     "receipt_id": "r-1",
//!     "enclave_measurement": "mr-1",
//!     "score": 712
//! });
//! let mut envelope = enclave.sign_now(payload).unwrap();
//! let verdict = verifier.verify_envelope(&mut envelope).await.unwrap();
//! assert!(verdict.ok);
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(rust_2018_idioms, missing_debug_implementations)]

pub mod attestation;
pub mod broker;
pub mod crypto;
pub mod deal;
pub mod error;
pub mod market;
pub mod order;
pub mod tag;
pub mod tracker;
pub mod types;

pub use attestation::{
    AttestationEnvelope, AttestationSigner, AttestationVerifier, RejectReason, Verdict,
    VerifierConfig,
};
pub use broker::{ConfidentialJobBroker, MatchingOrders};
pub use deal::{compute_task_id, BrokeredDeal, ExecutionReceipt, TaskStatus};
pub use error::{AttestationError, BrokerError, CoreError, MarketError, TrackerError};
pub use market::{InMemoryMarketplace, Marketplace, SimulatedEnclave};
pub use order::{AppOrder, DatasetOrder, Order, RequestOrder, RequestOrderParams, WorkerpoolOrder};
pub use tag::{ConfidentialityTag, EnclaveClass};
pub use tracker::TaskTracker;
pub use types::{Address, Bytes32};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
