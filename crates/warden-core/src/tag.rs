//! Confidentiality tags
//!
//! A tag is a bitmask selecting the hardware-isolation guarantee a workload
//! must run under. Bit 0 marks "runs in a TEE"; the remaining bits pick the
//! framework. On the marketplace tags travel as 32-byte hex words; only the
//! low 32 bits carry meaning today.

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::CoreError;

bitflags! {
    /// Isolation requirement bitmask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ConfidentialityTag: u32 {
        /// Workload must run inside a trusted execution environment.
        const TEE = 0x1;
        /// SGX enclave built with the Scone framework.
        const SCONE = 0x2;
        /// SGX enclave built with the Gramine framework.
        const GRAMINE = 0x4;
        /// Intel TDX confidential VM.
        const TDX = 0x8;
    }
}

/// Enclave technology inferred from a deal's tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EnclaveClass {
    None,
    Sgx,
    Tdx,
}

impl fmt::Display for EnclaveClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnclaveClass::None => write!(f, "NONE"),
            EnclaveClass::Sgx => write!(f, "SGX"),
            EnclaveClass::Tdx => write!(f, "TDX"),
        }
    }
}

impl ConfidentialityTag {
    /// Bits that identify a TDX deal (`0x9`).
    pub const TDX_CLASS_BITS: u32 = 0x9;
    /// Bit that identifies an SGX deal (`0x1`).
    pub const SGX_CLASS_BITS: u32 = 0x1;

    /// No isolation requirement.
    pub fn standard() -> Self {
        Self::empty()
    }

    /// SGX with Scone (`0x3`).
    pub fn scone() -> Self {
        Self::TEE | Self::SCONE
    }

    /// SGX with Gramine (`0x5`).
    pub fn gramine() -> Self {
        Self::TEE | Self::GRAMINE
    }

    /// Intel TDX (`0x9`).
    pub fn tdx() -> Self {
        Self::TEE | Self::TDX
    }

    pub fn is_tee(&self) -> bool {
        self.contains(Self::TEE)
    }

    /// Whether an order carrying `self` can serve a workload requiring `required`.
    pub fn satisfies(&self, required: ConfidentialityTag) -> bool {
        self.contains(required)
    }

    /// Infer the enclave class by testing the known class bits, TDX first
    /// since its bits include the generic TEE bit.
    pub fn enclave_class(&self) -> EnclaveClass {
        let bits = self.bits();
        if bits & Self::TDX_CLASS_BITS == Self::TDX_CLASS_BITS {
            EnclaveClass::Tdx
        } else if bits & Self::SGX_CLASS_BITS == Self::SGX_CLASS_BITS {
            EnclaveClass::Sgx
        } else {
            EnclaveClass::None
        }
    }

    /// 32-byte hex word as used by the marketplace.
    pub fn to_hex(&self) -> String {
        format!("0x{:064x}", self.bits())
    }

    /// Parse a hex tag of up to 32 bytes. Bits above the low 32 must be zero.
    pub fn from_hex(value: &str) -> Result<Self, CoreError> {
        let trimmed = value.trim();
        let hex_part = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        if hex_part.is_empty() || hex_part.len() > 64 {
            return Err(CoreError::InvalidHex(format!("invalid tag: {}", value)));
        }
        let significant = hex_part.trim_start_matches('0');
        if significant.len() > 8 {
            return Err(CoreError::InvalidHex(format!("unsupported tag bits: {}", value)));
        }
        let bits = if significant.is_empty() {
            0
        } else {
            u32::from_str_radix(significant, 16)
                .map_err(|e| CoreError::InvalidHex(format!("{}: {}", value, e)))?
        };
        Ok(Self::from_bits_retain(bits))
    }
}

impl fmt::Display for ConfidentialityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.bits())
    }
}

impl Serialize for ConfidentialityTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ConfidentialityTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_tags() {
        assert_eq!(ConfidentialityTag::standard().bits(), 0x0);
        assert_eq!(ConfidentialityTag::scone().bits(), 0x3);
        assert_eq!(ConfidentialityTag::gramine().bits(), 0x5);
        assert_eq!(ConfidentialityTag::tdx().bits(), 0x9);
    }

    #[test]
    fn test_enclave_class_inference() {
        assert_eq!(ConfidentialityTag::standard().enclave_class(), EnclaveClass::None);
        assert_eq!(ConfidentialityTag::scone().enclave_class(), EnclaveClass::Sgx);
        assert_eq!(ConfidentialityTag::gramine().enclave_class(), EnclaveClass::Sgx);
        assert_eq!(ConfidentialityTag::tdx().enclave_class(), EnclaveClass::Tdx);
        // TDX bit without the TEE bit is not a TDX deal
        assert_eq!(ConfidentialityTag::TDX.enclave_class(), EnclaveClass::None);
    }

    #[test]
    fn test_satisfies() {
        assert!(ConfidentialityTag::scone().satisfies(ConfidentialityTag::TEE));
        assert!(ConfidentialityTag::scone().satisfies(ConfidentialityTag::standard()));
        assert!(!ConfidentialityTag::standard().satisfies(ConfidentialityTag::scone()));
        assert!(!ConfidentialityTag::gramine().satisfies(ConfidentialityTag::scone()));
    }

    #[test]
    fn test_hex_encoding() {
        let tag = ConfidentialityTag::tdx();
        let hex = tag.to_hex();
        assert_eq!(hex.len(), 66);
        assert!(hex.ends_with("09"));
        assert_eq!(ConfidentialityTag::from_hex(&hex).unwrap(), tag);
        assert_eq!(ConfidentialityTag::from_hex("0x3").unwrap(), ConfidentialityTag::scone());
        assert!(ConfidentialityTag::from_hex("0x1000000000").is_err());
        assert!(ConfidentialityTag::from_hex("0xzz").is_err());
    }
}
