//! EVM-style hashing and secp256k1 signing helpers
//!
//! Orders and attestation envelopes are signed as EIP-191 personal messages
//! over a 32-byte Keccak-256 digest, and the signer is identified by the
//! address recovered from the signature.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha3::{Digest, Keccak256};

use crate::error::{CoreError, Result};
use crate::types::{Address, Bytes32};

/// Keccak-256 of `data`.
pub fn keccak256(data: impl AsRef<[u8]>) -> Bytes32 {
    let mut hasher = Keccak256::new();
    hasher.update(data.as_ref());
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Bytes32::new(out)
}

/// EIP-191 personal-sign digest of a 32-byte message hash.
pub fn eip191_hash(message_hash: &Bytes32) -> Bytes32 {
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(message_hash.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Bytes32::new(out)
}

/// Encode an unsigned integer as a 32-byte big-endian word (ABI `uint256`).
pub fn u256_word(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Address derived from an uncompressed secp256k1 public key.
pub fn address_of(key: &VerifyingKey) -> Result<Address> {
    let encoded = key.to_encoded_point(false);
    let pubkey = encoded.as_bytes();
    if pubkey.len() != 65 || pubkey[0] != 0x04 {
        return Err(CoreError::Signature(
            "unexpected public key encoding".to_string(),
        ));
    }
    let digest = keccak256(&pubkey[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest.as_bytes()[12..]);
    Ok(Address::from_bytes(address))
}

fn normalize_recovery_id(raw: u8) -> Result<RecoveryId> {
    let id = match raw {
        27 | 28 => raw - 27,
        0 | 1 => raw,
        _ => {
            return Err(CoreError::Signature(
                "recovery id must be 0/1 or 27/28".to_string(),
            ))
        }
    };
    RecoveryId::try_from(id).map_err(|_| CoreError::Signature("invalid recovery id".to_string()))
}

/// Recover the signer of an EIP-191 signature over `message_hash`.
///
/// `signature_hex` is the 65-byte `r ‖ s ‖ v` signature, `0x`-prefixed.
pub fn recover_signer(message_hash: &Bytes32, signature_hex: &str) -> Result<Address> {
    let trimmed = signature_hex.trim();
    let hex_part = trimmed
        .strip_prefix("0x")
        .ok_or_else(|| CoreError::Signature("signature must be 0x-prefixed".to_string()))?;
    let bytes = hex::decode(hex_part).map_err(|e| CoreError::InvalidHex(e.to_string()))?;
    if bytes.len() != 65 {
        return Err(CoreError::Signature(format!(
            "signature must be 65 bytes, got {}",
            bytes.len()
        )));
    }

    let signature = Signature::try_from(&bytes[..64])
        .map_err(|e| CoreError::Signature(format!("invalid ECDSA signature: {}", e)))?;
    let recovery_id = normalize_recovery_id(bytes[64])?;
    let prehash = eip191_hash(message_hash);
    let key = VerifyingKey::recover_from_prehash(prehash.as_bytes(), &signature, recovery_id)
        .map_err(|e| CoreError::Signature(format!("recovery failed: {}", e)))?;
    address_of(&key)
}

/// A secp256k1 key able to produce EIP-191 signatures.
#[derive(Clone)]
pub struct EvmSigner {
    key: SigningKey,
    address: Address,
}

impl EvmSigner {
    /// Generate a fresh random key.
    pub fn random() -> Self {
        let key = SigningKey::random(&mut OsRng);
        Self::from_key(key)
    }

    /// Load a key from a `0x`-prefixed 32-byte hex secret.
    pub fn from_hex(secret: &str) -> Result<Self> {
        let trimmed = secret.trim();
        let hex_part = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(hex_part).map_err(|e| CoreError::InvalidHex(e.to_string()))?;
        let key = SigningKey::from_slice(&bytes)
            .map_err(|e| CoreError::Signature(format!("invalid secret key: {}", e)))?;
        Ok(Self::from_key(key))
    }

    fn from_key(key: SigningKey) -> Self {
        // A valid signing key always yields an uncompressed point.
        let address = address_of(key.verifying_key()).unwrap_or_else(|_| Address::zero());
        Self { key, address }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Sign `message_hash` as an EIP-191 personal message, returning `0x ‖ r ‖ s ‖ v`.
    pub fn sign(&self, message_hash: &Bytes32) -> Result<String> {
        let prehash = eip191_hash(message_hash);
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(prehash.as_bytes())
            .map_err(|e| CoreError::Signature(e.to_string()))?;
        let mut bytes = signature.to_bytes().to_vec();
        bytes.push(recovery_id.to_byte() + 27);
        Ok(format!("0x{}", hex::encode(bytes)))
    }
}

impl std::fmt::Debug for EvmSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn test_known_key_address() {
        let signer = EvmSigner::from_hex(TEST_KEY).unwrap();
        assert_eq!(
            signer.address().as_str(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }

    #[test]
    fn test_sign_and_recover() {
        let signer = EvmSigner::random();
        let hash = keccak256(b"warden");
        let signature = signer.sign(&hash).unwrap();

        let recovered = recover_signer(&hash, &signature).unwrap();
        assert_eq!(&recovered, signer.address());

        let other = recover_signer(&keccak256(b"other"), &signature).unwrap();
        assert_ne!(&other, signer.address());
    }

    #[test]
    fn test_recover_rejects_malformed_signatures() {
        let hash = keccak256(b"warden");
        assert!(recover_signer(&hash, "deadbeef").is_err());
        assert!(recover_signer(&hash, "0xdeadbeef").is_err());
        let bad_v = format!("0x{}05", "11".repeat(64));
        assert!(recover_signer(&hash, &bad_v).is_err());
    }

    #[test]
    fn test_u256_word() {
        let word = u256_word(258);
        assert_eq!(word[30], 1);
        assert_eq!(word[31], 2);
        assert!(word[..24].iter().all(|b| *b == 0));
    }
}
