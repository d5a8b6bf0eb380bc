//! secp256k1 signing and signer recovery
//!
//! Signatures are 65 bytes `r || s || v` over a Keccak-256 digest; identities are the
//! last 20 bytes of the Keccak-256 of the uncompressed public key.

use crate::error::{ConsensusError, Result};
use crate::types::{keccak256, Address, Hash, SIGNATURE_LENGTH};
use k256::ecdsa::{RecoveryId, Signature, SigningKey as K256SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;

/// Key used by the scheduler to sign batch-period messages
#[derive(Clone)]
pub struct SigningKey {
    inner: K256SigningKey,
}

impl SigningKey {
    pub fn random() -> Self {
        Self {
            inner: K256SigningKey::random(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let inner = K256SigningKey::from_slice(bytes)
            .map_err(|e| ConsensusError::Signature(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Parse a hex private key, with or without `0x`
    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).map_err(|e| ConsensusError::Decode(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn address(&self) -> Address {
        address_of(self.inner.verifying_key())
    }

    /// Sign a 32-byte digest
    pub fn sign_hash(&self, hash: &Hash) -> Result<Vec<u8>> {
        let (signature, recovery_id) = self
            .inner
            .sign_prehash_recoverable(hash)
            .map_err(|e| ConsensusError::Signature(e.to_string()))?;

        let mut out = Vec::with_capacity(SIGNATURE_LENGTH);
        out.extend_from_slice(&signature.to_bytes());
        out.push(recovery_id.to_byte());
        Ok(out)
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("address", &self.address())
            .finish()
    }
}

/// Derive the account address of a public key
pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&hash[12..]);
    Address(out)
}

/// Recover the address that produced `signature` over `hash`
pub fn recover_signer(hash: &Hash, signature: &[u8]) -> Result<Address> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(ConsensusError::Signature(format!(
            "signature must be {} bytes, got {}",
            SIGNATURE_LENGTH,
            signature.len()
        )));
    }

    let sig = Signature::from_slice(&signature[..64])
        .map_err(|e| ConsensusError::Signature(e.to_string()))?;

    // accept both 0/1 and 27/28 recovery bytes
    let v = match signature[64] {
        v @ 27..=28 => v - 27,
        v => v,
    };
    let recovery_id = RecoveryId::from_byte(v)
        .ok_or_else(|| ConsensusError::Signature(format!("invalid recovery id {}", v)))?;

    let key = VerifyingKey::recover_from_prehash(hash, &sig, recovery_id)
        .map_err(|e| ConsensusError::Signature(e.to_string()))?;

    Ok(address_of(&key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_recover() {
        let key = SigningKey::random();
        let hash = keccak256(b"batch period");
        let sig = key.sign_hash(&hash).unwrap();

        assert_eq!(sig.len(), SIGNATURE_LENGTH);
        assert_eq!(recover_signer(&hash, &sig).unwrap(), key.address());
    }

    #[test]
    fn test_recover_with_legacy_v() {
        let key = SigningKey::random();
        let hash = keccak256(b"legacy");
        let mut sig = key.sign_hash(&hash).unwrap();
        sig[64] += 27;

        assert_eq!(recover_signer(&hash, &sig).unwrap(), key.address());
    }

    #[test]
    fn test_recover_other_hash_yields_other_address() {
        let key = SigningKey::random();
        let sig = key.sign_hash(&keccak256(b"one")).unwrap();

        if let Ok(addr) = recover_signer(&keccak256(b"two"), &sig) {
            assert_ne!(addr, key.address());
        }
    }

    #[test]
    fn test_recover_rejects_short_signature() {
        let hash = keccak256(b"x");
        assert!(matches!(
            recover_signer(&hash, &[0u8; 64]),
            Err(ConsensusError::Signature(_))
        ));
    }

    #[test]
    fn test_known_key_address() {
        // private key 1 maps to the well-known generator address
        let mut bytes = [0u8; 32];
        bytes[31] = 1;
        let key = SigningKey::from_bytes(&bytes).unwrap();
        assert_eq!(
            key.address().to_string(),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    #[test]
    fn test_from_hex() {
        let key = SigningKey::from_hex(
            "0x0000000000000000000000000000000000000000000000000000000000000001",
        )
        .unwrap();
        assert_eq!(
            key.address().to_string(),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }
}
