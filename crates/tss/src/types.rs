//! Signer-cluster request and response types
//!
//! Field names and encodings follow the cluster's JSON API: snake_case keys, byte
//! slices as base64, block numbers as decimal strings.

use crate::error::{Result, TssError};
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use l2_consensus::types::{keccak256, Address, Hash};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code the cluster uses when a participant sabotaged signing
pub const CULPRIT_ERROR_CODE: i32 = 100;

/// Request kinds understood by the signer cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "askStateBatch")]
    AskStateBatch,
    #[serde(rename = "signStateBatch")]
    SignStateBatch,
    #[serde(rename = "askSlash")]
    AskSlash,
    #[serde(rename = "signSlash")]
    SignSlash,
}

/// Manager method running the keygen ceremony; not one of the signing `Method`s
pub const KEYGEN_METHOD: &str = "keygen";

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::AskStateBatch => "askStateBatch",
            Method::SignStateBatch => "signStateBatch",
            Method::AskSlash => "askSlash",
            Method::SignSlash => "signSlash",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A contiguous range of state roots to be signed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignStateRequest {
    #[serde(with = "crate::serde_helpers::u64_string")]
    pub start_block: u64,
    #[serde(with = "crate::serde_helpers::u64_string")]
    pub offset_starts_at_index: u64,
    pub state_roots: Vec<Hash>,
    pub election_id: u64,
}

impl SignStateRequest {
    /// Digest the cluster signs: keccak256 of the ABI encoding of
    /// `(bytes32[] state_roots, uint256 offset_starts_at_index)`
    pub fn digest(&self) -> Hash {
        let mut buf = Vec::with_capacity(32 * (3 + self.state_roots.len()));
        buf.extend_from_slice(&abi_word(0x40));
        buf.extend_from_slice(&abi_word(self.offset_starts_at_index));
        buf.extend_from_slice(&abi_word(self.state_roots.len() as u64));
        for root in &self.state_roots {
            buf.extend_from_slice(root);
        }
        keccak256(&buf)
    }
}

fn abi_word(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Why a sequencer is being slashed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SlashType {
    /// Failed to take part in signing
    Liveness = 1,
    /// Actively sabotaged signing
    Culprit = 2,
}

impl TryFrom<u8> for SlashType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(SlashType::Liveness),
            2 => Ok(SlashType::Culprit),
            other => Err(format!("unknown slash type {}", other)),
        }
    }
}

impl From<SlashType> for u8 {
    fn from(value: SlashType) -> Self {
        value as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashRequest {
    pub address: Address,
    pub batch_index: u64,
    pub sign_type: SlashType,
}

/// Answer to an `ask*` request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskResponse {
    pub result: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignResponse {
    #[serde(with = "crate::serde_helpers::base64_bytes", default)]
    pub signature: Vec<u8>,
    #[serde(with = "crate::serde_helpers::base64_bytes", default)]
    pub slash_tx_bytes: Vec<u8>,
    #[serde(default)]
    pub slash_tx_gas_price: String,
    #[serde(with = "crate::serde_helpers::bigint_opt", default)]
    pub slash_tx_gas_price_big_int: Option<BigInt>,
}

impl SignResponse {
    /// Whether a penalty transaction came back
    pub fn has_slash_tx(&self) -> bool {
        !self.slash_tx_bytes.is_empty()
    }

    /// Gas price of the slash transaction, from either field
    pub fn slash_gas_price(&self) -> Option<BigInt> {
        self.slash_tx_gas_price_big_int
            .clone()
            .or_else(|| self.slash_tx_gas_price.parse().ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeygenRequest {
    pub nodes: Vec<String>,
    pub threshold: u32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeygenResponse {
    /// Hex SEC1 public key of the cluster
    pub cluster_public_key: String,
}

/// Raw signature parts as reported by signing nodes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureData {
    /// Recovery byte, only the first byte is used
    #[serde(
        with = "crate::serde_helpers::base64_bytes",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub signature_recovery: Vec<u8>,
    #[serde(
        with = "crate::serde_helpers::base64_bytes",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub r: Vec<u8>,
    #[serde(
        with = "crate::serde_helpers::base64_bytes",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub s: Vec<u8>,
    /// Signed digest
    #[serde(
        with = "crate::serde_helpers::base64_bytes",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub m: Vec<u8>,
}

impl SignatureData {
    /// Split a 65-byte `r || s || v` signature over `digest`
    pub fn from_signature(signature: &[u8], digest: &Hash) -> Option<Self> {
        if signature.len() != 65 {
            return None;
        }
        Some(Self {
            signature_recovery: vec![signature[64]],
            r: signature[..32].to_vec(),
            s: signature[32..64].to_vec(),
            m: digest.to_vec(),
        })
    }

    /// Public key that signed `m`; recovery bytes 27/28 are accepted
    pub fn recover_key(&self) -> Result<VerifyingKey> {
        let raw = self
            .to_signature()
            .ok_or_else(|| TssError::InvalidSignature("incomplete signature parts".into()))?;
        if self.m.len() != 32 {
            return Err(TssError::InvalidSignature(format!(
                "digest must be 32 bytes, got {}",
                self.m.len()
            )));
        }

        let sig = Signature::from_slice(&raw[..64])
            .map_err(|e| TssError::InvalidSignature(e.to_string()))?;
        let v = match raw[64] {
            v @ 27..=28 => v - 27,
            v => v,
        };
        let recovery_id = RecoveryId::from_byte(v)
            .ok_or_else(|| TssError::InvalidSignature(format!("invalid recovery id {}", v)))?;

        VerifyingKey::recover_from_prehash(&self.m, &sig, recovery_id)
            .map_err(|e| TssError::InvalidSignature(e.to_string()))
    }

    /// 65-byte `r || s || v` form, if the parts are complete
    pub fn to_signature(&self) -> Option<Vec<u8>> {
        if self.r.len() > 32 || self.s.len() > 32 {
            return None;
        }
        let v = *self.signature_recovery.first()?;

        let mut out = vec![0u8; 65];
        out[32 - self.r.len()..32].copy_from_slice(&self.r);
        out[64 - self.s.len()..64].copy_from_slice(&self.s);
        out[64] = v;
        Some(out)
    }
}
