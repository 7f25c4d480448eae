//! Fingerprint oracle seam
//!
//! The search core never looks inside a fingerprint. It only needs a
//! deterministic `key -> hex string` function with a fixed output width.
//! `Hash160Oracle` is the production backend (bitcoin hash160 of the
//! compressed public key); `FnOracle` adapts any closure.

use crate::error::OracleError;
use crate::range::Key;
use ripemd::Ripemd160;
use secp256k1::{PublicKey, Secp256k1, SecretKey, SignOnly};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Lowercase hexadecimal digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Parse a hex string with an optional single `0x` prefix, normalizing
    /// to lowercase
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.trim();
        let digits = hex
            .strip_prefix("0x")
            .or_else(|| hex.strip_prefix("0X"))
            .unwrap_or(hex);
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(digits.to_ascii_lowercase()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Width in hex characters
    pub fn width(&self) -> usize {
        self.0.len()
    }

    /// Leading `len` hex characters (the whole string if shorter)
    pub fn prefix(&self, len: usize) -> &str {
        &self.0[..len.min(self.0.len())]
    }

    /// Number of positions where both fingerprints carry the same hex digit
    pub fn shared_positions(&self, other: &Fingerprint) -> usize {
        self.0
            .bytes()
            .zip(other.0.bytes())
            .filter(|(a, b)| a == b)
            .count()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic, pure `key -> fingerprint` function
pub trait FingerprintOracle: Send + Sync {
    fn fingerprint(&self, key: Key) -> Result<Fingerprint, OracleError>;
}

impl<O: FingerprintOracle + ?Sized> FingerprintOracle for std::sync::Arc<O> {
    fn fingerprint(&self, key: Key) -> Result<Fingerprint, OracleError> {
        (**self).fingerprint(key)
    }
}

/// hash160 = RIPEMD160(SHA256(compressed secp256k1 public key))
pub struct Hash160Oracle {
    secp: Secp256k1<SignOnly>,
}

impl Hash160Oracle {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::signing_only(),
        }
    }

    pub fn hash160(data: &[u8]) -> [u8; 20] {
        let sha = Sha256::digest(data);
        let ripemd = Ripemd160::digest(sha);
        let mut result = [0u8; 20];
        result.copy_from_slice(&ripemd);
        result
    }
}

impl Default for Hash160Oracle {
    fn default() -> Self {
        Self::new()
    }
}

impl FingerprintOracle for Hash160Oracle {
    fn fingerprint(&self, key: Key) -> Result<Fingerprint, OracleError> {
        let mut secret = [0u8; 32];
        secret[16..].copy_from_slice(&key.to_be_bytes());
        // Rejects zero; u128 keys never reach the curve order
        let secret_key = SecretKey::from_slice(&secret).map_err(|_| OracleError::OutOfDomain(key))?;
        let public_key = PublicKey::from_secret_key(&self.secp, &secret_key);
        Ok(Fingerprint::from_bytes(&Self::hash160(&public_key.serialize())))
    }
}

/// Closure-backed oracle
pub struct FnOracle<F>(F);

impl<F> FnOracle<F>
where
    F: Fn(Key) -> Result<Fingerprint, OracleError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> FingerprintOracle for FnOracle<F>
where
    F: Fn(Key) -> Result<Fingerprint, OracleError> + Send + Sync,
{
    fn fingerprint(&self, key: Key) -> Result<Fingerprint, OracleError> {
        (self.0)(key)
    }
}
