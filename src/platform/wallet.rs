//! The relay's Ethereum wallet: address derivation and EIP-191 signing.

use k256::ecdsa::{SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};

use crate::error::{RelayError, Result};

/// A secp256k1 key and the checksummed address it controls.
pub struct Wallet {
    key: SigningKey,
    address: String,
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Wallet {
    /// Parse a hex private key, with or without the `0x` prefix.
    pub fn from_private_key(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let hex_key = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(hex_key)
            .map_err(|_| RelayError::InvalidConfig("Push private key is not valid hex".into()))?;
        let key = SigningKey::from_slice(&bytes).map_err(|_| {
            RelayError::InvalidConfig("Push private key is not a valid secp256k1 key".into())
        })?;
        let address = address_of(key.verifying_key());
        Ok(Self { key, address })
    }

    /// EIP-55 checksummed `0x...` address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// CAIP-10 identifier, `eip155:0x...`.
    pub fn did(&self) -> String {
        format!("eip155:{}", self.address)
    }

    /// `personal_sign`: 65-byte `r || s || v` signature as `0x` hex, with
    /// `v` in the 27/28 form.
    pub fn sign_message(&self, message: &[u8]) -> Result<String> {
        let digest = eip191_hash(message);
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| RelayError::other(format!("signing failed: {e}")))?;

        let mut bytes = signature.to_bytes().to_vec();
        bytes.push(recovery_id.to_byte() + 27);
        Ok(format!("0x{}", hex::encode(bytes)))
    }
}

/// Keccak-256 of `"\x19Ethereum Signed Message:\n" + len + message`.
pub fn eip191_hash(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

fn address_of(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    // skip the 0x04 SEC1 tag
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    to_checksum(&hex::encode(&hash[12..]))
}

/// EIP-55 mixed-case checksum of a lowercase hex address (no prefix).
fn to_checksum(lower: &str) -> String {
    let hash = hex::encode(Keccak256::digest(lower.as_bytes()));
    let mixed: String = lower
        .chars()
        .zip(hash.chars())
        .map(|(c, h)| {
            if c.is_ascii_alphabetic() && h.to_digit(16).unwrap_or(0) >= 8 {
                c.to_ascii_uppercase()
            } else {
                c
            }
        })
        .collect();
    format!("0x{}", mixed)
}
