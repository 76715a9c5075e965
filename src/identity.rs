//! Salted one-way hashing of raw radio identifiers.
//!
//! This is the only module that ever sees a raw device address. Everything
//! downstream carries an [`IdentityToken`], which can only be produced by
//! [`IdentityHasher::hash`] or parsed back from its 64-character hex form.

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

pub const SALT_LEN: usize = 32;
const TOKEN_LEN: usize = 32;

/// Process-lifetime secret mixed into every hash. Never serialized.
#[derive(Clone)]
pub struct Salt([u8; SALT_LEN]);

impl Salt {
    pub fn generate() -> Self {
        let mut bytes = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SALT_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Salt(<redacted>)")
    }
}

/// Opaque SHA-256 digest standing in for a device identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityToken([u8; TOKEN_LEN]);

impl IdentityToken {
    pub fn from_hex(value: &str) -> Result<Self, TokenParseError> {
        let mut bytes = [0u8; TOKEN_LEN];
        hex::decode_to_slice(value, &mut bytes).map_err(|_| TokenParseError {
            length: value.len(),
        })?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityToken({}..)", self.short())
    }
}

impl Serialize for IdentityToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for IdentityToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        IdentityToken::from_hex(&value).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("identity token must be 64 hex characters (got {length} characters)")]
pub struct TokenParseError {
    length: usize,
}

#[derive(Debug, Clone)]
pub struct IdentityHasher {
    salt: Salt,
}

impl IdentityHasher {
    pub fn new(salt: Salt) -> Self {
        Self { salt }
    }

    /// Addresses are trimmed and upper-cased first, so radio stacks that
    /// report different casings map to one token.
    pub fn hash(&self, raw_identifier: &str) -> IdentityToken {
        let normalized = raw_identifier.trim().to_ascii_uppercase();
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update(self.salt.0);
        let mut bytes = [0u8; TOKEN_LEN];
        bytes.copy_from_slice(&hasher.finalize());
        IdentityToken(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher(seed: u8) -> IdentityHasher {
        IdentityHasher::new(Salt::from_bytes([seed; SALT_LEN]))
    }

    #[test]
    fn same_identifier_and_salt_is_deterministic() {
        let hasher = hasher(7);

        assert_eq!(
            hasher.hash("AA:BB:CC:DD:EE:FF"),
            hasher.hash("AA:BB:CC:DD:EE:FF")
        );
    }

    #[test]
    fn casing_and_whitespace_do_not_split_a_device() {
        let hasher = hasher(4);

        assert_eq!(
            hasher.hash(" aa:bb:cc:dd:ee:ff\n"),
            hasher.hash("AA:BB:CC:DD:EE:FF")
        );
    }

    #[test]
    fn different_salts_produce_unlinkable_tokens() {
        let token_a = hasher(1).hash("AA:BB:CC:DD:EE:FF");
        let token_b = hasher(2).hash("AA:BB:CC:DD:EE:FF");

        assert_ne!(token_a, token_b);
    }

    #[test]
    fn token_hex_never_contains_raw_identifier() {
        let token = hasher(3).hash("aabbccddeeff");

        let encoded = token.to_hex();

        assert_eq!(encoded.len(), 64);
        assert!(!encoded.contains("aabbccddeeff"));
        assert_eq!(IdentityToken::from_hex(&encoded), Ok(token));
    }

    #[test]
    fn raw_mac_is_not_a_valid_token() {
        assert!(IdentityToken::from_hex("AA:BB:CC:DD:EE:FF").is_err());
        assert!(IdentityToken::from_hex("aabbccddeeff").is_err());
    }

    #[test]
    fn salt_debug_is_redacted() {
        let salt = Salt::from_bytes([9; SALT_LEN]);

        assert_eq!(format!("{salt:?}"), "Salt(<redacted>)");
    }
}
