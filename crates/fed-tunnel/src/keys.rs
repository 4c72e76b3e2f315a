//! Curve25519 key types for tunnel peer identity.
//!
//! Tunnel links are keyed by Curve25519 key pairs (32 bytes each side).
//! Public keys travel in handshake accept responses; private keys never
//! leave the local fabric.

use std::fmt;

use base64::Engine;
use rand_core::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::TunnelError;

/// Tunnel key size in bytes (256-bit Curve25519 keys).
pub const KEY_SIZE: usize = 32;

/// A tunnel public key (Curve25519, 32 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    /// Creates a public key from raw bytes.
    #[must_use]
    pub const fn from_bytes_array(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Creates a public key from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TunnelError> {
        if bytes.len() != KEY_SIZE {
            return Err(TunnelError::InvalidKeyLength(bytes.len()));
        }
        let mut arr = [0u8; KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Returns the raw bytes of the public key.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decodes a public key from base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or wrong length.
    pub fn from_base64(s: &str) -> Result<Self, TunnelError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|e| TunnelError::InvalidBase64(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b64 = self.to_base64();
        let short = &b64[..8.min(b64.len())];
        write!(f, "PublicKey({short}...)")
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// A tunnel private key (Curve25519, 32 bytes).
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    /// Generates a new private key from OS-level entropy.
    ///
    /// Key material comes directly from the operating system's CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    /// Creates a private key from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TunnelError> {
        if bytes.len() != KEY_SIZE {
            return Err(TunnelError::InvalidKeyLength(bytes.len()));
        }
        let mut arr = [0u8; KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self(StaticSecret::from(arr)))
    }

    /// Returns the raw bytes of the private key.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; KEY_SIZE] {
        self.0.to_bytes()
    }

    /// Derives the corresponding public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        let public = X25519PublicKey::from(&self.0);
        PublicKey(*public.as_bytes())
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.to_bytes())
    }

    /// Decodes a private key from base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or wrong length.
    pub fn from_base64(s: &str) -> Result<Self, TunnelError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|e| TunnelError::InvalidBase64(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey").field("key", &"[REDACTED]").finish()
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes().ct_eq(&other.to_bytes()).into()
    }
}

impl Eq for PrivateKey {}

impl Serialize for PrivateKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// A Curve25519 key pair for one side of a tunnel link.
#[derive(Clone, Debug)]
pub struct KeyPair {
    private: PrivateKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generates a new random key pair.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_private_key(PrivateKey::generate())
    }

    /// Creates a key pair from an existing private key.
    #[must_use]
    pub fn from_private_key(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }

    /// Returns the public half.
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Returns the private half.
    #[must_use]
    pub fn private_key(&self) -> &PrivateKey {
        &self.private
    }

    /// Consumes the pair and returns the private key.
    #[must_use]
    pub fn into_private_key(self) -> PrivateKey {
        self.private
    }
}

/// Generates a fresh `(private, public)` key pair.
#[must_use]
pub fn generate_keypair() -> (PrivateKey, PublicKey) {
    let private = PrivateKey::generate();
    let public = private.public_key();
    (private, public)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    // ==================== PublicKey Tests ====================

    #[test]
    fn public_key_from_bytes_roundtrip() {
        let bytes = [7u8; KEY_SIZE];
        let key = PublicKey::from_bytes(&bytes).expect("valid key");
        assert_eq!(key.as_bytes(), &bytes);
    }

    #[test]
    fn public_key_wrong_length_fails() {
        let result = PublicKey::from_bytes(&[1u8; 16]);
        assert!(matches!(result, Err(TunnelError::InvalidKeyLength(16))));
    }

    #[test]
    fn public_key_base64_roundtrip() {
        let key = PrivateKey::generate().public_key();
        let encoded = key.to_base64();
        let decoded = PublicKey::from_base64(&encoded).expect("valid base64");
        assert_eq!(key, decoded);
    }

    #[test_case("" ; "empty")]
    #[test_case("not!base64!!" ; "invalid characters")]
    #[test_case("YWJj" ; "decodes to wrong length")]
    #[test_case("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA" ; "missing padding")]
    fn malformed_base64_key_is_rejected(input: &str) {
        assert!(PublicKey::from_base64(input).is_err());
        assert!(PrivateKey::from_base64(input).is_err());
    }

    #[test]
    fn public_key_debug_is_truncated() {
        let key = PrivateKey::generate().public_key();
        let debug = format!("{key:?}");
        assert!(debug.starts_with("PublicKey("));
        assert!(debug.ends_with("...)"));
    }

    #[test]
    fn public_key_serde_roundtrip() {
        let key = PrivateKey::generate().public_key();
        let json = serde_json::to_string(&key).expect("serialize");
        let back: PublicKey = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(key, back);
    }

    // ==================== PrivateKey Tests ====================

    #[test]
    fn private_key_generate_derives_public() {
        let (private, public) = generate_keypair();
        assert_eq!(private.public_key(), public);
    }

    #[test]
    fn private_key_debug_is_redacted() {
        let key = PrivateKey::generate();
        let debug = format!("{key:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&key.to_base64()));
    }

    #[test]
    fn private_key_base64_roundtrip() {
        let key = PrivateKey::generate();
        let decoded = PrivateKey::from_base64(&key.to_base64()).expect("valid base64");
        assert_eq!(key, decoded);
    }

    #[test]
    fn distinct_keys_are_unequal() {
        let a = PrivateKey::generate();
        let b = PrivateKey::generate();
        assert_ne!(a, b);
        assert_ne!(a.public_key(), b.public_key());
    }

    // ==================== KeyPair Tests ====================

    #[test]
    fn keypair_from_private_key_is_consistent() {
        let private = PrivateKey::generate();
        let pair = KeyPair::from_private_key(private.clone());
        assert_eq!(*pair.public_key(), private.public_key());
        assert_eq!(pair.into_private_key(), private);
    }

    #[test]
    fn keypair_generate_is_unique() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_ne!(a.public_key(), b.public_key());
    }
}
