//! Ed25519 node identity keys.
//!
//! The long-lived signing key that identifies a node across sessions.
//! Public keys order and compare by their raw bytes so they can be used as
//! map keys and sorted into rosters. Text form is standard base64, which is
//! also how keys travel in handshake headers.

use crate::error::CryptoError;
use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::fmt;

/// A node's public signing key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Parses a public key from its 32 raw bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        VerifyingKey::from_bytes(bytes)
            .map(PublicKey)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Verifies `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        use ed25519_dalek::Verifier;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        self.0
            .verify(message, &sig)
            .map_err(|_| CryptoError::BadSignature)
    }

    /// Base64 text form, as used in handshake headers.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.as_bytes())
    }

    /// Parses the base64 text form.
    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(s.trim())
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidEncoding("wrong key length".to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// A node's secret signing key.
#[derive(Clone)]
pub struct SecretKey(SigningKey);

impl SecretKey {
    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self(SigningKey::generate(&mut rng))
    }

    /// Derives a key deterministically from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self(SigningKey::from_bytes(seed))
    }

    /// Signs a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        use ed25519_dalek::Signer;
        Signature(self.0.sign(message).to_bytes())
    }

    /// The corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    /// Raw seed bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material.
        write!(f, "SecretKey(<hidden>)")
    }
}

/// A detached Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    /// Raw signature bytes.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Wraps raw bytes without validation; use [`PublicKey::verify`] to
    /// check validity.
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Base64 text form.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Parses the base64 text form.
    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(s.trim())
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidEncoding("wrong signature length".to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", &self.to_base64()[..12])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let secret = SecretKey::generate();
        let sig = secret.sign(b"message");
        assert!(secret.public_key().verify(b"message", &sig).is_ok());
        assert!(secret.public_key().verify(b"other", &sig).is_err());
    }

    #[test]
    fn wrong_key_rejects() {
        let a = SecretKey::generate();
        let b = SecretKey::generate();
        let sig = a.sign(b"message");
        assert!(b.public_key().verify(b"message", &sig).is_err());
    }

    #[test]
    fn base64_round_trip() {
        let secret = SecretKey::generate();
        let public = secret.public_key();
        let text = public.to_base64();
        assert_eq!(PublicKey::from_base64(&text).unwrap(), public);

        let sig = secret.sign(b"x");
        let text = sig.to_base64();
        assert_eq!(Signature::from_base64(&text).unwrap(), sig);
    }

    #[test]
    fn seed_is_deterministic() {
        let a = SecretKey::from_seed(&[9u8; 32]);
        let b = SecretKey::from_seed(&[9u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn ordering_is_stable() {
        let mut keys: Vec<PublicKey> = (0..4u8)
            .map(|i| SecretKey::from_seed(&[i; 32]).public_key())
            .collect();
        keys.sort();
        let bytes: Vec<_> = keys.iter().map(|k| *k.as_bytes()).collect();
        let mut sorted = bytes.clone();
        sorted.sort();
        assert_eq!(bytes, sorted);
    }
}
