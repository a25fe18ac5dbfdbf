//! Shared primitives for rill.
//!
//! This crate holds the types that every other crate in the workspace needs:
//! the 32-byte [`Hash256`] content hash and the node [`Config`] loaded from
//! TOML. It deliberately contains no networking or crypto logic.

mod config;
mod error;

pub use config::{Config, OverlaySection, PeerSection};
pub use error::ConfigError;

/// A 32-byte content hash.
///
/// Used to identify protocol messages (for relay suppression) and manifests.
/// The overlay computes these with SHA-512-half; this type is just the
/// value, independent of how it was produced.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The all-zero hash.
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Creates a hash from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// True if every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Hex-encoded form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for Hash256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short prefix is enough to identify a hash in logs.
        write!(f, "{}", &hex::encode(self.0)[..16])
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_basics() {
        let h = Hash256::from_bytes([7u8; 32]);
        assert!(!h.is_zero());
        assert!(Hash256::ZERO.is_zero());
        assert_eq!(h.to_hex().len(), 64);
        assert_eq!(h.to_string().len(), 16);
    }
}
