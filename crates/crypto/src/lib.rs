//! Cryptographic identity and hashing for rill.
//!
//! A node is identified across sessions by its Ed25519 [`PublicKey`]
//! (the "node key"). Content hashes are SHA-512-half: the first 32 bytes
//! of a SHA-512 digest.
//!
//! # Example
//!
//! ```rust
//! use rill_crypto::{SecretKey, sha512_half};
//!
//! let secret = SecretKey::generate();
//! let sig = secret.sign(b"payload");
//! assert!(secret.public_key().verify(b"payload", &sig).is_ok());
//!
//! let hash = sha512_half(b"payload");
//! assert!(!hash.is_zero());
//! ```

mod error;
mod hash;
mod keys;

pub use error::CryptoError;
pub use hash::{sha512_half, sha512_half_multi};
pub use keys::{PublicKey, SecretKey, Signature};
