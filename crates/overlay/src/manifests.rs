//! Validator key rotation records.
//!
//! A manifest binds a validator's long-lived *master* key to a short-lived
//! *signing* key under a monotonic sequence number. For a given master key
//! only the highest-sequence manifest is kept; a manifest with a strictly
//! higher sequence revokes any lower one, and a manifest with the maximum
//! sequence number permanently revokes the master key.
//!
//! The cache is process-wide state with a single owner; concurrent
//! applications are serialized per master key. Accepted manifests are
//! written through to a raw-bytes table so the view survives restarts.

use crate::{OverlayError, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use dashmap::DashMap;
use parking_lot::RwLock;
use rill_common::{ConfigError, Hash256};
use rill_crypto::{sha512_half, PublicKey, SecretKey, Signature};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// A sequence number that permanently revokes the master key.
pub const REVOCATION_SEQ: u32 = u32::MAX;

/// Disposition of an applied manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Trusted, newest for its master key; cached and persisted.
    Accepted,
    /// Well-formed but the master key is not in the trusted list; published
    /// to observers, neither cached nor relayed by the caller's contract.
    Untrusted,
    /// Sequence not higher than the cached manifest; dropped.
    Stale,
    /// Malformed or bad signature; dropped.
    Invalid,
}

/// A signed key rotation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    master: Vec<u8>,
    signing: Vec<u8>,
    pub sequence: u32,
    signature: Vec<u8>,
}

impl Manifest {
    /// Creates and signs a manifest with the master secret key.
    pub fn new(master: &SecretKey, signing: &PublicKey, sequence: u32) -> Self {
        let master_public = master.public_key();
        let mut m = Self {
            master: master_public.as_bytes().to_vec(),
            signing: signing.as_bytes().to_vec(),
            sequence,
            signature: Vec::new(),
        };
        m.signature = master.sign(&m.signing_bytes()).as_bytes().to_vec();
        m
    }

    /// Decodes a manifest from raw bytes, checking field shapes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let m: Manifest = bincode::deserialize(bytes)
            .map_err(|e| OverlayError::Protocol(format!("bad manifest: {e}")))?;
        if m.master.len() != 32 || m.signing.len() != 32 || m.signature.len() != 64 {
            return Err(OverlayError::Protocol("bad manifest field length".into()));
        }
        Ok(m)
    }

    /// Canonical raw bytes, stable for persistence and content identity.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("manifest serializes")
    }

    /// Content hash for relay suppression.
    pub fn hash(&self) -> Hash256 {
        sha512_half(&self.encode())
    }

    pub fn master_key(&self) -> Result<PublicKey> {
        let bytes: [u8; 32] = self.master.as_slice().try_into().unwrap_or([0u8; 32]);
        PublicKey::from_bytes(&bytes).map_err(Into::into)
    }

    pub fn signing_key(&self) -> Result<PublicKey> {
        let bytes: [u8; 32] = self.signing.as_slice().try_into().unwrap_or([0u8; 32]);
        PublicKey::from_bytes(&bytes).map_err(Into::into)
    }

    /// True when this manifest permanently revokes its master key.
    pub fn revokes(&self) -> bool {
        self.sequence == REVOCATION_SEQ
    }

    fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 32 + 32 + 4);
        out.extend_from_slice(b"MAN\0");
        out.extend_from_slice(&self.master);
        out.extend_from_slice(&self.signing);
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out
    }

    /// Verifies the master signature.
    pub fn verify(&self) -> bool {
        let Ok(master) = self.master_key() else {
            return false;
        };
        let sig_bytes: [u8; 64] = match self.signature.as_slice().try_into() {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        master
            .verify(&self.signing_bytes(), &Signature::from_bytes(sig_bytes))
            .is_ok()
    }
}

/// Cache of the highest-sequence manifest per master key.
pub struct ManifestCache {
    by_master: DashMap<PublicKey, Manifest>,
    trusted: RwLock<BTreeSet<PublicKey>>,
}

impl ManifestCache {
    pub fn new() -> Self {
        Self {
            by_master: DashMap::new(),
            trusted: RwLock::new(BTreeSet::new()),
        }
    }

    /// Bulk-loads trusted validator master keys from configuration lines.
    /// Any malformed entry is fatal.
    pub fn load_validator_keys(&self, lines: &[String]) -> std::result::Result<usize, ConfigError> {
        let mut keys = BTreeSet::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let key = PublicKey::from_base64(line)
                .map_err(|_| ConfigError::InvalidValidatorEntry(line.to_string()))?;
            keys.insert(key);
        }
        let count = keys.len();
        self.trusted.write().extend(keys);
        Ok(count)
    }

    /// Whether `master` is a trusted validator key.
    pub fn trusted(&self, master: &PublicKey) -> bool {
        self.trusted.read().contains(master)
    }

    /// Applies a manifest, updating the trusted-key view.
    ///
    /// Updates for a given master key are serialized by the per-key map
    /// entry, so racing applications of the same rotation settle into the
    /// highest sequence.
    pub fn apply_manifest(&self, m: &Manifest) -> Disposition {
        if !m.verify() {
            return Disposition::Invalid;
        }
        let Ok(master) = m.master_key() else {
            return Disposition::Invalid;
        };
        if !self.trusted(&master) {
            return Disposition::Untrusted;
        }

        // The entry guard holds the per-key shard lock, serializing
        // concurrent applications for this master.
        match self.by_master.entry(master) {
            dashmap::mapref::entry::Entry::Occupied(mut cur) => {
                if cur.get().sequence >= m.sequence {
                    return Disposition::Stale;
                }
                cur.insert(m.clone());
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(m.clone());
            }
        }
        Disposition::Accepted
    }

    /// Seeds the cache from the manifest configured for this node's own
    /// validator key. Anything but acceptance is a fatal configuration
    /// error.
    pub fn config_manifest(&self, m: Manifest) -> std::result::Result<(), ConfigError> {
        match self.apply_manifest(&m) {
            Disposition::Accepted => Ok(()),
            other => Err(ConfigError::InvalidValidatorEntry(format!(
                "configured manifest not usable: {other:?}"
            ))),
        }
    }

    /// Parses and seeds a base64 manifest from configuration.
    pub fn config_manifest_base64(&self, text: &str) -> std::result::Result<(), ConfigError> {
        let bytes = STANDARD
            .decode(text.trim())
            .map_err(|e| ConfigError::InvalidValidatorEntry(e.to_string()))?;
        let m = Manifest::decode(&bytes)
            .map_err(|e| ConfigError::InvalidValidatorEntry(e.to_string()))?;
        self.config_manifest(m)
    }

    /// The manifest currently cached for `master`.
    pub fn current(&self, master: &PublicKey) -> Option<Manifest> {
        self.by_master.get(master).map(|m| m.clone())
    }

    /// The signing key currently authorized for `master`, if any. Revoked
    /// masters have no signing key.
    pub fn signing_key_for(&self, master: &PublicKey) -> Option<PublicKey> {
        let m = self.by_master.get(master)?;
        if m.revokes() {
            return None;
        }
        m.signing_key().ok()
    }

    /// Number of cached manifests.
    pub fn len(&self) -> usize {
        self.by_master.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_master.is_empty()
    }

    /// Ensures the persistence table exists.
    pub fn init_db(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS manifests (raw BLOB PRIMARY KEY)",
            [],
        )?;
        Ok(())
    }

    /// Re-applies every persisted manifest. Rows are idempotent by
    /// content, so reloading is safe.
    pub fn load(&self, conn: &Connection) -> Result<usize> {
        Self::init_db(conn)?;
        let mut stmt = conn.prepare("SELECT raw FROM manifests")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;

        let mut applied = 0usize;
        for raw in rows.flatten() {
            match Manifest::decode(&raw) {
                Ok(m) => match self.apply_manifest(&m) {
                    Disposition::Accepted => applied += 1,
                    Disposition::Stale => {}
                    other => debug!(?other, "stored manifest not applied"),
                },
                Err(e) => warn!("undecodable stored manifest: {e}"),
            }
        }
        if applied > 0 {
            info!(applied, "loaded manifests");
        }
        Ok(applied)
    }

    /// Writes every cached manifest. Idempotent by content.
    pub fn save(&self, conn: &Connection) -> Result<()> {
        Self::init_db(conn)?;
        for entry in self.by_master.iter() {
            Self::store_raw(conn, &entry.value().encode())?;
        }
        Ok(())
    }

    /// Write-through hook for a single accepted manifest.
    pub fn store_raw(conn: &Connection, raw: &[u8]) -> Result<()> {
        Self::init_db(conn)?;
        conn.execute(
            "INSERT OR IGNORE INTO manifests (raw) VALUES (?1)",
            rusqlite::params![raw],
        )?;
        Ok(())
    }
}

impl Default for ManifestCache {
    fn default() -> Self {
        Self::new()
    }
}
