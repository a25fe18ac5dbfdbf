//! The peer handshake: hello headers and their verification.
//!
//! On top of the HTTP upgrade both sides exchange a "hello": the node's
//! public key, its protocol version range, optional addressing hints and a
//! signature over a **shared value** derived from the TLS session's
//! exporter keying material. Both endpoints can compute the shared value
//! independently but nobody outside the session can, so the signature
//! binds the node key to this exact TLS session and cannot be replayed.
//!
//! Verification runs the same steps on both sides:
//!
//! 1. compute the shared value locally; fail if unavailable
//! 2. parse the hello headers; fail on malformed or missing fields
//! 3. verify the signature over the shared value with the advertised key
//! 4. check against our own node key (self-connect) and currently active
//!    node keys (duplicate)
//! 5. classify: cluster member if the key appears in the configured roster

use crate::http::Headers;
use crate::{
    negotiate_version, parse_protocol_versions, HandshakeError, ProtocolVersion,
    HOPS_AWARE_PROTOCOL, MIN_PROTOCOL,
};
use rill_common::Hash256;
use rill_crypto::{PublicKey, SecretKey, Signature};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{SystemTime, UNIX_EPOCH};

/// Tolerated difference between our clock and the peer's, in seconds.
const CLOCK_TOLERANCE_SECS: u64 = 20;

/// Exporter label for the session shared value. Changing this is a
/// protocol break.
const EXPORTER_LABEL: &[u8] = b"EXPORTER-rill-peer-shared-value";

/// The 32-byte value both TLS endpoints derive from the live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedValue(pub [u8; 32]);

/// Derives the shared value from a TLS connection.
///
/// Fails with [`HandshakeError::NoSharedValue`] until the TLS handshake has
/// completed (or if the negotiated protocol cannot export keying
/// material).
pub fn shared_value<Data>(
    conn: &rustls::ConnectionCommon<Data>,
) -> Result<SharedValue, HandshakeError> {
    let out = conn
        .export_keying_material([0u8; 32], EXPORTER_LABEL, None)
        .map_err(|_| HandshakeError::NoSharedValue)?;
    Ok(SharedValue(out))
}

/// Seconds since the Unix epoch.
pub fn network_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The signed identity blob exchanged during the HTTP upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// The node's current public key.
    pub public_key: PublicKey,
    /// Signature over the session shared value.
    pub signature: Signature,
    /// Protocol versions the node speaks.
    pub versions: Vec<ProtocolVersion>,
    /// Self-reported public IPv4, when the node knows one.
    pub public_ip: Option<Ipv4Addr>,
    /// The address the sender observes on the other end.
    pub remote_ip: Option<IpAddr>,
    /// Sender's wall clock, seconds since epoch.
    pub network_time: u64,
    /// Hash of the sender's last closed ledger, when it has one.
    pub closed_ledger: Option<Hash256>,
    /// Cluster-membership advertisement.
    pub cluster: bool,
}

impl Hello {
    /// Builds and signs a hello for the given session.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        secret: &SecretKey,
        shared: &SharedValue,
        versions: Vec<ProtocolVersion>,
        public_ip: Option<Ipv4Addr>,
        remote_ip: Option<IpAddr>,
        closed_ledger: Option<Hash256>,
        cluster: bool,
    ) -> Self {
        Self {
            public_key: secret.public_key(),
            signature: secret.sign(&shared.0),
            versions,
            public_ip,
            remote_ip,
            network_time: network_time(),
            closed_ledger,
            cluster,
        }
    }

    /// Appends the hello headers. Field names and value encodings are
    /// stable across versions; serializing then parsing a hello yields
    /// byte-equal headers.
    pub fn append_to(&self, headers: &mut Headers) {
        headers.insert("Public-Key", self.public_key.to_base64());
        headers.insert("Session-Signature", self.signature.to_base64());
        headers.insert(
            "Protocol-Versions",
            self.versions
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        );
        headers.insert("Network-Time", self.network_time.to_string());
        if let Some(ip) = self.public_ip {
            headers.insert("Public-IP", ip.to_string());
        }
        if let Some(ip) = self.remote_ip {
            headers.insert("Remote-IP", ip.to_string());
        }
        if let Some(ledger) = self.closed_ledger {
            headers.insert("Closed-Ledger", ledger.to_hex());
        }
        if self.cluster {
            headers.insert("Cluster", "yes");
        }
    }

    /// Parses hello headers. Missing or unparseable required fields are
    /// [`HandshakeError::Malformed`].
    pub fn parse(headers: &Headers) -> Result<Self, HandshakeError> {
        let public_key = headers
            .get("Public-Key")
            .ok_or_else(|| HandshakeError::Malformed("missing Public-Key".into()))?;
        let public_key = PublicKey::from_base64(public_key)
            .map_err(|e| HandshakeError::Malformed(format!("Public-Key: {e}")))?;

        let signature = headers
            .get("Session-Signature")
            .ok_or_else(|| HandshakeError::Malformed("missing Session-Signature".into()))?;
        let signature = Signature::from_base64(signature)
            .map_err(|e| HandshakeError::Malformed(format!("Session-Signature: {e}")))?;

        let versions = headers
            .get("Protocol-Versions")
            .map(parse_protocol_versions)
            .unwrap_or_default();
        if versions.is_empty() {
            return Err(HandshakeError::Malformed("missing Protocol-Versions".into()));
        }

        let network_time = headers
            .get("Network-Time")
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| HandshakeError::Malformed("missing Network-Time".into()))?;

        let public_ip = match headers.get("Public-IP") {
            Some(v) => Some(
                v.trim()
                    .parse()
                    .map_err(|_| HandshakeError::Malformed("Public-IP".into()))?,
            ),
            None => None,
        };
        let remote_ip = match headers.get("Remote-IP") {
            Some(v) => Some(
                v.trim()
                    .parse()
                    .map_err(|_| HandshakeError::Malformed("Remote-IP".into()))?,
            ),
            None => None,
        };
        let closed_ledger = match headers.get("Closed-Ledger") {
            Some(v) => {
                let bytes = hex::decode(v.trim())
                    .map_err(|_| HandshakeError::Malformed("Closed-Ledger".into()))?;
                let bytes: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| HandshakeError::Malformed("Closed-Ledger".into()))?;
                Some(Hash256::from_bytes(bytes))
            }
            None => None,
        };
        let cluster = headers
            .get("Cluster")
            .map(|v| v.trim().eq_ignore_ascii_case("yes"))
            .unwrap_or(false);

        Ok(Self {
            public_key,
            signature,
            versions,
            public_ip,
            remote_ip,
            network_time,
            closed_ledger,
            cluster,
        })
    }
}

/// The result of a successful hello verification.
#[derive(Debug, Clone)]
pub struct VerifiedHello {
    pub public_key: PublicKey,
    /// Highest protocol version shared with the peer.
    pub version: ProtocolVersion,
    /// Whether the peer is in our configured cluster roster.
    pub cluster: bool,
    /// Whether the negotiated version understands hop counts.
    pub hops_aware: bool,
    pub public_ip: Option<Ipv4Addr>,
    pub closed_ledger: Option<Hash256>,
}

/// Verifies a parsed hello against this session.
///
/// `duplicate` reports whether a node key already has a live session; it
/// is consulted after the signature proves the key is really on the other
/// end of this connection.
pub fn verify_hello(
    hello: &Hello,
    shared: &SharedValue,
    our_key: &PublicKey,
    cluster_roster: &BTreeSet<PublicKey>,
    duplicate: impl Fn(&PublicKey) -> bool,
) -> Result<VerifiedHello, HandshakeError> {
    hello
        .public_key
        .verify(&shared.0, &hello.signature)
        .map_err(|_| HandshakeError::BadSignature)?;

    if hello.public_key == *our_key {
        return Err(HandshakeError::SelfConnect);
    }
    if duplicate(&hello.public_key) {
        return Err(HandshakeError::DuplicateNode);
    }

    let now = network_time();
    if hello.network_time.abs_diff(now) > CLOCK_TOLERANCE_SECS {
        return Err(HandshakeError::ClockSkew);
    }

    let version = negotiate_version(&hello.versions).ok_or_else(|| {
        HandshakeError::UnsupportedVersion(
            hello
                .versions
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        )
    })?;

    Ok(VerifiedHello {
        public_key: hello.public_key,
        version,
        cluster: cluster_roster.contains(&hello.public_key),
        hops_aware: version >= HOPS_AWARE_PROTOCOL,
        public_ip: hello.public_ip,
        closed_ledger: hello.closed_ledger,
    })
}

/// The version list this node advertises.
pub fn supported_versions() -> Vec<ProtocolVersion> {
    vec![MIN_PROTOCOL, crate::CURRENT_PROTOCOL]
}
