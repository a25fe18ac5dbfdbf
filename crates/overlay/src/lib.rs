//! P2P overlay networking for rill.
//!
//! This crate implements the overlay network of a rill node: it accepts and
//! initiates encrypted long-lived connections with other nodes, negotiates
//! the ledger-protocol handshake on top of an HTTP upgrade, admits peers
//! against finite connection slots and per-source resource budgets, and
//! relays protocol messages between peers while suppressing duplicates.
//!
//! # Architecture
//!
//! - [`Overlay`] - central coordinator owning all peer sessions, connect
//!   attempts and the once-per-second timer; orchestrates shutdown
//! - [`PeerFinder`] - connection slots, boot cache and autoconnect policy
//! - [`PeerHandle`] - a live, handshaked peer session
//! - [`HashRouter`] - content-hash suppression preventing relay loops
//! - [`ManifestCache`] - validator key rotation records
//!
//! # Connection lifecycle
//!
//! Inbound: the TLS listener reads an HTTP `GET /` carrying
//! `Upgrade: RILL/<version>` plus signed hello headers, the overlay consults
//! the resource manager and slot table, verifies the hello against the TLS
//! session's shared value and responds `101 Switching Protocols` (or `503`
//! with a `peer-ips` redirect list when full). Outbound mirrors this from
//! the dialer side, driven by a connect attempt under 15-second watchdogs.

mod connect;
mod error;
mod finder;
mod handshake;
mod http;
mod manager;
mod manifests;
mod message;
mod peer;
mod resource;
mod router;
mod slots;

pub use error::{HandshakeError, OverlayError};
pub use finder::{BootCache, BootEntry, PeerFinder};
pub use handshake::{shared_value, supported_versions, Hello, SharedValue, VerifiedHello};
pub use http::{Headers, Request, Response};
pub use manager::{Handoff, Overlay, OverlayEvent, PeerSet, Setup, TlsServerStream};
pub use manifests::{Disposition, Manifest, ManifestCache, REVOCATION_SEQ};
pub use message::{EndpointGossip, ManifestSet, Message, MessageCodec, Proposal, Validation};
pub use peer::PeerHandle;
pub use resource::{Consumer, ResourceManager, TrafficCategory, TrafficSnapshot};
pub use router::{HashRouter, RELAYED};
pub use slots::{ActivateResult, Direction, FinderConfig, Slot, SlotId, SlotState};

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// Result type for overlay operations.
pub type Result<T> = std::result::Result<T, OverlayError>;

/// Protocol token carried in the HTTP `Upgrade` header.
pub const PROTOCOL_TOKEN: &str = "RILL";

/// Lowest protocol version this node still speaks.
pub const MIN_PROTOCOL: ProtocolVersion = ProtocolVersion(1, 1);

/// Protocol version this node prefers.
pub const CURRENT_PROTOCOL: ProtocolVersion = ProtocolVersion(1, 2);

/// Peers at or above this version understand hop counts on relayed
/// messages.
pub const HOPS_AWARE_PROTOCOL: ProtocolVersion = ProtocolVersion(1, 2);

/// `User-Agent` / hello build string.
pub const USER_AGENT: &str = concat!("rill-", env!("CARGO_PKG_VERSION"));

/// A protocol version as `(major, minor)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(pub u16, pub u16);

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}.{}", PROTOCOL_TOKEN, self.0, self.1)
    }
}

impl FromStr for ProtocolVersion {
    type Err = ();

    /// Parses a single `RILL/x.y` token.
    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        let rest = s.trim().strip_prefix(PROTOCOL_TOKEN).ok_or(())?;
        let rest = rest.strip_prefix('/').ok_or(())?;
        let (major, minor) = rest.split_once('.').ok_or(())?;
        let major: u16 = major.parse().map_err(|_| ())?;
        let minor: u16 = minor.parse().map_err(|_| ())?;
        Ok(ProtocolVersion(major, minor))
    }
}

/// Parses a comma-separated list of protocol tokens, ignoring anything
/// unrecognized. The result is sorted and deduplicated.
pub fn parse_protocol_versions(s: &str) -> Vec<ProtocolVersion> {
    let mut versions: Vec<ProtocolVersion> = s
        .split(',')
        .filter_map(|tok| tok.trim().parse().ok())
        .collect();
    versions.sort();
    versions.dedup();
    versions
}

/// Picks the highest protocol version shared with a peer.
pub fn negotiate_version(theirs: &[ProtocolVersion]) -> Option<ProtocolVersion> {
    theirs
        .iter()
        .copied()
        .filter(|v| *v >= MIN_PROTOCOL && *v <= CURRENT_PROTOCOL)
        .max()
}

/// A network endpoint: IP address and port.
///
/// `port == 0` means "unknown / not listening" and such endpoints are never
/// dialed or gossiped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    /// Creates an endpoint.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// The endpoint of a connected socket.
    pub fn from_socket(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    /// Socket address form for dialing.
    pub fn to_socket(self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// True for loopback, RFC 1918 and link-local addresses. Private
    /// endpoints are not gossiped to other peers.
    pub fn is_private(&self) -> bool {
        match self.ip {
            IpAddr::V4(v4) => {
                v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
            }
            IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
        }
    }

    /// The same endpoint with a different port.
    pub fn with_port(self, port: u16) -> Self {
        Self { port, ..self }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_socket())
    }
}

impl FromStr for Endpoint {
    type Err = OverlayError;

    /// Accepts `ip:port` socket-address syntax or the config-file
    /// `ip port` form.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::from_socket(addr));
        }
        if let Some((ip, port)) = s.rsplit_once(' ') {
            let ip: IpAddr = ip
                .trim()
                .parse()
                .map_err(|_| OverlayError::Protocol(format!("bad endpoint: {s}")))?;
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|_| OverlayError::Protocol(format!("bad endpoint: {s}")))?;
            return Ok(Self::new(ip, port));
        }
        Err(OverlayError::Protocol(format!("bad endpoint: {s}")))
    }
}

/// Convenience for tests and config parsing.
pub fn endpoint_v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Endpoint {
    Endpoint::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parses_both_forms() {
        let a: Endpoint = "198.51.100.1:51235".parse().unwrap();
        let b: Endpoint = "198.51.100.1 51235".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "198.51.100.1:51235");
    }

    #[test]
    fn endpoint_rejects_garbage() {
        assert!("nonsense".parse::<Endpoint>().is_err());
        assert!("1.2.3.4 notaport".parse::<Endpoint>().is_err());
    }

    #[test]
    fn private_classification() {
        assert!(endpoint_v4(10, 0, 0, 1, 1).is_private());
        assert!(endpoint_v4(192, 168, 1, 1, 1).is_private());
        assert!(endpoint_v4(127, 0, 0, 1, 1).is_private());
        assert!(!endpoint_v4(198, 51, 100, 1, 1).is_private());
    }

    #[test]
    fn protocol_version_round_trip() {
        let v = ProtocolVersion(1, 2);
        assert_eq!(v.to_string(), "RILL/1.2");
        assert_eq!(v.to_string().parse::<ProtocolVersion>().unwrap(), v);
    }

    #[test]
    fn parse_versions_sorts_and_dedups() {
        let versions = parse_protocol_versions("RILL/1.2, RILL/1.1, RILL/1.2, bogus");
        assert_eq!(versions, vec![ProtocolVersion(1, 1), ProtocolVersion(1, 2)]);
    }

    #[test]
    fn negotiation_picks_highest_common() {
        assert_eq!(
            negotiate_version(&[ProtocolVersion(1, 1), ProtocolVersion(1, 2)]),
            Some(ProtocolVersion(1, 2))
        );
        assert_eq!(negotiate_version(&[ProtocolVersion(9, 0)]), None);
        assert_eq!(negotiate_version(&[]), None);
    }
}
