//! Connection slots and the per-slot admission state machine.
//!
//! A slot is the admission quantum governing one peer connection. The table
//! enforces the per-process caps on inbound and outbound connections, the
//! per-source-IP limit, self-connect rejection and node-key uniqueness.
//!
//! State machine:
//!
//! ```text
//! Connect --on_connected--> Connected --activate--> Active --on_closed--> Closed
//! Accept  ----------------------------activate----> Active --on_closed--> Closed
//! any --on_closed--> Closed (terminal)
//! ```

use crate::{Endpoint, ProtocolVersion};
use rill_common::Config;
use rill_crypto::PublicKey;
use std::collections::{HashMap, HashSet};

/// Opaque handle into the slot table, stable for a slot's lifetime.
pub type SlotId = u32;

/// Per-slot lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Inbound connection awaiting handshake.
    Accept,
    /// Outbound connection being dialed.
    Connect,
    /// Outbound TCP/TLS established, handshake pending.
    Connected,
    /// Handshake complete, peer admitted.
    Active,
    /// Terminal.
    Closed,
}

/// How a slot came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
    /// Outbound to a configured fixed peer; exempt from most caps.
    Fixed,
}

/// Outcome of the final admission gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivateResult {
    Success,
    /// Another live slot already uses this node key.
    Duplicate,
    /// Capacity exhausted; the slot remains reservable only for producing
    /// a redirect list.
    Full,
}

/// Peer finder policy knobs.
#[derive(Debug, Clone)]
pub struct FinderConfig {
    /// Total connection slots.
    pub max_peers: usize,
    /// Outbound slots, derived from `max_peers`.
    pub out_peers: usize,
    /// Neither accept nor solicit connections beyond fixed peers.
    pub peer_private: bool,
    /// Whether inbound connections are accepted at all.
    pub want_incoming: bool,
    /// Whether the once-per-second tick dials new peers.
    pub auto_connect: bool,
    /// Port this node listens on; 0 when not listening.
    pub listening_port: u16,
    /// Inclusive cap on inbound slots per source IP; 0 = unlimited.
    pub ip_limit: usize,
    /// Feature advertisement string (currently unused on the wire).
    pub features: String,
}

impl FinderConfig {
    /// Outbound share of the total slot count: roughly 15%, never fewer
    /// than 10 and never more than the total.
    pub fn calc_out_peers(max_peers: usize) -> usize {
        (max_peers * 15 / 100).max(10).min(max_peers)
    }

    /// Builds finder policy from node configuration.
    pub fn from_config(config: &Config) -> Self {
        let max_peers = config.peer.max_peers;
        let peer_private = config.peer.peer_private;
        let port = config.peer.port;
        Self {
            max_peers,
            out_peers: Self::calc_out_peers(max_peers),
            peer_private,
            want_incoming: !peer_private && port != 0,
            auto_connect: !peer_private,
            listening_port: port,
            ip_limit: config.overlay.ip_limit.max(0) as usize,
            features: String::new(),
        }
    }
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// One admission quantum.
#[derive(Debug, Clone)]
pub struct Slot {
    pub direction: Direction,
    pub remote: Endpoint,
    /// Local endpoint, known once connected.
    pub local: Option<Endpoint>,
    /// Listening port advertised by an inbound peer.
    pub listening_port: Option<u16>,
    pub state: SlotState,
    /// Set when the slot reaches `Active`.
    pub node_key: Option<PublicKey>,
    pub cluster: bool,
    /// Negotiated protocol version, set at activation.
    pub version: Option<ProtocolVersion>,
}

impl Slot {
    pub fn inbound(&self) -> bool {
        self.direction == Direction::Inbound
    }

    /// The endpoint other nodes could dial to reach this peer, when known.
    pub fn advertised(&self) -> Option<Endpoint> {
        match self.direction {
            Direction::Inbound => self.listening_port.map(|p| self.remote.with_port(p)),
            Direction::Outbound | Direction::Fixed => Some(self.remote),
        }
    }
}

/// The slot table. Owned by the peer finder; all access goes through the
/// finder's lock.
pub struct SlotTable {
    config: FinderConfig,
    slots: HashMap<SlotId, Slot>,
    /// Node keys of `Active` slots, for duplicate detection.
    active_keys: HashMap<PublicKey, SlotId>,
    /// Local endpoints of outbound sockets; an inbound request from one of
    /// these is this node talking to itself.
    connect_locals: HashMap<Endpoint, SlotId>,
    /// Endpoints of configured fixed peers.
    fixed: HashSet<Endpoint>,
    next_id: SlotId,
}

impl SlotTable {
    pub fn new(config: FinderConfig) -> Self {
        Self {
            config,
            slots: HashMap::new(),
            active_keys: HashMap::new(),
            connect_locals: HashMap::new(),
            fixed: HashSet::new(),
            next_id: 1,
        }
    }

    pub fn config(&self) -> &FinderConfig {
        &self.config
    }

    /// Marks an endpoint as a fixed peer.
    pub fn add_fixed(&mut self, endpoint: Endpoint) {
        self.fixed.insert(endpoint);
    }

    pub fn is_fixed(&self, endpoint: &Endpoint) -> bool {
        self.fixed.contains(endpoint)
    }

    pub fn fixed_endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.fixed.iter()
    }

    fn alloc(&mut self, slot: Slot) -> SlotId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.slots.insert(id, slot);
        id
    }

    /// Reserves a slot for an accepted connection.
    ///
    /// Returns `None` when the request is a self-connect (the remote
    /// endpoint is the local end of one of our own outbound sockets) or
    /// when the source IP is at its inbound limit. The caller must then
    /// drop the connection without writing a response. A rejected
    /// self-connect is detected before the IP limit is consulted, so it
    /// never counts against `ip_limit`.
    pub fn new_inbound_slot(&mut self, _local: Endpoint, remote: Endpoint) -> Option<SlotId> {
        if self.connect_locals.contains_key(&remote) {
            return None;
        }
        if !self.config.want_incoming {
            return None;
        }
        if self.config.ip_limit != 0 && !self.is_fixed(&remote) {
            let from_ip = self
                .slots
                .values()
                .filter(|s| s.inbound() && s.remote.ip == remote.ip && s.state != SlotState::Closed)
                .count();
            if from_ip >= self.config.ip_limit {
                return None;
            }
        }
        Some(self.alloc(Slot {
            direction: Direction::Inbound,
            remote,
            local: Some(_local),
            listening_port: None,
            state: SlotState::Accept,
            node_key: None,
            cluster: false,
            version: None,
        }))
    }

    /// Reserves a slot for an outbound dial.
    ///
    /// Returns `None` when outbound capacity is exhausted, when `remote`
    /// is already represented by a live slot, or when `peer_private`
    /// forbids dialing beyond fixed peers.
    pub fn new_outbound_slot(&mut self, remote: Endpoint) -> Option<SlotId> {
        let fixed = self.is_fixed(&remote);
        if self.config.peer_private && !fixed {
            return None;
        }
        if self
            .slots
            .values()
            .any(|s| s.remote == remote && s.state != SlotState::Closed)
        {
            return None;
        }
        if !fixed && self.outbound_count() >= self.config.out_peers {
            return None;
        }
        Some(self.alloc(Slot {
            direction: if fixed { Direction::Fixed } else { Direction::Outbound },
            remote,
            local: None,
            listening_port: None,
            state: SlotState::Connect,
            node_key: None,
            cluster: false,
            version: None,
        }))
    }

    /// Transitions a connect slot to `Connected` once TCP/TLS is up.
    ///
    /// Returns false if a duplicate connection to the same remote appeared
    /// in the meantime; the attempt must then fail.
    pub fn on_connected(&mut self, id: SlotId, local: Endpoint) -> bool {
        let duplicate = self.slots.iter().any(|(other, s)| {
            *other != id
                && s.remote == self.slots.get(&id).map(|s| s.remote).unwrap_or(local)
                && s.state != SlotState::Closed
        });
        let Some(slot) = self.slots.get_mut(&id) else {
            return false;
        };
        if slot.state != SlotState::Connect || duplicate {
            return false;
        }
        slot.state = SlotState::Connected;
        slot.local = Some(local);
        self.connect_locals.insert(local, id);
        true
    }

    /// Final admission gate, called once the handshake reveals the
    /// remote's node key. Cluster members and fixed peers bypass the
    /// capacity check.
    pub fn activate(&mut self, id: SlotId, key: PublicKey, cluster: bool) -> ActivateResult {
        if let Some(owner) = self.active_keys.get(&key) {
            if *owner != id {
                return ActivateResult::Duplicate;
            }
        }

        let Some(slot) = self.slots.get(&id) else {
            return ActivateResult::Full;
        };
        let privileged = cluster || slot.direction == Direction::Fixed;
        let full = match slot.direction {
            Direction::Inbound => self.active_inbound_count() >= self.inbound_capacity(),
            Direction::Outbound | Direction::Fixed => {
                self.active_outbound_count() >= self.config.out_peers
            }
        };
        if full && !privileged {
            return ActivateResult::Full;
        }

        let slot = self.slots.get_mut(&id).expect("checked above");
        slot.state = SlotState::Active;
        slot.node_key = Some(key);
        slot.cluster = cluster;
        self.active_keys.insert(key, id);
        ActivateResult::Success
    }

    /// Idempotent teardown; releases capacity and frees the endpoint for
    /// reuse.
    pub fn on_closed(&mut self, id: SlotId) {
        let Some(slot) = self.slots.remove(&id) else {
            return;
        };
        if let Some(key) = slot.node_key {
            if self.active_keys.get(&key) == Some(&id) {
                self.active_keys.remove(&key);
            }
        }
        if let Some(local) = slot.local {
            if self.connect_locals.get(&local) == Some(&id) {
                self.connect_locals.remove(&local);
            }
        }
    }

    /// Records the listening port an inbound peer advertised.
    pub fn set_listening_port(&mut self, id: SlotId, port: u16) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.listening_port = Some(port);
        }
    }

    /// Records the protocol version negotiated for a slot.
    pub fn set_version(&mut self, id: SlotId, version: ProtocolVersion) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.version = Some(version);
        }
    }

    pub fn get(&self, id: SlotId) -> Option<&Slot> {
        self.slots.get(&id)
    }

    /// Whether any live slot is bound to `key`.
    pub fn key_active(&self, key: &PublicKey) -> bool {
        self.active_keys.contains_key(key)
    }

    fn inbound_capacity(&self) -> usize {
        if !self.config.want_incoming {
            return 0;
        }
        self.config.max_peers.saturating_sub(self.config.out_peers)
    }

    /// Live outbound slots in any pre-close state (pending dials count
    /// against capacity).
    pub fn outbound_count(&self) -> usize {
        self.slots
            .values()
            .filter(|s| s.direction == Direction::Outbound && s.state != SlotState::Closed)
            .count()
    }

    pub fn active_inbound_count(&self) -> usize {
        self.slots
            .values()
            .filter(|s| s.inbound() && s.state == SlotState::Active)
            .count()
    }

    pub fn active_outbound_count(&self) -> usize {
        self.slots
            .values()
            .filter(|s| !s.inbound() && s.state == SlotState::Active)
            .count()
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .values()
            .filter(|s| s.state == SlotState::Active)
            .count()
    }

    /// Dialable endpoints of active peers, excluding `but`, for redirect
    /// lists and endpoint gossip.
    pub fn active_advertised(&self, but: Option<SlotId>) -> Vec<Endpoint> {
        self.slots
            .iter()
            .filter(|(id, s)| Some(**id) != but && s.state == SlotState::Active)
            .filter_map(|(_, s)| s.advertised())
            .filter(|e| e.port != 0)
            .collect()
    }

    /// Endpoints of slots currently being dialed or already connected.
    pub fn slotted_endpoints(&self) -> HashSet<Endpoint> {
        self.slots
            .values()
            .filter(|s| s.state != SlotState::Closed)
            .map(|s| s.remote)
            .collect()
    }

    /// Iterates active slots.
    pub fn active_slots(&self) -> impl Iterator<Item = (&SlotId, &Slot)> {
        self.slots
            .iter()
            .filter(|(_, s)| s.state == SlotState::Active)
    }
}
