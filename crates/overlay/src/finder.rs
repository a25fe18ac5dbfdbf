//! Peer discovery: the boot cache and autoconnect policy.
//!
//! The [`PeerFinder`] owns the slot table and decides which endpoints to
//! dial. Candidates come from three places: configured fixed peers,
//! redirect lists received from full peers, and endpoint gossip. All of
//! them land in a SQLite-backed boot cache with per-endpoint failure
//! counts and exponential backoff, so a flaky endpoint is retried less and
//! less often.

use crate::slots::{ActivateResult, FinderConfig, Slot, SlotId, SlotTable};
use crate::{Endpoint, EndpointGossip, ProtocolVersion, Result};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rill_crypto::PublicKey;
use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, trace};

/// New dials started per timer tick, beyond fixed peers.
const CONNECT_BATCH: usize = 2;

/// Redirect lists and gossip messages are capped at this many entries.
const MAX_ENDPOINTS_PER_MESSAGE: usize = 10;

/// Endpoints failing this many times in a row are dropped from the cache.
const MAX_FAILURES: u32 = 10;

/// Seconds per backoff unit.
const SECONDS_PER_BACKOFF: u64 = 10;

/// Cap on the backoff exponent.
const MAX_BACKOFF_EXPONENT: u32 = 10;

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn compute_backoff_secs(num_failures: u32) -> i64 {
    let exponent = num_failures.min(MAX_BACKOFF_EXPONENT);
    let max_seconds = (1u64 << exponent) * SECONDS_PER_BACKOFF;
    (rand::random::<u64>() % max_seconds + 1) as i64
}

/// One boot-cache record.
#[derive(Debug, Clone)]
pub struct BootEntry {
    pub endpoint: Endpoint,
    /// Unix timestamp before which this endpoint is not dialed.
    pub next_attempt: i64,
    pub num_failures: u32,
}

impl BootEntry {
    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            next_attempt: unix_now(),
            num_failures: 0,
        }
    }

    fn is_ready(&self, now: i64) -> bool {
        self.next_attempt <= now
    }
}

/// Persistent cache of candidate endpoints.
///
/// In-memory map of record per endpoint, written through to SQLite when a
/// database is attached.
pub struct BootCache {
    cache: std::collections::HashMap<Endpoint, BootEntry>,
    db: Option<Connection>,
}

impl BootCache {
    /// In-memory cache, no persistence.
    pub fn in_memory() -> Self {
        Self {
            cache: std::collections::HashMap::new(),
            db: None,
        }
    }

    /// Opens (or creates) the cache database and loads existing entries.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Wraps an existing database connection.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS boot_cache (
                ip TEXT NOT NULL,
                port INTEGER NOT NULL CHECK (port > 0 AND port <= 65535),
                nextattempt INTEGER NOT NULL,
                numfailures INTEGER NOT NULL DEFAULT 0 CHECK (numfailures >= 0),
                PRIMARY KEY (ip, port)
            )",
            [],
        )?;

        let mut cache = std::collections::HashMap::new();
        {
            let mut stmt =
                conn.prepare("SELECT ip, port, nextattempt, numfailures FROM boot_cache")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)? as u16,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)? as u32,
                ))
            })?;
            for row in rows.flatten() {
                let (ip, port, next_attempt, num_failures) = row;
                let Ok(ip) = ip.parse::<IpAddr>() else {
                    continue;
                };
                let endpoint = Endpoint::new(ip, port);
                cache.insert(
                    endpoint,
                    BootEntry {
                        endpoint,
                        next_attempt,
                        num_failures,
                    },
                );
            }
        }
        if !cache.is_empty() {
            info!(entries = cache.len(), "loaded boot cache");
        }

        Ok(Self {
            cache,
            db: Some(conn),
        })
    }

    fn store(&mut self, entry: BootEntry) {
        if let Some(db) = &self.db {
            let _ = db.execute(
                "INSERT OR REPLACE INTO boot_cache (ip, port, nextattempt, numfailures)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    entry.endpoint.ip.to_string(),
                    entry.endpoint.port as i64,
                    entry.next_attempt,
                    entry.num_failures as i64
                ],
            );
        }
        self.cache.insert(entry.endpoint, entry);
    }

    /// Adds an endpoint if it is new.
    pub fn ensure(&mut self, endpoint: Endpoint) {
        if endpoint.port == 0 || self.cache.contains_key(&endpoint) {
            return;
        }
        trace!(%endpoint, "learned endpoint");
        self.store(BootEntry::new(endpoint));
    }

    /// Resets failure tracking after a successful handshake.
    pub fn on_success(&mut self, endpoint: Endpoint) {
        let mut entry = self
            .cache
            .get(&endpoint)
            .cloned()
            .unwrap_or_else(|| BootEntry::new(endpoint));
        entry.num_failures = 0;
        entry.next_attempt = unix_now();
        self.store(entry);
    }

    /// Pushes the endpoint's next attempt out with exponential backoff.
    pub fn on_failure(&mut self, endpoint: Endpoint) {
        let mut entry = self
            .cache
            .get(&endpoint)
            .cloned()
            .unwrap_or_else(|| BootEntry::new(endpoint));
        entry.num_failures += 1;
        entry.next_attempt = unix_now() + compute_backoff_secs(entry.num_failures);
        self.store(entry);
    }

    /// Up to `limit` dialable endpoints, shuffled, excluding `exclude`.
    pub fn candidates(&self, limit: usize, exclude: &HashSet<Endpoint>) -> Vec<Endpoint> {
        let now = unix_now();
        let mut ready: Vec<Endpoint> = self
            .cache
            .values()
            .filter(|e| {
                e.is_ready(now) && e.num_failures <= MAX_FAILURES && !exclude.contains(&e.endpoint)
            })
            .map(|e| e.endpoint)
            .collect();
        ready.shuffle(&mut rand::thread_rng());
        ready.truncate(limit);
        ready
    }

    /// Endpoints healthy enough to hand out in a redirect list.
    pub fn healthy(&self, limit: usize, exclude: &HashSet<Endpoint>) -> Vec<Endpoint> {
        let mut out: Vec<Endpoint> = self
            .cache
            .values()
            .filter(|e| e.num_failures == 0 && !exclude.contains(&e.endpoint))
            .map(|e| e.endpoint)
            .collect();
        out.shuffle(&mut rand::thread_rng());
        out.truncate(limit);
        out
    }

    /// Drops endpoints with at least `min_failures` failures.
    pub fn prune(&mut self, min_failures: u32) {
        if let Some(db) = &self.db {
            let _ = db.execute(
                "DELETE FROM boot_cache WHERE numfailures >= ?1",
                params![min_failures as i64],
            );
        }
        self.cache.retain(|_, e| e.num_failures < min_failures);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<&BootEntry> {
        self.cache.get(endpoint)
    }
}

struct Inner {
    slots: SlotTable,
    boot: BootCache,
    /// Our own dialable endpoint, when the node listens publicly.
    own: Option<Endpoint>,
    tick: u64,
}

/// Discovery, admission and autoconnect policy.
///
/// The finder exclusively owns the slot table; peer sessions carry only
/// `SlotId` handles whose validity is guaranteed by explicit `on_closed`
/// notification.
pub struct PeerFinder {
    config: FinderConfig,
    inner: Mutex<Inner>,
}

impl PeerFinder {
    pub fn new(config: FinderConfig, boot: BootCache, public_ip: Option<std::net::Ipv4Addr>) -> Self {
        let own = public_ip.and_then(|ip| {
            (config.want_incoming && config.listening_port != 0)
                .then(|| Endpoint::new(IpAddr::V4(ip), config.listening_port))
        });
        Self {
            inner: Mutex::new(Inner {
                slots: SlotTable::new(config.clone()),
                boot,
                own,
                tick: 0,
            }),
            config,
        }
    }

    pub fn config(&self) -> &FinderConfig {
        &self.config
    }

    // ----- slot operations ---------------------------------------------

    pub fn new_inbound_slot(&self, local: Endpoint, remote: Endpoint) -> Option<SlotId> {
        self.inner.lock().slots.new_inbound_slot(local, remote)
    }

    pub fn new_outbound_slot(&self, remote: Endpoint) -> Option<SlotId> {
        self.inner.lock().slots.new_outbound_slot(remote)
    }

    pub fn on_connected(&self, id: SlotId, local: Endpoint) -> bool {
        self.inner.lock().slots.on_connected(id, local)
    }

    pub fn activate(&self, id: SlotId, key: PublicKey, cluster: bool) -> ActivateResult {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let result = inner.slots.activate(id, key, cluster);
        if result == ActivateResult::Success {
            if let Some(slot) = inner.slots.get(id) {
                if !slot.inbound() {
                    let remote = slot.remote;
                    inner.boot.on_success(remote);
                }
            }
        }
        result
    }

    pub fn on_closed(&self, id: SlotId) {
        self.inner.lock().slots.on_closed(id);
    }

    /// Records a failed outbound dial so the boot cache backs off.
    pub fn on_connect_failure(&self, remote: Endpoint) {
        self.inner.lock().boot.on_failure(remote);
    }

    pub fn set_listening_port(&self, id: SlotId, port: u16) {
        self.inner.lock().slots.set_listening_port(id, port);
    }

    pub fn set_version(&self, id: SlotId, version: ProtocolVersion) {
        self.inner.lock().slots.set_version(id, version);
    }

    pub fn get_slot(&self, id: SlotId) -> Option<Slot> {
        self.inner.lock().slots.get(id).cloned()
    }

    pub fn key_active(&self, key: &PublicKey) -> bool {
        self.inner.lock().slots.key_active(key)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().slots.active_count()
    }

    // ----- discovery ---------------------------------------------------

    /// Registers configured fixed peers.
    pub fn add_fixed_peer(&self, name: &str, endpoints: &[Endpoint]) {
        let mut inner = self.inner.lock();
        for endpoint in endpoints {
            debug!(name, %endpoint, "fixed peer");
            inner.slots.add_fixed(*endpoint);
            inner.boot.ensure(*endpoint);
        }
    }

    /// Seeds the boot cache from configuration strings.
    pub fn add_fallback_strings(&self, name: &str, ips: &[String]) {
        let mut inner = self.inner.lock();
        let mut added = 0usize;
        for s in ips {
            if let Ok(endpoint) = s.parse::<Endpoint>() {
                inner.boot.ensure(endpoint);
                added += 1;
            }
        }
        debug!(name, added, "bootstrap endpoints");
    }

    /// Endpoints to dial this tick, bounded by remaining outbound capacity
    /// and per-tick throttling. Missing fixed peers are always first.
    pub fn autoconnect(&self) -> Vec<Endpoint> {
        let inner = self.inner.lock();
        let slotted = inner.slots.slotted_endpoints();

        let mut picks: Vec<Endpoint> = inner
            .slots
            .fixed_endpoints()
            .filter(|e| !slotted.contains(*e))
            .copied()
            .collect();

        if self.config.auto_connect && !self.config.peer_private {
            let outbound = inner.slots.outbound_count();
            let need = self.config.out_peers.saturating_sub(outbound);
            if need > 0 {
                let mut exclude = slotted;
                exclude.extend(picks.iter().copied());
                picks.extend(
                    inner
                        .boot
                        .candidates(need.min(CONNECT_BATCH), &exclude),
                );
            }
        }
        picks
    }

    /// A short list of known healthy endpoints to suggest to a client we
    /// cannot admit.
    pub fn redirect(&self, id: SlotId) -> Vec<Endpoint> {
        let inner = self.inner.lock();
        let mut out = inner.slots.active_advertised(Some(id));
        out.truncate(MAX_ENDPOINTS_PER_MESSAGE);
        if out.len() < MAX_ENDPOINTS_PER_MESSAGE {
            let exclude: HashSet<Endpoint> = out
                .iter()
                .copied()
                .chain(inner.slots.get(id).map(|s| s.remote))
                .collect();
            out.extend(
                inner
                    .boot
                    .healthy(MAX_ENDPOINTS_PER_MESSAGE - out.len(), &exclude),
            );
        }
        out
    }

    /// Absorbs a redirect list received from a peer into the boot cache.
    pub fn on_redirects(&self, origin: Endpoint, endpoints: &[Endpoint]) {
        let mut inner = self.inner.lock();
        for endpoint in endpoints.iter().take(MAX_ENDPOINTS_PER_MESSAGE) {
            if endpoint.is_private() || *endpoint == origin {
                continue;
            }
            inner.boot.ensure(*endpoint);
        }
    }

    /// Absorbs endpoint gossip from an active peer. A zero-hop entry names
    /// the sender itself and teaches us its listening port.
    pub fn on_endpoint_gossip(&self, from: SlotId, gossip: &EndpointGossip) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        for (endpoint, hops) in gossip.endpoints.iter().take(MAX_ENDPOINTS_PER_MESSAGE) {
            if *hops == 0 {
                inner.slots.set_listening_port(from, endpoint.port);
                if let Some(slot) = inner.slots.get(from) {
                    let advertised = slot.remote.with_port(endpoint.port);
                    if !advertised.is_private() {
                        inner.boot.ensure(advertised);
                    }
                }
            } else if !endpoint.is_private() && endpoint.port != 0 {
                inner.boot.ensure(*endpoint);
            }
        }
    }

    /// The broadcast set of known endpoints to share with each active
    /// peer, excluding the recipient itself.
    pub fn build_endpoints_for_peers(&self) -> Vec<(SlotId, EndpointGossip)> {
        let inner = self.inner.lock();
        let known = inner.slots.active_advertised(None);
        let own = inner.own;

        inner
            .slots
            .active_slots()
            .map(|(id, slot)| {
                let mut endpoints: Vec<(Endpoint, u32)> = Vec::new();
                if let Some(own) = own {
                    endpoints.push((own, 0));
                }
                let self_advertised = slot.advertised();
                endpoints.extend(
                    known
                        .iter()
                        .filter(|e| {
                            !e.is_private()
                                && Some(**e) != self_advertised
                                && e.ip != slot.remote.ip
                        })
                        .map(|e| (*e, 1)),
                );
                endpoints.truncate(MAX_ENDPOINTS_PER_MESSAGE);
                (*id, EndpointGossip { endpoints })
            })
            .filter(|(_, gossip)| !gossip.endpoints.is_empty())
            .collect()
    }

    /// Once-per-second housekeeping.
    pub fn once_per_second(&self) {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        if inner.tick % 60 == 0 {
            inner.boot.prune(MAX_FAILURES);
        }
    }

    /// Visits active slots, producing `(id, slot)` clones for admin
    /// output.
    pub fn active_slots(&self) -> Vec<(SlotId, Slot)> {
        let inner = self.inner.lock();
        inner
            .slots
            .active_slots()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn boot_len(&self) -> usize {
        self.inner.lock().boot.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint_v4;
    use rill_crypto::SecretKey;
    use tempfile::tempdir;

    fn finder(max_peers: usize) -> PeerFinder {
        let mut config = FinderConfig::default();
        config.max_peers = max_peers;
        config.out_peers = FinderConfig::calc_out_peers(max_peers);
        PeerFinder::new(config, BootCache::in_memory(), None)
    }

    fn key(seed: u8) -> PublicKey {
        SecretKey::from_seed(&[seed; 32]).public_key()
    }

    #[test]
    fn autoconnect_respects_batch_and_capacity() {
        let finder = finder(21);
        let ips: Vec<String> = (1..=8)
            .map(|i| format!("198.51.100.{i} 51235"))
            .collect();
        finder.add_fallback_strings("config", &ips);
        assert_eq!(finder.boot_len(), 8);

        // Per-tick throttle.
        let picks = finder.autoconnect();
        assert_eq!(picks.len(), CONNECT_BATCH);

        // Slotted endpoints are not offered again.
        let id = finder.new_outbound_slot(picks[0]).unwrap();
        let next = finder.autoconnect();
        assert!(!next.contains(&picks[0]));
        finder.on_closed(id);
    }

    #[test]
    fn autoconnect_prefers_missing_fixed_peers() {
        let finder = finder(21);
        let fixed = endpoint_v4(198, 51, 100, 77, 51235);
        finder.add_fixed_peer("config", &[fixed]);

        let picks = finder.autoconnect();
        assert_eq!(picks[0], fixed);
    }

    #[test]
    fn redirect_prefers_active_peers() {
        let finder = finder(21);

        // One active inbound peer with a known listening port.
        let peer = finder
            .new_inbound_slot(endpoint_v4(203, 0, 113, 1, 51235), endpoint_v4(198, 51, 100, 1, 40000))
            .unwrap();
        assert_eq!(finder.activate(peer, key(1), false), ActivateResult::Success);
        finder.set_listening_port(peer, 51235);

        // A second client we cannot admit.
        let full = finder
            .new_inbound_slot(endpoint_v4(203, 0, 113, 1, 51235), endpoint_v4(198, 51, 100, 2, 40001))
            .unwrap();

        let list = finder.redirect(full);
        assert!(list.contains(&endpoint_v4(198, 51, 100, 1, 51235)));
        // The requester is never redirected to itself.
        assert!(!list.iter().any(|e| e.ip == endpoint_v4(198, 51, 100, 2, 0).ip));
    }

    #[test]
    fn redirects_are_absorbed_into_boot_cache() {
        let finder = finder(21);
        let origin = endpoint_v4(198, 51, 100, 1, 51235);
        finder.on_redirects(
            origin,
            &[
                endpoint_v4(198, 51, 100, 2, 51235),
                endpoint_v4(10, 0, 0, 1, 51235), // private, skipped
                origin,                           // echo, skipped
            ],
        );
        assert_eq!(finder.boot_len(), 1);
    }

    #[test]
    fn endpoint_gossip_learns_listening_port() {
        let finder = finder(21);
        let id = finder
            .new_inbound_slot(endpoint_v4(203, 0, 113, 1, 51235), endpoint_v4(198, 51, 100, 1, 40000))
            .unwrap();
        finder.activate(id, key(1), false);

        let gossip = EndpointGossip {
            endpoints: vec![(endpoint_v4(0, 0, 0, 0, 51235), 0)],
        };
        finder.on_endpoint_gossip(id, &gossip);
        assert_eq!(finder.get_slot(id).unwrap().listening_port, Some(51235));
    }

    #[test]
    fn boot_cache_backoff_and_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bootcache.db");
        let target = endpoint_v4(198, 51, 100, 5, 51235);

        {
            let mut boot = BootCache::open(&path).unwrap();
            boot.ensure(target);
            boot.on_failure(target);
            let entry = boot.get(&target).unwrap();
            assert_eq!(entry.num_failures, 1);
            assert!(entry.next_attempt > unix_now());
        }

        // Reopen: the record survives.
        let boot = BootCache::open(&path).unwrap();
        assert_eq!(boot.get(&target).unwrap().num_failures, 1);
    }

    #[test]
    fn boot_cache_candidates_skip_backed_off() {
        let mut boot = BootCache::in_memory();
        let good = endpoint_v4(198, 51, 100, 1, 51235);
        let bad = endpoint_v4(198, 51, 100, 2, 51235);
        boot.ensure(good);
        boot.ensure(bad);
        boot.on_failure(bad);

        let picks = boot.candidates(10, &HashSet::new());
        assert_eq!(picks, vec![good]);
    }

    #[test]
    fn boot_cache_prune_drops_failing() {
        let mut boot = BootCache::in_memory();
        let e = endpoint_v4(198, 51, 100, 1, 51235);
        boot.ensure(e);
        for _ in 0..MAX_FAILURES {
            boot.on_failure(e);
        }
        boot.prune(MAX_FAILURES);
        assert!(boot.is_empty());
    }
}
