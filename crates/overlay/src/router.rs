//! Content-hash message suppression.
//!
//! The [`HashRouter`] is the sole mechanism preventing relay loops: every
//! relayable message is identified by a content hash, and per hash the
//! router remembers which peers have already seen it and whether it has
//! been relayed at all. Entries expire on a time/size basis so memory stays
//! bounded under flood.

use dashmap::DashMap;
use parking_lot::RwLock;
use rill_common::Hash256;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::debug;

/// Flag recording that a message has been relayed.
pub const RELAYED: u8 = 0x01;

/// Default hold time for suppression entries.
const DEFAULT_HOLD_SECS: u64 = 300;

/// Entry cap before a forced sweep.
const MAX_ENTRIES: usize = 100_000;

/// How often the opportunistic sweep runs.
const SWEEP_INTERVAL_SECS: u64 = 60;

struct Entry {
    first_seen: Instant,
    flags: u8,
    peers: HashSet<u32>,
}

impl Entry {
    fn new() -> Self {
        Self {
            first_seen: Instant::now(),
            flags: 0,
            peers: HashSet::new(),
        }
    }
}

/// Suppression table keyed by content hash.
///
/// All operations are internally synchronized; per-hash updates are atomic
/// with respect to each other.
pub struct HashRouter {
    entries: DashMap<Hash256, Entry>,
    hold: Duration,
    last_sweep: RwLock<Instant>,
}

impl HashRouter {
    /// Creates a router with the default hold time.
    pub fn new() -> Self {
        Self::with_hold(Duration::from_secs(DEFAULT_HOLD_SECS))
    }

    /// Creates a router with a custom entry hold time.
    pub fn with_hold(hold: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            hold,
            last_sweep: RwLock::new(Instant::now()),
        }
    }

    /// Atomically ORs `flag` into the entry for `uid` and merges the
    /// caller's skip set with the stored peer set; on return `set` holds
    /// the union. Returns true iff `flag` was not previously set.
    ///
    /// A true return from `swap_set(uid, set, RELAYED)` therefore grants
    /// exactly one caller the right to relay this content, with `set`
    /// naming every peer to skip.
    pub fn swap_set(&self, uid: Hash256, set: &mut HashSet<u32>, flag: u8) -> bool {
        self.maybe_sweep();

        let mut entry = self.entries.entry(uid).or_insert_with(Entry::new);
        entry.peers.extend(set.iter().copied());
        set.extend(entry.peers.iter().copied());

        let newly_set = entry.flags & flag == 0;
        entry.flags |= flag;
        newly_set
    }

    /// Records that `peer` has seen `uid`. Returns true iff this is the
    /// first sighting of `uid` from any peer, i.e. the content is worth
    /// processing.
    pub fn add_suppression_peer(&self, uid: Hash256, peer: u32) -> bool {
        self.maybe_sweep();

        let mut first = false;
        let mut entry = self.entries.entry(uid).or_insert_with(|| {
            first = true;
            Entry::new()
        });
        entry.peers.insert(peer);
        first
    }

    /// The peers currently recorded as having seen `uid`.
    pub fn peers_for(&self, uid: &Hash256) -> HashSet<u32> {
        self.entries
            .get(uid)
            .map(|e| e.peers.clone())
            .unwrap_or_default()
    }

    /// Whether `flag` is set for `uid`.
    pub fn flag_set(&self, uid: &Hash256, flag: u8) -> bool {
        self.entries
            .get(uid)
            .map(|e| e.flags & flag != 0)
            .unwrap_or(false)
    }

    /// Number of tracked hashes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no hashes are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops entries older than the hold time.
    pub fn sweep(&self) {
        let hold = self.hold;
        let before = self.entries.len();
        self.entries.retain(|_, e| e.first_seen.elapsed() <= hold);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "hash router sweep");
        }
        *self.last_sweep.write() = Instant::now();
    }

    fn maybe_sweep(&self) {
        let due = {
            let last = *self.last_sweep.read();
            last.elapsed() > Duration::from_secs(SWEEP_INTERVAL_SECS)
                || self.entries.len() > MAX_ENTRIES
        };
        if due {
            self.sweep();
        }
    }
}

impl Default for HashRouter {
    fn default() -> Self {
        Self::new()
    }
}
