//! Per-source admission budget and traffic accounting.
//!
//! Each connection attempt takes out a [`Consumer`] against its source IP.
//! A source that holds too many concurrent consumers is classified as
//! over-limit and refused before any handshake work is done. Byte and
//! message counters are kept per [`TrafficCategory`] for metrics.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default cap on concurrent consumers per source IP.
const DEFAULT_BUDGET: usize = 64;

/// Traffic accounting buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum TrafficCategory {
    /// Handshakes and everything not otherwise classified.
    Base = 0,
    Proposal = 1,
    Validation = 2,
    Manifests = 3,
    Endpoints = 4,
}

impl TrafficCategory {
    pub const COUNT: usize = 5;

    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficCategory::Base => "base",
            TrafficCategory::Proposal => "proposal",
            TrafficCategory::Validation => "validation",
            TrafficCategory::Manifests => "manifests",
            TrafficCategory::Endpoints => "endpoints",
        }
    }

    fn all() -> [TrafficCategory; Self::COUNT] {
        [
            TrafficCategory::Base,
            TrafficCategory::Proposal,
            TrafficCategory::Validation,
            TrafficCategory::Manifests,
            TrafficCategory::Endpoints,
        ]
    }
}

#[derive(Default)]
struct CategoryCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
}

/// Point-in-time traffic counters for one category.
#[derive(Debug, Clone, Default)]
pub struct TrafficSnapshot {
    pub category: &'static str,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub messages_in: u64,
    pub messages_out: u64,
}

struct Inner {
    budget: usize,
    inbound: Mutex<HashMap<IpAddr, usize>>,
    traffic: [CategoryCounters; TrafficCategory::COUNT],
}

/// Admission budget indexed by source IP.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<Inner>,
}

impl ResourceManager {
    /// Creates a manager with the default per-IP budget.
    pub fn new() -> Self {
        Self::with_budget(DEFAULT_BUDGET)
    }

    /// Creates a manager with a custom per-IP budget. A budget of zero
    /// means unlimited.
    pub fn with_budget(budget: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                budget,
                inbound: Mutex::new(HashMap::new()),
                traffic: std::array::from_fn(|_| CategoryCounters::default()),
            }),
        }
    }

    /// Charges an inbound connection against `ip`.
    pub fn new_inbound_endpoint(&self, ip: IpAddr) -> Consumer {
        let over = {
            let mut table = self.inner.inbound.lock();
            let count = table.entry(ip).or_insert(0);
            *count += 1;
            self.inner.budget != 0 && *count > self.inner.budget
        };
        Consumer {
            inner: Arc::clone(&self.inner),
            ip,
            charged: true,
            over,
        }
    }

    /// Tracks an outbound connection to `ip`. Outbound attempts are never
    /// refused for budget reasons; the consumer exists for accounting
    /// symmetry.
    pub fn new_outbound_endpoint(&self, ip: IpAddr) -> Consumer {
        Consumer {
            inner: Arc::clone(&self.inner),
            ip,
            charged: false,
            over: false,
        }
    }

    /// Records traffic for metrics.
    pub fn report_traffic(&self, category: TrafficCategory, inbound: bool, bytes: u64) {
        let counters = &self.inner.traffic[category as usize];
        if inbound {
            counters.bytes_in.fetch_add(bytes, Ordering::Relaxed);
            counters.messages_in.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.bytes_out.fetch_add(bytes, Ordering::Relaxed);
            counters.messages_out.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot of every category with nonzero counters.
    pub fn traffic(&self) -> Vec<TrafficSnapshot> {
        TrafficCategory::all()
            .iter()
            .filter_map(|cat| {
                let c = &self.inner.traffic[*cat as usize];
                let snap = TrafficSnapshot {
                    category: cat.as_str(),
                    bytes_in: c.bytes_in.load(Ordering::Relaxed),
                    bytes_out: c.bytes_out.load(Ordering::Relaxed),
                    messages_in: c.messages_in.load(Ordering::Relaxed),
                    messages_out: c.messages_out.load(Ordering::Relaxed),
                };
                (snap.messages_in != 0 || snap.messages_out != 0).then_some(snap)
            })
            .collect()
    }

    /// Current consumer count for `ip`.
    pub fn count(&self, ip: IpAddr) -> usize {
        self.inner.inbound.lock().get(&ip).copied().unwrap_or(0)
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A charge against one source IP, released on drop.
pub struct Consumer {
    inner: Arc<Inner>,
    ip: IpAddr,
    charged: bool,
    over: bool,
}

impl Consumer {
    /// True when the source has exceeded its budget and must be refused.
    pub fn disconnect(&self) -> bool {
        self.over
    }

    /// The source address this consumer is charged to.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if self.charged {
            let mut table = self.inner.inbound.lock();
            if let Some(count) = table.get_mut(&self.ip) {
                *count -= 1;
                if *count == 0 {
                    table.remove(&self.ip);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(198, 51, 100, d))
    }

    #[test]
    fn budget_enforced_per_ip() {
        let manager = ResourceManager::with_budget(2);

        let a = manager.new_inbound_endpoint(ip(1));
        let b = manager.new_inbound_endpoint(ip(1));
        assert!(!a.disconnect());
        assert!(!b.disconnect());

        let c = manager.new_inbound_endpoint(ip(1));
        assert!(c.disconnect());

        // A different source is unaffected.
        let d = manager.new_inbound_endpoint(ip(2));
        assert!(!d.disconnect());
    }

    #[test]
    fn drop_releases_charge() {
        let manager = ResourceManager::with_budget(1);
        {
            let _a = manager.new_inbound_endpoint(ip(1));
            assert_eq!(manager.count(ip(1)), 1);
        }
        assert_eq!(manager.count(ip(1)), 0);

        let b = manager.new_inbound_endpoint(ip(1));
        assert!(!b.disconnect());
    }

    #[test]
    fn outbound_never_refused() {
        let manager = ResourceManager::with_budget(1);
        for _ in 0..5 {
            let c = manager.new_outbound_endpoint(ip(3));
            assert!(!c.disconnect());
        }
    }

    #[test]
    fn traffic_counters_accumulate() {
        let manager = ResourceManager::new();
        manager.report_traffic(TrafficCategory::Proposal, true, 100);
        manager.report_traffic(TrafficCategory::Proposal, true, 50);
        manager.report_traffic(TrafficCategory::Proposal, false, 10);

        let snapshot = manager.traffic();
        let prop = snapshot.iter().find(|s| s.category == "proposal").unwrap();
        assert_eq!(prop.bytes_in, 150);
        assert_eq!(prop.messages_in, 2);
        assert_eq!(prop.bytes_out, 10);
        assert_eq!(prop.messages_out, 1);
    }
}
