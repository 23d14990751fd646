//! Launch-site maps
//!
//! A launch site is the normalized kernel address together with the calling
//! context node it was launched from. The thread-local map answers "has this
//! thread launched from here since the last range flush"; the global map
//! answers the same across threads, and also keeps per-site launch counters
//! that outlive ranges.

use crate::splay::{SharedSplayMap, SplayMap};
use std::thread::ThreadId;
use stride_shared::{CctNodeId, IpNormalized, RangeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IpNormKey {
    pub ip: IpNormalized,
    pub node: CctNodeId,
}

impl IpNormKey {
    pub fn new(ip: IpNormalized, node: CctNodeId) -> Self {
        Self { ip, node }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpNormStatus {
    New,
    Duplicate,
}

/// Per-thread launch sites of the current range. Unlocked.
#[derive(Debug, Default)]
pub struct IpNormMap {
    seen: SplayMap<IpNormKey, ()>,
}

impl IpNormMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: IpNormKey) -> IpNormStatus {
        if self.seen.insert(key, ()) {
            IpNormStatus::New
        } else {
            IpNormStatus::Duplicate
        }
    }

    pub fn contains(&mut self, key: &IpNormKey) -> bool {
        self.seen.contains(key)
    }

    /// Forget every site; node storage is kept for the next range
    pub fn clear(&mut self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Launch and sampling counts of one site across all threads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallSiteStats {
    pub count: u64,
    pub sampled: u64,
    /// Range of the most recent sampled launch
    pub last_range: Option<RangeId>,
}

impl CallSiteStats {
    /// Fraction of launches that were sampled
    pub fn ratio(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sampled as f64 / self.count as f64
        }
    }
}

/// Process-wide launch sites. Each half has its own lock.
#[derive(Debug, Default)]
pub struct GlobalIpNormMap {
    sites: SharedSplayMap<IpNormKey, CallSiteStats>,
    /// Sites launched in the current range, by the thread that got there first
    claimed: SharedSplayMap<IpNormKey, ThreadId>,
}

impl GlobalIpNormMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one launch from `key`; returns whether the site was new and its
    /// counters before this launch.
    pub fn observe(&self, key: IpNormKey) -> (IpNormStatus, CallSiteStats) {
        let mut status = IpNormStatus::Duplicate;
        let before = self.sites.upsert_with(
            key,
            || {
                status = IpNormStatus::New;
                CallSiteStats::default()
            },
            |stats| {
                let before = *stats;
                stats.count += 1;
                before
            },
        );
        (status, before)
    }

    pub fn mark_sampled(&self, key: &IpNormKey, range: RangeId) {
        self.sites.lookup_with(key, |stats| {
            stats.sampled += 1;
            stats.last_range = Some(range);
        });
    }

    pub fn stats(&self, key: &IpNormKey) -> Option<CallSiteStats> {
        self.sites.lookup_with(key, |stats| *stats)
    }

    /// Note `thread` launching from `key` in the current range. Duplicate
    /// when another thread launched from it first.
    pub fn claim(&self, key: IpNormKey, thread: ThreadId) -> IpNormStatus {
        let owner = self.claimed.upsert_with(key, || thread, |owner| *owner);
        if owner == thread {
            IpNormStatus::New
        } else {
            IpNormStatus::Duplicate
        }
    }

    /// Sites claimed in the current range
    pub fn claimed(&self) -> usize {
        self.claimed.len()
    }

    /// Sites with launch counters
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Range flush: forget the current range's claims. Counters are kept.
    pub fn clear(&self) {
        self.claimed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(offset: u64, node: u64) -> IpNormKey {
        IpNormKey::new(IpNormalized::new(1, offset), CctNodeId(node))
    }

    #[test]
    fn test_local_duplicate_detection() {
        let mut map = IpNormMap::new();
        assert_eq!(map.insert(key(0x10, 1)), IpNormStatus::New);
        assert_eq!(map.insert(key(0x10, 2)), IpNormStatus::New);
        assert_eq!(map.insert(key(0x10, 1)), IpNormStatus::Duplicate);
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.insert(key(0x10, 1)), IpNormStatus::New);
    }

    #[test]
    fn test_global_counts() {
        let map = GlobalIpNormMap::new();
        let site = key(0x40, 3);
        let (status, before) = map.observe(site);
        assert_eq!(status, IpNormStatus::New);
        assert_eq!(before, CallSiteStats::default());
        map.mark_sampled(&site, RangeId(4));

        let (status, before) = map.observe(site);
        assert_eq!(status, IpNormStatus::Duplicate);
        assert_eq!(
            before,
            CallSiteStats {
                count: 1,
                sampled: 1,
                last_range: Some(RangeId(4)),
            }
        );
        assert_eq!(map.stats(&site).unwrap().count, 2);
        assert!((map.stats(&site).unwrap().ratio() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_claims_are_per_range_and_per_thread() {
        let map = GlobalIpNormMap::new();
        let site = key(0x80, 5);
        let here = std::thread::current().id();
        let there = std::thread::spawn(|| std::thread::current().id()).join().unwrap();

        assert_eq!(map.claim(site, here), IpNormStatus::New);
        assert_eq!(map.claim(site, here), IpNormStatus::New);
        assert_eq!(map.claim(site, there), IpNormStatus::Duplicate);
        map.observe(site);

        map.clear();
        assert_eq!(map.claimed(), 0);
        assert_eq!(map.stats(&site).map(|s| s.count), Some(1));
        assert_eq!(map.claim(site, there), IpNormStatus::New);
        assert_eq!(map.claim(site, here), IpNormStatus::Duplicate);
    }
}
