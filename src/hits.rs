//! Per-domain query tally shared between the DNS handlers and the view.
//!
//! Both structures are sharded maps: concurrent handlers contend only when
//! their domains hash to the same shard, and readers take shard read locks
//! one at a time, so a snapshot never stalls increments for long. A snapshot
//! is consistent per entry but is not a point-in-time view of all entries.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{DashMap, DashSet};
use rustc_hash::FxBuildHasher;

/// Concurrent map of domain to number of queries seen.
///
/// Counts only ever grow; entries are never removed.
#[derive(Debug)]
pub struct HitCounter {
    counts: DashMap<String, AtomicU64, FxBuildHasher>,
}

impl HitCounter {
    pub fn new() -> Self {
        Self {
            counts: DashMap::with_hasher(FxBuildHasher),
        }
    }

    /// Count one query for `domain`, returning the new total.
    pub fn increment(&self, domain: &str) -> u64 {
        // Existing domains only need a shard read lock.
        if let Some(count) = self.counts.get(domain) {
            return count.fetch_add(1, Ordering::Relaxed) + 1;
        }

        self.counts
            .entry(domain.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed)
            + 1
    }

    pub fn get(&self, domain: &str) -> u64 {
        self.counts
            .get(domain)
            .map_or(0, |count| count.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> Vec<(String, u64)> {
        self.counts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl Default for HitCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Append-only set of domains that have been answered from the blocklist.
#[derive(Debug)]
pub struct BlockedSet {
    domains: DashSet<String, FxBuildHasher>,
}

impl BlockedSet {
    pub fn new() -> Self {
        Self {
            domains: DashSet::with_hasher(FxBuildHasher),
        }
    }

    /// Flag `domain`. Returns `true` the first time a domain is flagged.
    pub fn insert(&self, domain: &str) -> bool {
        if self.domains.contains(domain) {
            return false;
        }
        self.domains.insert(domain.to_string())
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.domains.contains(domain)
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.domains.iter().map(|d| d.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

impl Default for BlockedSet {
    fn default() -> Self {
        Self::new()
    }
}

/// One line of the ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedRow {
    pub domain: String,
    pub hits: u64,
    /// The domain has been answered from the blocklist at least once.
    pub flagged: bool,
}

/// Rank domains by hit count, highest first, ties by name.
///
/// Domains with a zero count are left out.
pub fn rank(hits: Vec<(String, u64)>, blocked: &BlockedSet) -> Vec<RankedRow> {
    let mut rows: Vec<RankedRow> = hits
        .into_iter()
        .filter(|(_, hits)| *hits > 0)
        .map(|(domain, hits)| RankedRow {
            flagged: blocked.contains(&domain),
            domain,
            hits,
        })
        .collect();

    rows.sort_unstable_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.domain.cmp(&b.domain)));
    rows
}

/// The shared telemetry state: written by query handlers, read by the view.
///
/// Constructed once by the caller and handed to both sides behind an `Arc`.
#[derive(Debug, Default)]
pub struct Telemetry {
    pub hits: HitCounter,
    pub blocked: BlockedSet,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one classified query.
    pub fn record(&self, domain: &str, blocked: bool) {
        if blocked {
            self.blocked.insert(domain);
        }
        self.hits.increment(domain);
    }

    /// Current ranking of domains by hit count.
    pub fn ranked_snapshot(&self) -> Vec<RankedRow> {
        rank(self.hits.snapshot(), &self.blocked)
    }
}
