//! Size tiers and the per-partition free-list pool.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{ResourceConfig, TierConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Small,
    Medium,
    Large,
    /// Direct allocation outside any pool: oversized or pool exhausted.
    Overflow,
}

impl Tier {
    pub const POOLED: [Tier; 3] = [Tier::Small, Tier::Medium, Tier::Large];

    pub fn name(self) -> &'static str {
        match self {
            Tier::Small => "small",
            Tier::Medium => "medium",
            Tier::Large => "large",
            Tier::Overflow => "overflow",
        }
    }

    /// Smallest pooled tier whose ceiling fits `size`, or `Overflow`.
    pub fn for_size(size: usize, config: &ResourceConfig) -> Tier {
        Tier::POOLED
            .into_iter()
            .find(|t| size <= t.config(config).map(|c| c.ceiling).unwrap_or(0))
            .unwrap_or(Tier::Overflow)
    }

    pub fn config(self, config: &ResourceConfig) -> Option<TierConfig> {
        match self {
            Tier::Small => Some(config.small),
            Tier::Medium => Some(config.medium),
            Tier::Large => Some(config.large),
            Tier::Overflow => None,
        }
    }

    fn index(self) -> Option<usize> {
        match self {
            Tier::Small => Some(0),
            Tier::Medium => Some(1),
            Tier::Large => Some(2),
            Tier::Overflow => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed-capacity pool for one tier. Slots are materialized lazily (or all at
/// once on prewarm) and recycled through a free list.
#[derive(Debug)]
pub(crate) struct TierPool {
    ceiling: usize,
    capacity: usize,
    free: Vec<Vec<u8>>,
    /// Slots handed out and not yet returned.
    live: usize,
    /// Peak of `live`; never above `capacity`.
    peak: usize,
    /// Requested bytes of live handles; `live * ceiling` minus this is slack.
    requested: usize,
}

impl TierPool {
    pub(crate) fn new(config: TierConfig) -> Self {
        Self {
            ceiling: config.ceiling,
            capacity: config.capacity,
            free: Vec::new(),
            live: 0,
            peak: 0,
            requested: 0,
        }
    }

    pub(crate) fn prewarm(&mut self) {
        while self.free.len() + self.live < self.capacity {
            self.free.push(Vec::with_capacity(self.ceiling));
        }
    }

    /// A slot sized for `size`, or `None` when every slot is live.
    pub(crate) fn take(&mut self, size: usize) -> Option<Vec<u8>> {
        if self.live >= self.capacity {
            return None;
        }
        let mut buffer = self
            .free
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.ceiling));
        buffer.clear();
        buffer.resize(size, 0);
        self.live += 1;
        self.peak = self.peak.max(self.live);
        self.requested += size;
        Some(buffer)
    }

    /// Return a slot. The buffer is kept only while the free list has room.
    pub(crate) fn give_back(&mut self, buffer: Vec<u8>, size: usize) {
        self.live = self.live.saturating_sub(1);
        self.requested = self.requested.saturating_sub(size);
        if self.free.len() + self.live < self.capacity {
            self.free.push(buffer);
        }
    }

    /// Forget a slot whose buffer will never come back.
    pub(crate) fn forget(&mut self, size: usize) {
        self.live = self.live.saturating_sub(1);
        self.requested = self.requested.saturating_sub(size);
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak
    }

    /// Slots available to the next `take`.
    pub(crate) fn available(&self) -> usize {
        self.capacity - self.live
    }

    pub(crate) fn materialized(&self) -> usize {
        self.free.len() + self.live
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn reserved_bytes(&self) -> usize {
        self.live * self.ceiling
    }

    pub(crate) fn requested_bytes(&self) -> usize {
        self.requested
    }
}

/// The three pooled tiers of one partition.
#[derive(Debug)]
pub(crate) struct TierSet([TierPool; 3]);

impl TierSet {
    pub(crate) fn new(config: &ResourceConfig) -> Self {
        Self([
            TierPool::new(config.small),
            TierPool::new(config.medium),
            TierPool::new(config.large),
        ])
    }

    pub(crate) fn get_mut(&mut self, tier: Tier) -> Option<&mut TierPool> {
        tier.index().map(move |i| &mut self.0[i])
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (Tier, &TierPool)> {
        Tier::POOLED.into_iter().zip(self.0.iter())
    }

    pub(crate) fn prewarm(&mut self) {
        self.0.iter_mut().for_each(TierPool::prewarm);
    }
}
