//! `ResourceManager`: tiered buffer pools and per-owner accounting.
//!
//! ## Allocation
//!
//! ```text
//! allocate(owner, kind, size, channel)
//!     ├─ accounting (metrics)     → owner/channel caps, reserve bytes, release
//!     ├─ partition map (perf)     → find or create the channel's partition, release
//!     ├─ partition (perf)         → pooled slot, bounded wait, or overflow
//!     │                             failure: unreserve and return ResourceExhausted
//!     └─ accounting (metrics)     → record the live handle
//!                                   failure: return the slot, defer the unreserve
//! ```
//!
//! Pools are partitioned per channel so channels never contend on one pool
//! lock. Handles must be returned with [`ResourceManager::deallocate`]; a
//! dropped handle stays live in the accounting and is reported as a leak.
//!
//! An accounting release that cannot take the accounting lock is queued and
//! applied by the next caller that does, so a lock timeout never leaves a
//! reservation charged.

pub mod policy;
pub mod tier;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Condvar;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub use policy::{BufferSizePolicy, CpuSampler, PolicyDecision, PressureProbe, PressureSample};
pub use tier::Tier;

use crate::capability::ResourceSource;
use crate::config::ResourceConfig;
use crate::error::{CadenceError, Result};
use crate::thread::{LockContext, LockRank, RankedMutex, RankedMutexGuard, RankedRwLock};
use crate::ChannelId;
use tier::TierSet;

/// What a buffer holds. Informational; tier selection only looks at size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Audio,
    Signal,
    Transcript,
    Scratch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(pub u64);

/// Exclusive ownership of one buffer. Not `Clone`; give it back with
/// [`ResourceManager::deallocate`].
#[derive(Debug)]
pub struct ResourceHandle {
    id: HandleId,
    tier: Tier,
    kind: ResourceKind,
    size: usize,
    owner: String,
    channel: Option<ChannelId>,
    allocated_at: DateTime<Utc>,
    buffer: Vec<u8>,
}

impl ResourceHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    pub fn allocated_at(&self) -> DateTime<Utc> {
        self.allocated_at
    }

    pub fn is_overflow(&self) -> bool {
        self.tier == Tier::Overflow
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

/// Caps applied to one owner. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerLimit {
    pub max_bytes: Option<usize>,
    pub max_handles: Option<usize>,
}

/// A handle that is still live, as seen by accounting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveHandle {
    pub id: HandleId,
    pub owner: String,
    pub channel: Option<ChannelId>,
    pub tier: Tier,
    pub kind: ResourceKind,
    pub size: usize,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TierMetrics {
    pub tier: Tier,
    pub capacity: usize,
    pub live: usize,
    pub free: usize,
    pub materialized: usize,
    pub peak: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMetrics {
    pub channel: Option<ChannelId>,
    pub live_handles: usize,
    pub live_bytes: usize,
    pub peak_bytes: usize,
    pub overflow_live: usize,
    pub tiers: Vec<TierMetrics>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetrics {
    pub allocations: u64,
    pub deallocations: u64,
    pub exhausted: u64,
    pub live_handles: usize,
    pub live_bytes: usize,
    pub overflow_live: usize,
    /// Share of allocations served by a pooled slot.
    pub hit_rate: f64,
    /// Slack inside live pooled slots over their reserved bytes.
    pub fragmentation: f64,
    pub target_buffer_size: usize,
    pub tiers: Vec<TierMetrics>,
    pub channels: Vec<ChannelMetrics>,
}

#[derive(Debug, Default)]
struct Usage {
    bytes: usize,
    handles: usize,
}

#[derive(Default)]
struct Accounting {
    live: HashMap<HandleId, LiveHandle>,
    owners: HashMap<String, Usage>,
    limits: HashMap<String, OwnerLimit>,
    channels: HashMap<Option<ChannelId>, Usage>,
}

/// Undo of one reservation, and of the live entry when `id` is set.
#[derive(Debug)]
struct Release {
    id: Option<HandleId>,
    owner: String,
    size: usize,
    channel: Option<ChannelId>,
}

impl Accounting {
    fn apply(&mut self, release: &Release) {
        // Reclaimed handles have already been uncharged.
        if let Some(id) = release.id {
            if self.live.remove(&id).is_none() {
                return;
            }
        }
        if let Some(usage) = self.owners.get_mut(&release.owner) {
            usage.bytes = usage.bytes.saturating_sub(release.size);
            usage.handles = usage.handles.saturating_sub(1);
            if usage.handles == 0 {
                self.owners.remove(&release.owner);
            }
        }
        if let Some(usage) = self.channels.get_mut(&release.channel) {
            usage.bytes = usage.bytes.saturating_sub(release.size);
            usage.handles = usage.handles.saturating_sub(1);
        }
    }
}

struct Partition {
    tiers: TierSet,
    overflow_live: usize,
    live_bytes: usize,
    peak_bytes: usize,
}

struct PartitionSlot {
    pool: RankedMutex<Partition>,
    released: Condvar,
}

pub struct ResourceManager {
    config: ResourceConfig,
    locks: LockContext,
    accounting: RankedMutex<Accounting>,
    partitions: RankedRwLock<HashMap<Option<ChannelId>, Arc<PartitionSlot>>>,
    policy: RankedMutex<BufferSizePolicy>,
    cpu: CpuSampler,
    deferred_tx: Sender<Release>,
    deferred_rx: Receiver<Release>,
    next_id: AtomicU64,
    allocations: AtomicU64,
    deallocations: AtomicU64,
    pool_hits: AtomicU64,
    exhausted: AtomicU64,
    live_bytes: AtomicUsize,
    target: AtomicUsize,
}

impl ResourceManager {
    pub fn new(config: ResourceConfig, locks: LockContext) -> Self {
        let policy = BufferSizePolicy::new(config.policy.clone());
        let target = policy.target();
        let (deferred_tx, deferred_rx) = crossbeam_channel::unbounded();
        Self {
            config,
            locks,
            accounting: RankedMutex::new(LockRank::Metrics, Accounting::default()),
            partitions: RankedRwLock::new(LockRank::Perf, HashMap::new()),
            policy: RankedMutex::new(LockRank::Metrics, policy),
            cpu: CpuSampler::new(),
            deferred_tx,
            deferred_rx,
            next_id: AtomicU64::new(1),
            allocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
            pool_hits: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            live_bytes: AtomicUsize::new(0),
            target: AtomicUsize::new(target),
        }
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    /// Set caps for one owner, replacing any previous ones.
    pub fn set_owner_limit(&self, owner: &str, limit: OwnerLimit) -> Result<()> {
        self.accounting()?
            .limits
            .insert(owner.to_string(), limit);
        Ok(())
    }

    /// Allocate a buffer of `size` bytes for `owner`.
    ///
    /// # Errors
    /// - `ResourceExhausted` when an owner or channel cap would be exceeded or
    ///   the partition's overflow bucket is full.
    /// - `LockTimeout` / `LockOrderViolation` from the lock layer.
    pub fn allocate(
        &self,
        owner: &str,
        kind: ResourceKind,
        size: usize,
        channel: Option<ChannelId>,
    ) -> Result<ResourceHandle> {
        self.reserve(owner, size, channel)?;
        let uncharge = || Release {
            id: None,
            owner: owner.to_string(),
            size,
            channel,
        };

        let placed = self.partition(channel).and_then(|slot| {
            let (tier, buffer) = self.place(&slot, size, channel)?;
            Ok((slot, tier, buffer))
        });
        let (slot, tier, buffer) = match placed {
            Ok(placed) => placed,
            Err(e) => {
                self.release(uncharge());
                if matches!(e, CadenceError::ResourceExhausted { .. }) {
                    self.exhausted.fetch_add(1, Ordering::Relaxed);
                }
                return Err(e);
            }
        };

        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let allocated_at = Utc::now();
        let recorded = self.accounting().map(|mut accounting| {
            accounting.live.insert(
                id,
                LiveHandle {
                    id,
                    owner: owner.to_string(),
                    channel,
                    tier,
                    kind,
                    size,
                    allocated_at,
                },
            );
        });
        if let Err(e) = recorded {
            warn!(owner, ?channel, size, %tier, "allocation not recorded, returning slot: {e}");
            if let Err(undo) = self.return_to_partition(&slot, tier, Some(buffer), size) {
                error!(owner, ?channel, size, %tier, "slot could not be returned: {undo}");
            }
            self.release(uncharge());
            return Err(e);
        }

        self.allocations.fetch_add(1, Ordering::Relaxed);
        if tier != Tier::Overflow {
            self.pool_hits.fetch_add(1, Ordering::Relaxed);
        }
        self.live_bytes.fetch_add(size, Ordering::Relaxed);
        debug!(owner, ?channel, size, %tier, id = id.0, "allocated");
        Ok(ResourceHandle {
            id,
            tier,
            kind,
            size,
            owner: owner.to_string(),
            channel,
            allocated_at,
            buffer,
        })
    }

    /// Return a handle. Pooled buffers go back to their tier's free list.
    ///
    /// # Errors
    /// - `UnknownHandle` if the handle is not live here (reclaimed, or from
    ///   another manager).
    /// - `LockTimeout` / `LockOrderViolation` before the buffer is returned.
    ///   The handle then stays live and is reclaimed as a leak.
    pub fn deallocate(&self, handle: ResourceHandle) -> Result<()> {
        let known = self.accounting()?.live.contains_key(&handle.id);
        if !known {
            return Err(CadenceError::UnknownHandle { id: handle.id.0 });
        }

        let ResourceHandle {
            id,
            tier,
            size,
            owner,
            channel,
            buffer,
            ..
        } = handle;

        let slot = self.partition(channel)?;
        self.return_to_partition(&slot, tier, Some(buffer), size)?;
        self.release(Release {
            id: Some(id),
            owner: owner.clone(),
            size,
            channel,
        });

        self.deallocations.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(size, Ordering::Relaxed);
        debug!(owner = %owner, ?channel, size, %tier, id = id.0, "deallocated");
        Ok(())
    }

    /// Forget every live handle of `owner` whose buffer will never be
    /// returned. Returns how many were reclaimed.
    pub fn reclaim_owner(&self, owner: &str) -> Result<usize> {
        let leaked: Vec<LiveHandle> = {
            let mut accounting = self.accounting()?;
            let ids: Vec<HandleId> = accounting
                .live
                .values()
                .filter(|h| h.owner == owner)
                .map(|h| h.id)
                .collect();
            let leaked: Vec<LiveHandle> = ids
                .iter()
                .filter_map(|id| accounting.live.remove(id))
                .collect();
            accounting.owners.remove(owner);
            for handle in &leaked {
                if let Some(usage) = accounting.channels.get_mut(&handle.channel) {
                    usage.bytes = usage.bytes.saturating_sub(handle.size);
                    usage.handles = usage.handles.saturating_sub(1);
                }
            }
            leaked
        };

        for handle in &leaked {
            let slot = self.partition(handle.channel)?;
            self.return_to_partition(&slot, handle.tier, None, handle.size)?;
            self.live_bytes.fetch_sub(handle.size, Ordering::Relaxed);
        }

        if !leaked.is_empty() {
            warn!(owner, reclaimed = leaked.len(), "reclaimed leaked handles");
        }
        Ok(leaked.len())
    }

    /// Reclaim every live handle of every owner.
    pub fn reclaim_all(&self) -> Result<usize> {
        let owners: Vec<String> = {
            let accounting = self.accounting()?;
            let mut owners: Vec<String> = accounting.live.values().map(|h| h.owner.clone()).collect();
            owners.sort();
            owners.dedup();
            owners
        };
        let mut total = 0;
        for owner in owners {
            total += self.reclaim_owner(&owner)?;
        }
        Ok(total)
    }

    pub fn live_handles(&self) -> Result<Vec<LiveHandle>> {
        let accounting = self.accounting()?;
        let mut out: Vec<LiveHandle> = accounting.live.values().cloned().collect();
        out.sort_by_key(|h| h.id);
        Ok(out)
    }

    /// Size collaborators are advised to request, moved by the adaptive policy.
    pub fn target_buffer_size(&self) -> usize {
        self.target.load(Ordering::Relaxed)
    }

    /// Run one policy tick against `probe`.
    pub fn tick_policy(&self, probe: &dyn PressureProbe) -> Result<PolicyDecision> {
        let sample = probe.sample();
        let decision = self.locks.lock(&self.policy)?.observe(sample);
        self.target.store(decision.target(), Ordering::Relaxed);
        match decision {
            PolicyDecision::Shrink { from, to } => {
                info!(from, to, memory = sample.memory, "buffer target shrunk")
            }
            PolicyDecision::Grow { from, to } => {
                info!(from, to, cpu = sample.cpu, "buffer target grown")
            }
            PolicyDecision::Hold { .. } => {}
        }
        Ok(decision)
    }

    pub fn metrics(&self) -> Result<ResourceMetrics> {
        let slots: Vec<(Option<ChannelId>, Arc<PartitionSlot>)> = {
            let partitions = self.locks.read(&self.partitions)?;
            partitions.iter().map(|(k, v)| (*k, Arc::clone(v))).collect()
        };

        let mut channels = Vec::with_capacity(slots.len());
        let mut reserved = 0usize;
        let mut requested = 0usize;
        for (channel, slot) in slots {
            let partition = self.locks.lock(&slot.pool)?;
            let tiers: Vec<TierMetrics> = partition
                .tiers
                .iter()
                .map(|(tier, pool)| {
                    reserved += pool.reserved_bytes();
                    requested += pool.requested_bytes();
                    TierMetrics {
                        tier,
                        capacity: pool.capacity(),
                        live: pool.live(),
                        free: pool.available(),
                        materialized: pool.materialized(),
                        peak: pool.peak(),
                    }
                })
                .collect();
            let live_handles =
                tiers.iter().map(|t| t.live).sum::<usize>() + partition.overflow_live;
            channels.push(ChannelMetrics {
                channel,
                live_handles,
                live_bytes: partition.live_bytes,
                peak_bytes: partition.peak_bytes,
                overflow_live: partition.overflow_live,
                tiers,
            });
        }
        channels.sort_by_key(|c| c.channel);

        let mut tiers: Vec<TierMetrics> = Tier::POOLED
            .into_iter()
            .map(|tier| TierMetrics {
                tier,
                capacity: 0,
                live: 0,
                free: 0,
                materialized: 0,
                peak: 0,
            })
            .collect();
        for channel in &channels {
            for (sum, t) in tiers.iter_mut().zip(&channel.tiers) {
                sum.capacity += t.capacity;
                sum.live += t.live;
                sum.free += t.free;
                sum.materialized += t.materialized;
                sum.peak = sum.peak.max(t.peak);
            }
        }

        let allocations = self.allocations.load(Ordering::Relaxed);
        let hits = self.pool_hits.load(Ordering::Relaxed);
        Ok(ResourceMetrics {
            allocations,
            deallocations: self.deallocations.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            live_handles: channels.iter().map(|c| c.live_handles).sum(),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            overflow_live: channels.iter().map(|c| c.overflow_live).sum(),
            hit_rate: if allocations == 0 {
                1.0
            } else {
                hits as f64 / allocations as f64
            },
            fragmentation: if reserved == 0 {
                0.0
            } else {
                1.0 - requested as f64 / reserved as f64
            },
            target_buffer_size: self.target_buffer_size(),
            tiers,
            channels,
        })
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn owner_limit(accounting: &Accounting, owner: &str, config: &ResourceConfig) -> OwnerLimit {
        accounting.limits.get(owner).copied().unwrap_or(OwnerLimit {
            max_bytes: config.default_owner_max_bytes,
            max_handles: None,
        })
    }

    fn reserve(&self, owner: &str, size: usize, channel: Option<ChannelId>) -> Result<()> {
        let mut accounting = self.accounting()?;
        let limit = Self::owner_limit(&accounting, owner, &self.config);

        let (owner_bytes, owner_handles) = accounting
            .owners
            .get(owner)
            .map(|u| (u.bytes, u.handles))
            .unwrap_or((0, 0));
        let channel_bytes = accounting.channels.get(&channel).map(|u| u.bytes).unwrap_or(0);

        let refusal = if limit.max_bytes.is_some_and(|max| owner_bytes + size > max) {
            Some(format!(
                "owner byte cap {} reached ({} live)",
                limit.max_bytes.unwrap_or_default(),
                owner_bytes
            ))
        } else if limit.max_handles.is_some_and(|max| owner_handles >= max) {
            Some(format!(
                "owner handle cap {} reached",
                limit.max_handles.unwrap_or_default()
            ))
        } else if self
            .config
            .channel_max_bytes
            .is_some_and(|max| channel_bytes + size > max)
        {
            Some(format!("channel {channel:?} byte cap reached ({channel_bytes} live)"))
        } else {
            None
        };
        if let Some(reason) = refusal {
            drop(accounting);
            self.exhausted.fetch_add(1, Ordering::Relaxed);
            warn!(owner, size, ?channel, "allocation refused: {reason}");
            return Err(CadenceError::ResourceExhausted {
                owner: owner.to_string(),
                reason,
            });
        }

        let usage = accounting.owners.entry(owner.to_string()).or_default();
        usage.bytes += size;
        usage.handles += 1;
        let usage = accounting.channels.entry(channel).or_default();
        usage.bytes += size;
        usage.handles += 1;
        Ok(())
    }

    /// Accounting guard with every queued release applied.
    fn accounting(&self) -> Result<RankedMutexGuard<'_, Accounting>> {
        let mut accounting = self.locks.lock(&self.accounting)?;
        for release in self.deferred_rx.try_iter() {
            accounting.apply(&release);
        }
        Ok(accounting)
    }

    /// Apply `release` now, or queue it when the accounting lock is unavailable.
    fn release(&self, release: Release) {
        match self.accounting() {
            Ok(mut accounting) => accounting.apply(&release),
            Err(e) => {
                warn!(owner = %release.owner, size = release.size, "accounting release deferred: {e}");
                // The receiver lives as long as `self`.
                let _ = self.deferred_tx.send(release);
            }
        }
    }

    /// Give a slot back to its partition. `None` forgets a pooled buffer that
    /// will never come back.
    fn return_to_partition(
        &self,
        slot: &PartitionSlot,
        tier: Tier,
        buffer: Option<Vec<u8>>,
        size: usize,
    ) -> Result<()> {
        {
            let mut partition = self.locks.lock(&slot.pool)?;
            match (partition.tiers.get_mut(tier), buffer) {
                (Some(pool), Some(buffer)) => pool.give_back(buffer, size),
                (Some(pool), None) => pool.forget(size),
                (None, _) => partition.overflow_live = partition.overflow_live.saturating_sub(1),
            }
            partition.live_bytes = partition.live_bytes.saturating_sub(size);
        }
        slot.released.notify_one();
        Ok(())
    }

    fn partition(&self, channel: Option<ChannelId>) -> Result<Arc<PartitionSlot>> {
        if let Some(slot) = self.locks.read(&self.partitions)?.get(&channel) {
            return Ok(Arc::clone(slot));
        }
        let mut partitions = self.locks.write(&self.partitions)?;
        let slot = partitions.entry(channel).or_insert_with(|| {
            let mut tiers = TierSet::new(&self.config);
            if self.config.prewarm {
                tiers.prewarm();
            }
            debug!(?channel, prewarm = self.config.prewarm, "partition created");
            Arc::new(PartitionSlot {
                pool: RankedMutex::new(
                    LockRank::Perf,
                    Partition {
                        tiers,
                        overflow_live: 0,
                        live_bytes: 0,
                        peak_bytes: 0,
                    },
                ),
                released: Condvar::new(),
            })
        });
        Ok(Arc::clone(slot))
    }

    /// Pick a pooled slot, wait for one up to `pool_wait`, or overflow.
    fn place(
        &self,
        slot: &PartitionSlot,
        size: usize,
        channel: Option<ChannelId>,
    ) -> Result<(Tier, Vec<u8>)> {
        let tier = Tier::for_size(size, &self.config);
        let wait = self.config.pool_wait();
        let deadline = Instant::now() + wait;
        let mut partition = self.locks.lock(&slot.pool)?;

        if tier != Tier::Overflow {
            loop {
                if let Some(buffer) = partition.tiers.get_mut(tier).and_then(|p| p.take(size)) {
                    partition.live_bytes += size;
                    partition.peak_bytes = partition.peak_bytes.max(partition.live_bytes);
                    return Ok((tier, buffer));
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                partition.wait_for(&slot.released, deadline - now);
            }
        }

        if partition.overflow_live >= self.config.max_overflow {
            return Err(CadenceError::ResourceExhausted {
                owner: format!("channel {channel:?}"),
                reason: format!(
                    "{tier} tier full and overflow at limit {}",
                    self.config.max_overflow
                ),
            });
        }
        partition.overflow_live += 1;
        partition.live_bytes += size;
        partition.peak_bytes = partition.peak_bytes.max(partition.live_bytes);
        drop(partition);
        if tier == Tier::Overflow {
            debug!(size, ?channel, "oversized request served as overflow");
        } else {
            warn!(size, ?channel, %tier, "pool exhausted, serving overflow");
        }
        Ok((Tier::Overflow, vec![0; size]))
    }
}

impl PressureProbe for ResourceManager {
    /// Memory pressure from live bytes over the configured budget, CPU
    /// pressure from host utilization.
    fn sample(&self) -> PressureSample {
        let live = self.live_bytes.load(Ordering::Relaxed) as f64;
        PressureSample {
            memory: (live / self.config.memory_budget_bytes.max(1) as f64).min(1.0) as f32,
            cpu: self.cpu.sample(),
        }
    }
}

impl ResourceSource for ResourceManager {
    fn live_allocations_for(&self, owner: &str) -> Result<usize> {
        Ok(self
            .accounting()?
            .owners
            .get(owner)
            .map(|u| u.handles)
            .unwrap_or(0))
    }

    fn live_allocations(&self) -> Result<usize> {
        Ok(self.accounting()?.live.len())
    }
}
