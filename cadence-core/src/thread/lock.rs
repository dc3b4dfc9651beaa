//! Ranked locks and the per-thread held-rank stack.
//!
//! ## Rank order
//!
//! ```text
//! state(1) < metrics(2) < perf(3) < component(4) < update(5)
//! ```
//!
//! A thread holding locks may only acquire a lock of strictly higher rank than
//! everything it already holds. The check runs before any wait, so an
//! out-of-order request fails immediately instead of joining a circular wait.
//!
//! Guards are RAII: dropping one releases the lock and pops its entry from the
//! held stack, in any order.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::{error, trace};

use crate::error::{CadenceError, Result};

/// Position of a lock in the global acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockRank {
    State = 1,
    Metrics = 2,
    Perf = 3,
    Component = 4,
    Update = 5,
}

impl LockRank {
    pub const ALL: [LockRank; 5] = [
        LockRank::State,
        LockRank::Metrics,
        LockRank::Perf,
        LockRank::Component,
        LockRank::Update,
    ];

    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            LockRank::State => "state",
            LockRank::Metrics => "metrics",
            LockRank::Perf => "perf",
            LockRank::Component => "component",
            LockRank::Update => "update",
        }
    }
}

impl fmt::Display for LockRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Held-rank stack
// ---------------------------------------------------------------------------

thread_local! {
    static HELD: RefCell<Vec<(u64, LockRank)>> = const { RefCell::new(Vec::new()) };
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Ranks currently held by the calling thread, in acquisition order.
pub fn held_ranks() -> Vec<LockRank> {
    HELD.with(|h| h.borrow().iter().map(|(_, r)| *r).collect())
}

/// Highest rank held by the calling thread.
pub fn max_held_rank() -> Option<LockRank> {
    HELD.with(|h| h.borrow().iter().map(|(_, r)| *r).max())
}

/// Entry on the held stack. `!Send`: it must be dropped on the acquiring thread.
struct HeldToken {
    id: u64,
    _not_send: PhantomData<*const ()>,
}

impl HeldToken {
    fn push(rank: LockRank) -> Self {
        let id = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        HELD.with(|h| h.borrow_mut().push((id, rank)));
        Self {
            id,
            _not_send: PhantomData,
        }
    }
}

impl Drop for HeldToken {
    fn drop(&mut self) {
        let id = self.id;
        HELD.with(|h| {
            let mut held = h.borrow_mut();
            if let Some(pos) = held.iter().rposition(|(t, _)| *t == id) {
                held.remove(pos);
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Lock types
// ---------------------------------------------------------------------------

/// A mutex bound to a [`LockRank`]. Acquire it through a [`LockContext`].
pub struct RankedMutex<T> {
    rank: LockRank,
    inner: Mutex<T>,
}

impl<T> RankedMutex<T> {
    pub const fn new(rank: LockRank, value: T) -> Self {
        Self {
            rank,
            inner: Mutex::new(value),
        }
    }

    pub fn rank(&self) -> LockRank {
        self.rank
    }

    /// Consume the lock and return the protected value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T> fmt::Debug for RankedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RankedMutex")
            .field("rank", &self.rank)
            .finish_non_exhaustive()
    }
}

/// A reader-writer lock bound to a [`LockRank`]. Readers and writers obey the
/// same ordering rule.
pub struct RankedRwLock<T> {
    rank: LockRank,
    inner: RwLock<T>,
}

impl<T> RankedRwLock<T> {
    pub const fn new(rank: LockRank, value: T) -> Self {
        Self {
            rank,
            inner: RwLock::new(value),
        }
    }

    pub fn rank(&self) -> LockRank {
        self.rank
    }
}

impl<T> fmt::Debug for RankedRwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RankedRwLock")
            .field("rank", &self.rank)
            .finish_non_exhaustive()
    }
}

pub struct RankedMutexGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _held: HeldToken,
}

impl<T> RankedMutexGuard<'_, T> {
    /// Block on `condvar` for at most `timeout`, releasing the lock meanwhile.
    /// Returns `true` if the wait timed out.
    pub fn wait_for(&mut self, condvar: &Condvar, timeout: Duration) -> bool {
        condvar.wait_for(&mut self.guard, timeout).timed_out()
    }
}

impl<T> Deref for RankedMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RankedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

pub struct RankedReadGuard<'a, T> {
    guard: RwLockReadGuard<'a, T>,
    _held: HeldToken,
}

impl<T> Deref for RankedReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

pub struct RankedWriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    _held: HeldToken,
}

impl<T> Deref for RankedWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RankedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

// ---------------------------------------------------------------------------
// LockContext
// ---------------------------------------------------------------------------

/// Counters shared by every clone of a [`LockContext`].
#[derive(Debug, Default)]
pub struct LockStats {
    pub acquisitions: AtomicU64,
    pub timeouts: AtomicU64,
    pub order_violations: AtomicU64,
    pub total_wait_us: AtomicU64,
    pub max_wait_us: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatsSnapshot {
    pub acquisitions: u64,
    pub timeouts: u64,
    pub order_violations: u64,
    pub mean_wait_us: f64,
    pub max_wait_us: u64,
}

impl LockStats {
    pub fn snapshot(&self) -> LockStatsSnapshot {
        let acquisitions = self.acquisitions.load(Ordering::Relaxed);
        let total = self.total_wait_us.load(Ordering::Relaxed);
        LockStatsSnapshot {
            acquisitions,
            timeouts: self.timeouts.load(Ordering::Relaxed),
            order_violations: self.order_violations.load(Ordering::Relaxed),
            mean_wait_us: if acquisitions == 0 {
                0.0
            } else {
                total as f64 / acquisitions as f64
            },
            max_wait_us: self.max_wait_us.load(Ordering::Relaxed),
        }
    }
}

/// Acquisition policy for ranked locks, handed out by the `ThreadManager`.
///
/// Cheap to clone; all clones share the same counters.
#[derive(Debug, Clone)]
pub struct LockContext {
    default_timeout: Duration,
    fail_fast: bool,
    stats: Arc<LockStats>,
}

impl LockContext {
    pub fn new(default_timeout: Duration, fail_fast: bool) -> Self {
        Self {
            default_timeout,
            fail_fast,
            stats: Arc::new(LockStats::default()),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn stats(&self) -> &LockStats {
        &self.stats
    }

    pub fn lock<'a, T>(&self, lock: &'a RankedMutex<T>) -> Result<RankedMutexGuard<'a, T>> {
        self.lock_for(lock, self.default_timeout)
    }

    pub fn lock_for<'a, T>(
        &self,
        lock: &'a RankedMutex<T>,
        timeout: Duration,
    ) -> Result<RankedMutexGuard<'a, T>> {
        let (guard, held) = self.acquire(lock.rank, timeout, |t| lock.inner.try_lock_for(t))?;
        Ok(RankedMutexGuard {
            guard,
            _held: held,
        })
    }

    pub fn read<'a, T>(&self, lock: &'a RankedRwLock<T>) -> Result<RankedReadGuard<'a, T>> {
        let (guard, held) = self.acquire(lock.rank, self.default_timeout, |t| {
            lock.inner.try_read_for(t)
        })?;
        Ok(RankedReadGuard {
            guard,
            _held: held,
        })
    }

    pub fn write<'a, T>(&self, lock: &'a RankedRwLock<T>) -> Result<RankedWriteGuard<'a, T>> {
        let (guard, held) = self.acquire(lock.rank, self.default_timeout, |t| {
            lock.inner.try_write_for(t)
        })?;
        Ok(RankedWriteGuard {
            guard,
            _held: held,
        })
    }

    /// Fails with `LockOrderViolation` if the calling thread already holds a
    /// lock of rank `>= rank`. Never blocks in that case.
    pub fn check_order(&self, rank: LockRank) -> Result<()> {
        let Some(held) = max_held_rank().filter(|held| *held >= rank) else {
            return Ok(());
        };
        self.stats.order_violations.fetch_add(1, Ordering::Relaxed);
        error!(requested = %rank, held = %held, "lock order violation");
        if self.fail_fast {
            panic!("lock order violation: requested {rank} while holding {held}");
        }
        Err(CadenceError::LockOrderViolation {
            requested: rank,
            held,
        })
    }

    fn acquire<G>(
        &self,
        rank: LockRank,
        timeout: Duration,
        try_acquire: impl FnOnce(Duration) -> Option<G>,
    ) -> Result<(G, HeldToken)> {
        self.check_order(rank)?;

        let started = Instant::now();
        let Some(guard) = try_acquire(timeout) else {
            self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
            trace!(lock = %rank, ?timeout, "lock acquisition timed out");
            return Err(CadenceError::LockTimeout {
                lock: rank,
                waited: started.elapsed(),
            });
        };

        let waited_us = started.elapsed().as_micros().min(u64::MAX as u128) as u64;
        self.stats.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.stats.total_wait_us.fetch_add(waited_us, Ordering::Relaxed);
        self.stats.max_wait_us.fetch_max(waited_us, Ordering::Relaxed);

        Ok((guard, HeldToken::push(rank)))
    }
}
