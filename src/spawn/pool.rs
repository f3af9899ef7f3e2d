//! Session handle pool
//!
//! Handles move `Pooled -> Active` on acquire and back to `Pooled` on release
//! when reusable and the pool has room; otherwise they are retired. Once a
//! handle is bound into the world the pool only keeps a weak reference.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::spawn::request::{AccountId, BotId, CharacterId, MapId, Position, ZoneId};
use crate::util::SharedClock;

/// Shared handle to a bot session
pub type SessionHandle = Arc<BotSession>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Pooled,
    Active,
    Retired,
}

/// Everything the world host needs to seat a bot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionProfile {
    pub account_id: Option<AccountId>,
    pub character_id: Option<CharacterId>,
    pub class: u8,
    pub race: u8,
    pub level: u8,
    pub zone_id: ZoneId,
    pub map_id: MapId,
    pub position: Option<Position>,
    pub role: String,
    pub level_band: String,
    pub pvp_enabled: bool,
    pub requested_by_human: bool,
}

/// A poolable bot session
#[derive(Debug)]
pub struct BotSession {
    id: Uuid,
    state: Mutex<SessionState>,
    profile: Mutex<SessionProfile>,
    pending_io: AtomicU32,
    uses: AtomicU32,
}

impl BotSession {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: Mutex::new(SessionState::Pooled),
            profile: Mutex::new(SessionProfile::default()),
            pending_io: AtomicU32::new(0),
            uses: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn profile(&self) -> SessionProfile {
        self.profile.lock().clone()
    }

    /// Mutate the session's profile in place
    pub fn configure<F: FnOnce(&mut SessionProfile)>(&self, f: F) {
        f(&mut self.profile.lock());
    }

    pub fn character_id(&self) -> Option<CharacterId> {
        self.profile.lock().character_id
    }

    pub fn uses(&self) -> u32 {
        self.uses.load(Ordering::Relaxed)
    }

    pub fn begin_io(&self) {
        self.pending_io.fetch_add(1, Ordering::AcqRel);
    }

    pub fn end_io(&self) {
        let _ = self
            .pending_io
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn has_pending_io(&self) -> bool {
        self.pending_io.load(Ordering::Acquire) > 0
    }

    /// Pooled, not retired, and no I/O in flight
    pub fn is_reusable(&self) -> bool {
        self.state() == SessionState::Pooled && !self.has_pending_io()
    }

    /// Mark the handle unusable for good
    pub fn retire(&self) {
        *self.state.lock() = SessionState::Retired;
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub retired: u64,
    pub active: usize,
    pub pooled: usize,
    /// Share of acquires served from the pool
    pub hit_rate: f64,
    /// Share of releases that went back into the pool
    pub reuse_rate: f64,
}

struct PoolInner {
    pooled: Vec<(SessionHandle, Instant)>,
    bound: FxHashMap<BotId, Weak<BotSession>>,
    active: usize,
    last_cleanup: Instant,
}

pub struct SessionPool {
    config: PoolConfig,
    clock: SharedClock,
    max_active: AtomicUsize,
    inner: Mutex<PoolInner>,
    created: AtomicU64,
    reused: AtomicU64,
    acquires: AtomicU64,
    releases: AtomicU64,
    returned_to_pool: AtomicU64,
    retired: AtomicU64,
}

impl SessionPool {
    pub fn new(config: PoolConfig, max_active: usize, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            max_active: AtomicUsize::new(max_active),
            inner: Mutex::new(PoolInner {
                pooled: Vec::new(),
                bound: FxHashMap::default(),
                active: 0,
                last_cleanup: now,
            }),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            acquires: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            returned_to_pool: AtomicU64::new(0),
            retired: AtomicU64::new(0),
        }
    }

    /// Fill the pool up to its initial size
    pub fn prewarm(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let target = self.config.initial_size.min(self.config.max_size);
        let mut added = 0;
        while inner.pooled.len() < target {
            inner.pooled.push((Arc::new(BotSession::new()), now));
            added += 1;
        }
        self.created.fetch_add(added as u64, Ordering::Relaxed);
        debug!("Session pool prewarmed with {} handles", added);
        added
    }

    /// Hand out a session for `account_id`. `None` when the active cap is hit.
    pub fn acquire(&self, account_id: AccountId) -> Option<SessionHandle> {
        let mut inner = self.inner.lock();
        if inner.active >= self.max_active.load(Ordering::Relaxed) {
            return None;
        }

        let mut reused = None;
        while let Some((handle, _)) = inner.pooled.pop() {
            if handle.is_reusable() {
                reused = Some(handle);
                break;
            }
            handle.retire();
            self.retired.fetch_add(1, Ordering::Relaxed);
        }

        let handle = match reused {
            Some(handle) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                handle
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                Arc::new(BotSession::new())
            }
        };
        inner.active += 1;
        drop(inner);

        self.acquires.fetch_add(1, Ordering::Relaxed);
        handle.set_state(SessionState::Active);
        handle.uses.fetch_add(1, Ordering::Relaxed);
        handle.configure(|p| {
            *p = SessionProfile {
                account_id: Some(account_id),
                ..SessionProfile::default()
            }
        });
        trace!("Acquired session {} for account {}", handle.id(), account_id);
        Some(handle)
    }

    /// Remember which bot a bound handle belongs to
    pub fn bind(&self, bot_id: BotId, handle: &SessionHandle) {
        self.inner.lock().bound.insert(bot_id, Arc::downgrade(handle));
    }

    /// Give a handle back. Returns the state it ended in.
    pub fn release(&self, handle: SessionHandle) -> SessionState {
        if handle.state() == SessionState::Pooled {
            return SessionState::Pooled;
        }

        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.active = inner.active.saturating_sub(1);
        if let Some(bot_id) = handle.character_id() {
            let same = inner
                .bound
                .get(&bot_id)
                .map(|w| w.ptr_eq(&Arc::downgrade(&handle)))
                .unwrap_or(false);
            if same {
                inner.bound.remove(&bot_id);
            }
        }

        self.releases.fetch_add(1, Ordering::Relaxed);
        let reusable = handle.state() == SessionState::Active && !handle.has_pending_io();
        if reusable && inner.pooled.len() < self.config.max_size {
            handle.configure(|p| *p = SessionProfile::default());
            handle.set_state(SessionState::Pooled);
            inner.pooled.push((handle, now));
            self.returned_to_pool.fetch_add(1, Ordering::Relaxed);
            SessionState::Pooled
        } else {
            handle.retire();
            self.retired.fetch_add(1, Ordering::Relaxed);
            SessionState::Retired
        }
    }

    /// Release the session bound to `bot_id`
    pub fn return_bot(&self, bot_id: BotId) -> bool {
        let handle = {
            let mut inner = self.inner.lock();
            inner.bound.remove(&bot_id).and_then(|w| w.upgrade())
        };
        match handle {
            Some(handle) => {
                self.release(handle);
                true
            }
            None => false,
        }
    }

    /// Drain handles idle past the timeout, keeping at least `min_size`
    pub fn cleanup_idle(&self) -> usize {
        let now = self.clock.now();
        let idle_timeout = Duration::from_millis(self.config.idle_timeout_ms);
        let mut inner = self.inner.lock();
        inner.last_cleanup = now;
        inner.bound.retain(|_, w| w.strong_count() > 0);

        let mut drained = 0;
        let min = self.config.min_size;
        // oldest handles sit at the front
        let mut i = 0;
        while i < inner.pooled.len() && inner.pooled.len() > min {
            let idle = now.saturating_duration_since(inner.pooled[i].1);
            if idle >= idle_timeout {
                let (handle, _) = inner.pooled.remove(i);
                handle.retire();
                drained += 1;
            } else {
                i += 1;
            }
        }
        if drained > 0 {
            self.retired.fetch_add(drained as u64, Ordering::Relaxed);
            debug!("Session pool drained {} idle handles", drained);
        }
        drained
    }

    /// Periodic cleanup on the configured cadence
    pub fn update(&self) {
        let due = {
            let inner = self.inner.lock();
            self.clock.now().saturating_duration_since(inner.last_cleanup)
                >= Duration::from_millis(self.config.cleanup_interval_ms)
        };
        if due {
            self.cleanup_idle();
        }
    }

    pub fn can_allocate(&self) -> bool {
        self.inner.lock().active < self.max_active.load(Ordering::Relaxed)
    }

    pub fn available_count(&self) -> usize {
        let active = self.inner.lock().active;
        self.max_active.load(Ordering::Relaxed).saturating_sub(active)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active
    }

    pub fn pooled_count(&self) -> usize {
        self.inner.lock().pooled.len()
    }

    pub fn set_max_active(&self, max_active: usize) {
        self.max_active.store(max_active, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PoolStats {
        let (active, pooled) = {
            let inner = self.inner.lock();
            (inner.active, inner.pooled.len())
        };
        let acquires = self.acquires.load(Ordering::Relaxed);
        let releases = self.releases.load(Ordering::Relaxed);
        let reused = self.reused.load(Ordering::Relaxed);
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            reused,
            retired: self.retired.load(Ordering::Relaxed),
            active,
            pooled,
            hit_rate: if acquires == 0 {
                0.0
            } else {
                reused as f64 / acquires as f64
            },
            reuse_rate: if releases == 0 {
                0.0
            } else {
                self.returned_to_pool.load(Ordering::Relaxed) as f64 / releases as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ManualClock;

    fn pool(max_active: usize) -> (SessionPool, Arc<ManualClock>) {
        let clock = ManualClock::new();
        let config = PoolConfig {
            initial_size: 4,
            min_size: 2,
            max_size: 6,
            cleanup_interval_ms: 30_000,
            idle_timeout_ms: 60_000,
        };
        (SessionPool::new(config, max_active, clock.clone()), clock)
    }

    #[test]
    fn test_acquire_release_restores_pooled_count() {
        let (p, _) = pool(10);
        p.prewarm();
        let before = p.pooled_count();

        let handle = p.acquire(1).expect("capacity");
        assert_eq!(handle.state(), SessionState::Active);
        assert_eq!(p.pooled_count(), before - 1);

        assert_eq!(p.release(handle), SessionState::Pooled);
        assert_eq!(p.pooled_count(), before);
        assert_eq!(p.active_count(), 0);
    }

    #[test]
    fn test_fresh_handle_when_pool_empty() {
        let (p, _) = pool(10);
        let handle = p.acquire(1).expect("capacity");
        assert_eq!(p.stats().created, 1);
        assert_eq!(p.stats().reused, 0);
        p.release(handle);

        let _again = p.acquire(2).expect("capacity");
        let stats = p.stats();
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[test]
    fn test_active_cap() {
        let (p, _) = pool(2);
        let a = p.acquire(1);
        let b = p.acquire(1);
        assert!(a.is_some() && b.is_some());
        assert!(!p.can_allocate());
        assert!(p.acquire(1).is_none());
        assert_eq!(p.available_count(), 0);
    }

    #[test]
    fn test_pending_io_retires() {
        let (p, _) = pool(10);
        let handle = p.acquire(1).expect("capacity");
        handle.begin_io();
        let keep = handle.clone();
        assert_eq!(p.release(handle), SessionState::Retired);
        assert_eq!(keep.state(), SessionState::Retired);
        assert!(!keep.is_reusable());
    }

    #[test]
    fn test_full_pool_retires() {
        let (p, _) = pool(20);
        let handles: Vec<_> = (0..8).filter_map(|_| p.acquire(1)).collect();
        let states: Vec<_> = handles.into_iter().map(|h| p.release(h)).collect();
        assert_eq!(states.iter().filter(|s| **s == SessionState::Pooled).count(), 6);
        assert_eq!(states.iter().filter(|s| **s == SessionState::Retired).count(), 2);
    }

    #[test]
    fn test_return_bound_bot() {
        let (p, _) = pool(10);
        let handle = p.acquire(1).expect("capacity");
        handle.configure(|prof| prof.character_id = Some(55));
        p.bind(55, &handle);
        let _world_ref = handle;

        assert!(p.return_bot(55));
        assert!(!p.return_bot(55));
        assert_eq!(p.active_count(), 0);
        assert_eq!(p.pooled_count(), 1);
    }

    #[test]
    fn test_cleanup_keeps_min() {
        let (p, clock) = pool(10);
        p.prewarm();
        clock.advance_ms(60_000);
        assert_eq!(p.cleanup_idle(), 2);
        assert_eq!(p.pooled_count(), 2);
    }
}
