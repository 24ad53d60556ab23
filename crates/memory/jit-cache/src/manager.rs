//! Code cache manager
//!
//! Owns every code cache segment. Compilation threads reserve a segment for
//! the duration of one compile, allocate warm and cold code from it, and
//! release the reservation when done. New segments are created on demand up
//! to the configured maximum.

use crate::code_cache::{CodeAllocation, CodeCache};
use crate::error::{CacheError, CacheResult};
use crate::sizing::CacheSizing;
use jit_core::StartPc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Decides which bodies can be freed at the end of a GC cycle.
pub trait ReclaimSource {
    /// `true` when the body at `pc` is dead (method unloaded, or body
    /// invalidated/superseded) and no live frame references it.
    fn is_reclaimable(&self, pc: StartPc) -> bool;
}

impl<F: Fn(StartPc) -> bool> ReclaimSource for F {
    fn is_reclaimable(&self, pc: StartPc) -> bool {
        self(pc)
    }
}

/// Result of a GC-end reclamation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    pub bodies: usize,
    pub bytes: usize,
    pub freed: Vec<StartPc>,
}

#[derive(Debug, Clone, Default)]
pub struct CodeCacheStats {
    pub caches: usize,
    pub capacity_bytes: usize,
    pub used_bytes: usize,
    pub allocations: u64,
    pub failed_allocations: u64,
    pub reclaimed_bytes: u64,
}

#[derive(Debug)]
struct ManagerState {
    caches: Vec<CodeCache>,
    bodies: HashMap<StartPc, CodeAllocation>,
}

#[derive(Debug)]
pub struct CodeCacheManager {
    sizing: CacheSizing,
    state: Mutex<ManagerState>,
    allocations: AtomicU64,
    failed_allocations: AtomicU64,
    reclaimed_bytes: AtomicU64,
}

/// Exclusive hold on one code cache for the duration of a compile.
#[derive(Debug)]
pub struct CacheReservation {
    manager: Arc<CodeCacheManager>,
    cache_id: usize,
}

impl CacheReservation {
    pub fn cache_id(&self) -> usize {
        self.cache_id
    }

    pub fn allocate(&self, warm: usize, cold: usize) -> CacheResult<CodeAllocation> {
        self.manager.allocate(self.cache_id, warm, cold)
    }
}

impl Drop for CacheReservation {
    fn drop(&mut self) {
        self.manager.unreserve(self.cache_id);
    }
}

fn segment_base(id: usize) -> u64 {
    (id as u64 + 1) << 32
}

impl CodeCacheManager {
    /// Create the manager and its startup caches.
    pub fn new(sizing: CacheSizing) -> Arc<Self> {
        let segment = sizing.segment_bytes();
        let caches = (0..sizing.num_code_caches_at_startup)
            .map(|id| CodeCache::new(id, segment_base(id), segment))
            .collect::<Vec<_>>();
        info!(
            target: "jit::codecache",
            count = caches.len(),
            segment_kb = segment / 1024,
            "code caches created"
        );
        Arc::new(Self {
            sizing,
            state: Mutex::new(ManagerState {
                caches,
                bodies: HashMap::new(),
            }),
            allocations: AtomicU64::new(0),
            failed_allocations: AtomicU64::new(0),
            reclaimed_bytes: AtomicU64::new(0),
        })
    }

    pub fn sizing(&self) -> &CacheSizing {
        &self.sizing
    }

    fn can_grow(&self, state: &ManagerState) -> bool {
        self.sizing.allow_grow && state.caches.len() < self.sizing.max_number_of_code_caches
    }

    fn grow(&self, state: &mut ManagerState) -> Option<usize> {
        if !self.can_grow(state) {
            return None;
        }
        let id = state.caches.len();
        state
            .caches
            .push(CodeCache::new(id, segment_base(id), self.sizing.segment_bytes()));
        info!(target: "jit::codecache", id, total = state.caches.len(), "code cache grown");
        Some(id)
    }

    /// Reserve the unreserved cache with the most free space, growing if all
    /// are taken.
    pub fn reserve(self: &Arc<Self>) -> CacheResult<CacheReservation> {
        let mut state = self.state.lock();
        let candidate = state
            .caches
            .iter()
            .filter(|c| !c.is_reserved())
            .max_by_key(|c| c.free_bytes())
            .map(CodeCache::id);
        let id = match candidate {
            Some(id) => id,
            None => self.grow(&mut state).ok_or(CacheError::ReservationFailure)?,
        };
        state.caches[id].set_reserved(true);
        debug!(target: "jit::codecache", id, "code cache reserved");
        Ok(CacheReservation {
            manager: Arc::clone(self),
            cache_id: id,
        })
    }

    fn unreserve(&self, cache_id: usize) {
        if let Some(cache) = self.state.lock().caches.get_mut(cache_id) {
            cache.set_reserved(false);
        }
    }

    fn allocate(&self, cache_id: usize, warm: usize, cold: usize) -> CacheResult<CodeAllocation> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let cache = state
            .caches
            .get_mut(cache_id)
            .ok_or(CacheError::NotReserved(cache_id))?;
        if !cache.is_reserved() {
            return Err(CacheError::NotReserved(cache_id));
        }
        if let Some(allocation) = cache.allocate(warm, cold) {
            state.bodies.insert(allocation.warm_start, allocation);
            self.allocations.fetch_add(1, Ordering::Relaxed);
            return Ok(allocation);
        }

        self.failed_allocations.fetch_add(1, Ordering::Relaxed);
        // A retry on a different cache can only help if one has room or can
        // be created.
        let requested = warm + cold;
        let elsewhere = state
            .caches
            .iter()
            .any(|c| c.id() != cache_id && !c.is_reserved() && c.gap_bytes() >= requested);
        let recoverable = elsewhere
            || (self.sizing.segment_bytes() >= requested && self.grow(state).is_some());
        warn!(
            target: "jit::codecache",
            cache_id,
            requested,
            recoverable,
            "code cache allocation failed"
        );
        Err(CacheError::CodeCacheFull {
            cache_id,
            requested,
            recoverable,
        })
    }

    /// Free the body whose warm code starts at `pc`.
    pub fn free_body(&self, pc: StartPc) -> Option<usize> {
        let mut state = self.state.lock();
        let allocation = state.bodies.remove(&pc)?;
        let cache = state.caches.get_mut(allocation.cache_id)?;
        cache.free(&allocation);
        Some(allocation.total_size())
    }

    pub fn allocation(&self, pc: StartPc) -> Option<CodeAllocation> {
        self.state.lock().bodies.get(&pc).copied()
    }

    /// GC end-of-cycle hook: free every body `source` reports as dead.
    pub fn on_gc_end(&self, source: &dyn ReclaimSource) -> ReclaimStats {
        let mut state = self.state.lock();
        let dead: Vec<StartPc> = state
            .bodies
            .keys()
            .copied()
            .filter(|pc| source.is_reclaimable(*pc))
            .collect();
        let mut stats = ReclaimStats::default();
        for pc in dead {
            let Some(allocation) = state.bodies.remove(&pc) else {
                continue;
            };
            if let Some(cache) = state.caches.get_mut(allocation.cache_id) {
                cache.free(&allocation);
            }
            stats.bodies += 1;
            stats.bytes += allocation.total_size();
            stats.freed.push(pc);
        }
        if stats.bodies > 0 {
            self.reclaimed_bytes
                .fetch_add(stats.bytes as u64, Ordering::Relaxed);
            info!(
                target: "jit::codecache",
                bodies = stats.bodies,
                bytes = stats.bytes,
                "reclaimed code at GC end"
            );
        }
        stats
    }

    pub fn used_bytes(&self) -> usize {
        self.state.lock().caches.iter().map(CodeCache::used_bytes).sum()
    }

    pub fn free_bytes(&self) -> usize {
        self.state.lock().caches.iter().map(CodeCache::free_bytes).sum()
    }

    pub fn num_caches(&self) -> usize {
        self.state.lock().caches.len()
    }

    /// Little space left and no room to grow.
    pub fn almost_out_of_code_cache(&self) -> bool {
        let state = self.state.lock();
        if self.can_grow(&state) {
            return false;
        }
        let free: usize = state.caches.iter().map(CodeCache::free_bytes).sum();
        free < self.sizing.low_code_cache_threshold_bytes
    }

    /// Used bytes across all caches reached the high-occupancy threshold.
    pub fn is_high_occupancy(&self) -> bool {
        self.used_bytes() >= self.sizing.high_occupancy_threshold_bytes
    }

    pub fn stats(&self) -> CodeCacheStats {
        let state = self.state.lock();
        CodeCacheStats {
            caches: state.caches.len(),
            capacity_bytes: state.caches.iter().map(CodeCache::size).sum(),
            used_bytes: state.caches.iter().map(CodeCache::used_bytes).sum(),
            allocations: self.allocations.load(Ordering::Relaxed),
            failed_allocations: self.failed_allocations.load(Ordering::Relaxed),
            reclaimed_bytes: self.reclaimed_bytes.load(Ordering::Relaxed),
        }
    }
}
