#![forbid(unsafe_code)]

//! Buffer/pin manager for large in-memory payloads.
//!
//! Payload owners register an [`Evictable`] with the [`BufferPool`]. The pool
//! tracks resident bytes and, when over capacity, unloads unpinned payloads in
//! least-recently-used order. A pinned payload is never unloaded; callers must
//! not assume residency outside a pin scope.

use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::types::{BasaltError, Result};

/// Identifier handed out by [`BufferPool::register`].
pub type BufferId = u64;

/// Callbacks the pool invokes to move a payload in and out of memory.
pub trait Evictable: Send + Sync {
    /// Bytes the payload occupies while resident.
    fn resident_bytes(&self) -> usize;
    /// Restores the payload into memory.
    fn on_load(&self) -> Result<()>;
    /// Releases the in-memory payload.
    ///
    /// Returns `Ok(false)` when the payload cannot be released right now; the
    /// pool keeps it resident and tries other candidates.
    fn on_unload(&self) -> Result<bool>;
    /// Called once when the payload is unregistered.
    fn on_destroy(&self);
}

/// Counters describing pool activity.
#[derive(Clone, Debug, Default)]
pub struct PoolStats {
    /// Payloads currently registered.
    pub registered: usize,
    /// Bytes currently accounted as resident.
    pub resident_bytes: usize,
    /// Successful unloads.
    pub evictions: u64,
    /// Reloads triggered by a pin.
    pub loads: u64,
}

struct PoolEntry {
    node: Arc<dyn Evictable>,
    pin_count: u32,
    resident: bool,
    charged: usize,
}

struct PoolState {
    entries: FxHashMap<BufferId, PoolEntry>,
    // Resident and unpinned, in eviction order.
    idle: LruCache<BufferId, ()>,
    next_id: BufferId,
    stats: PoolStats,
}

/// Capacity-bounded set of evictable payloads.
pub struct BufferPool {
    capacity_bytes: usize,
    state: Mutex<PoolState>,
}

impl BufferPool {
    /// Creates a pool that keeps at most `capacity_bytes` of unpinned payloads resident.
    pub fn new(capacity_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity_bytes,
            state: Mutex::new(PoolState {
                entries: FxHashMap::default(),
                idle: LruCache::unbounded(),
                next_id: 1,
                stats: PoolStats::default(),
            }),
        })
    }

    /// Configured capacity in bytes.
    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// Registers a resident payload and returns its id.
    pub fn register(&self, node: Arc<dyn Evictable>) -> BufferId {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let charged = node.resident_bytes();
        state.entries.insert(
            id,
            PoolEntry {
                node,
                pin_count: 0,
                resident: true,
                charged,
            },
        );
        state.idle.put(id, ());
        state.stats.registered += 1;
        state.stats.resident_bytes += charged;
        trace!(buffer_id = id, bytes = charged, "buffer registered");
        self.evict_locked(&mut state);
        id
    }

    /// Pins `id`, loading it first if it was unloaded.
    pub fn pin(self: &Arc<Self>, id: BufferId) -> Result<PinHandle> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(&id).ok_or(BasaltError::NotFound)?;
        let mut loaded = None;
        if !entry.resident {
            entry.node.on_load()?;
            entry.resident = true;
            entry.charged = entry.node.resident_bytes();
            loaded = Some(entry.charged);
        }
        entry.pin_count += 1;
        if let Some(bytes) = loaded {
            state.stats.loads += 1;
            state.stats.resident_bytes += bytes;
            debug!(buffer_id = id, bytes, "buffer reloaded");
        }
        state.idle.pop(&id);
        self.evict_locked(&mut state);
        Ok(PinHandle {
            pool: Arc::clone(self),
            id,
            closed: false,
        })
    }

    /// Removes `id` from the pool and invokes its destroy callback.
    pub fn unregister(&self, id: BufferId) {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.entries.remove(&id);
            if let Some(entry) = &removed {
                state.idle.pop(&id);
                state.stats.registered -= 1;
                if entry.resident {
                    state.stats.resident_bytes -= entry.charged;
                }
            }
            removed
        };
        if let Some(entry) = removed {
            entry.node.on_destroy();
        }
    }

    /// Whether `id` is currently resident.
    pub fn is_resident(&self, id: BufferId) -> bool {
        self.state
            .lock()
            .entries
            .get(&id)
            .map(|entry| entry.resident)
            .unwrap_or(false)
    }

    /// Unloads idle payloads until resident bytes fit the capacity.
    pub fn shrink(&self) {
        let mut state = self.state.lock();
        self.evict_locked(&mut state);
    }

    /// Returns a snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats.clone()
    }

    fn unpin(&self, id: BufferId) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&id) else {
            return;
        };
        debug_assert!(entry.pin_count > 0, "unpin without pin");
        entry.pin_count = entry.pin_count.saturating_sub(1);
        if entry.pin_count == 0 && entry.resident {
            state.idle.put(id, ());
        }
        self.evict_locked(&mut state);
    }

    fn evict_locked(&self, state: &mut PoolState) {
        let mut skipped = Vec::new();
        while state.stats.resident_bytes > self.capacity_bytes {
            let Some((id, ())) = state.idle.pop_lru() else {
                break;
            };
            let Some(entry) = state.entries.get_mut(&id) else {
                continue;
            };
            match entry.node.on_unload() {
                Ok(true) => {
                    entry.resident = false;
                    let freed = entry.charged;
                    entry.charged = 0;
                    state.stats.resident_bytes -= freed;
                    state.stats.evictions += 1;
                    debug!(buffer_id = id, bytes = freed, "buffer unloaded");
                }
                Ok(false) => skipped.push(id),
                Err(err) => {
                    warn!(buffer_id = id, error = %err, "buffer unload failed");
                    skipped.push(id);
                }
            }
        }
        for id in skipped {
            state.idle.put(id, ());
        }
    }
}

/// Keeps a payload resident until closed or dropped.
pub struct PinHandle {
    pool: Arc<BufferPool>,
    id: BufferId,
    closed: bool,
}

impl PinHandle {
    /// Id of the pinned payload.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Releases the pin.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.pool.unpin(self.id);
        }
    }
}

impl Drop for PinHandle {
    fn drop(&mut self) {
        self.release();
    }
}
