//! The caching allocator itself: one pool per device, recycling freed [`RawAllocation`]s instead of
//! issuing a runtime `malloc`/`free` per request.
//!
//! The pool's mutable state is handed out as an `Arc<Mutex<Inner>>` cheap-to-clone handle, and
//! pooled resources carry a [`Weak`] back-reference that reclaims themselves on `Drop` - so a
//! dropped pointer frees its chunk even if the caller never holds the pool directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Result;

use crate::arena::{round_up, Arena, ChunkRef};
use crate::chunk::{self, Chunk};
use crate::error::{self, Error};
use crate::memory_pointer::{MemoryOwner, MemoryPointer};
use crate::raw_allocation::RawAllocation;
use crate::runtime::{DeviceId, Runtime, StreamId};

static FREE_ALL_FREE_DEPRECATION_WARNED: AtomicBool = AtomicBool::new(false);

static_assertions::assert_impl_all!(SingleDevicePool: Send, Sync, Clone);
static_assertions::assert_impl_all!(PooledMemory: Send, Sync);

/// Tuning knobs for a [`SingleDevicePool`]. The defaults are deliberately conservative; a caller
/// issuing many small allocations should raise `initial_bins`, and one issuing few very large
/// allocations should raise `unit`.
#[derive(Debug, Copy, Clone)]
pub struct PoolConfig {
    /// Free-list bins to pre-size each stream's [`Arena`] with.
    pub initial_bins: usize,
    /// The granularity every allocation request and chunk size is rounded up to.
    pub unit: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_bins: 1024,
            unit: 512,
        }
    }
}

struct Parent {
    allocation: Arc<RawAllocation>,
    slab: Vec<Chunk>,
}

impl Parent {
    /// True if every chunk in this parent's slab is free, i.e. the whole backing allocation could
    /// be released to the runtime without abandoning anything still in use.
    fn fully_free(&self) -> bool {
        self.slab.iter().all(|c| c.size == 0 || !c.in_use)
    }
}

struct PoolInner {
    runtime: Arc<dyn Runtime + Send + Sync>,
    device_id: DeviceId,
    config: PoolConfig,
    parents: Vec<Parent>,
    arenas: HashMap<StreamId, Arena>,
    in_use: HashMap<u64, ChunkRef>,
    finalizers: Vec<Box<dyn FnMut() + Send>>,
}

impl PoolInner {
    fn arena_mut(&mut self, stream: StreamId) -> &mut Arena {
        let initial_bins = self.config.initial_bins;
        let unit = self.config.unit;
        self.arenas
            .entry(stream)
            .or_insert_with(|| Arena::new(stream, initial_bins, unit))
    }

    /// Try to satisfy `rounded` bytes on `stream` purely from already-free chunks. Splits the
    /// winning chunk down to size if it was larger than requested, returning its remainder to the
    /// same stream's arena.
    fn try_reuse(&mut self, rounded: usize, stream: StreamId) -> Option<(usize, ChunkRef)> {
        let chunk_ref = self.arena_mut(stream).take_best_fit(rounded)?;

        let (chunk_index, free_size) = {
            let parent = &mut self.parents[chunk_ref.parent];
            let free_size = parent.slab[chunk_ref.chunk].size;
            let chunk_index = chunk::split(&mut parent.slab, chunk_ref.chunk, rounded, stream);
            (chunk_index, free_size)
        };

        // split() only creates a new remainder chunk when the chunk it split was strictly larger
        // than what was requested; otherwise `next` (if any) is a pre-existing neighbor that is
        // already tracked wherever it belongs and must not be touched here.
        let remainder = (free_size != rounded)
            .then(|| {
                let parent = &self.parents[chunk_ref.parent];
                parent.slab[chunk_index].next.map(|r| (r, parent.slab[r].size))
            })
            .flatten();
        if let Some((remainder_index, remainder_size)) = remainder {
            self.arena_mut(stream).insert(
                remainder_size,
                ChunkRef {
                    parent: chunk_ref.parent,
                    chunk: remainder_index,
                },
            );
        }

        Some((
            chunk_ref.parent,
            ChunkRef {
                parent: chunk_ref.parent,
                chunk: chunk_index,
            },
        ))
    }

    /// Allocate a brand new parent [`RawAllocation`] sized to exactly `rounded` bytes and wrap it
    /// in a single in-use chunk covering the whole thing. The parent allocation never has spare
    /// room left over: a cold allocation is sized to the request, not to some larger growth unit.
    fn grow_and_reuse(&mut self, rounded: usize, stream: StreamId) -> Result<(usize, ChunkRef)> {
        #[cfg(feature = "log-objects")]
        log::debug!("cold allocation: device {:?} allocating {} bytes", self.device_id, rounded);
        let allocation = RawAllocation::new(self.runtime.clone(), self.device_id, rounded)?;
        let parent_index = self.parents.len();
        let mut slab = vec![Chunk::new(0, rounded, stream)];
        let chunk_index = chunk::split(&mut slab, 0, rounded, stream);
        self.parents.push(Parent {
            allocation: Arc::new(allocation),
            slab,
        });

        Ok((
            parent_index,
            ChunkRef {
                parent: parent_index,
                chunk: chunk_index,
            },
        ))
    }

    /// Release every parent allocation that is currently fully free back to the runtime. Returns
    /// the number of parents released.
    fn release_free_parents(&mut self) -> usize {
        #[cfg(feature = "log-objects")]
        log::debug!("eviction sweep: releasing fully-free parent allocations on device {:?}", self.device_id);
        let mut released = 0;
        let mut keep = Vec::with_capacity(self.parents.len());
        let mut old_to_new = HashMap::new();

        for (old_index, parent) in self.parents.drain(..).enumerate() {
            if parent.fully_free() {
                released += 1;
                continue;
            }
            old_to_new.insert(old_index, keep.len());
            keep.push(parent);
        }
        self.parents = keep;

        if released > 0 {
            for arena in self.arenas.values_mut() {
                arena.clear();
            }
            for (parent_index, parent) in self.parents.iter().enumerate() {
                for (chunk_index, c) in parent.slab.iter().enumerate() {
                    if c.size > 0 && !c.in_use {
                        let arena = self.arenas.entry(c.stream_tag).or_insert_with(|| {
                            Arena::new(c.stream_tag, self.config.initial_bins, self.config.unit)
                        });
                        arena.insert(
                            c.size,
                            ChunkRef {
                                parent: parent_index,
                                chunk: chunk_index,
                            },
                        );
                    }
                }
            }
            self.in_use = self
                .in_use
                .drain()
                .filter_map(|(addr, chunk_ref)| {
                    old_to_new.get(&chunk_ref.parent).map(|&new_parent| {
                        (
                            addr,
                            ChunkRef {
                                parent: new_parent,
                                chunk: chunk_ref.chunk,
                            },
                        )
                    })
                })
                .collect();
        }

        #[cfg(feature = "log-objects")]
        log::debug!("eviction sweep released {} parent allocation(s)", released);
        released
    }

    fn address_of(&self, chunk_ref: ChunkRef) -> u64 {
        let parent = &self.parents[chunk_ref.parent];
        parent.allocation.base_address() + parent.slab[chunk_ref.chunk].offset
    }

    fn free_internal(&mut self, address: u64) -> Result<()> {
        let chunk_ref = self
            .in_use
            .remove(&address)
            .ok_or(Error::InvalidFreeAddress)?;

        let (stream, absorbed) = {
            let parent = &mut self.parents[chunk_ref.parent];
            parent.slab[chunk_ref.chunk].in_use = false;
            let stream = parent.slab[chunk_ref.chunk].stream_tag;
            let absorbed: Vec<(usize, usize)> = chunk::free_neighbors(&parent.slab, chunk_ref.chunk)
                .into_iter()
                .map(|index| (index, parent.slab[index].size))
                .collect();
            (stream, absorbed)
        };

        // Evict the neighbors' existing free-list entries before merging absorbs them - otherwise
        // their ChunkRef would dangle, pointing at a zero-size tombstone.
        for (index, size) in absorbed {
            self.arena_mut(stream).remove(
                size,
                ChunkRef {
                    parent: chunk_ref.parent,
                    chunk: index,
                },
            );
        }

        let merged_index = {
            let parent = &mut self.parents[chunk_ref.parent];
            chunk::merge_with_neighbors(&mut parent.slab, chunk_ref.chunk)
        };
        let merged_size = self.parents[chunk_ref.parent].slab[merged_index].size;

        self.arena_mut(stream).insert(
            merged_size,
            ChunkRef {
                parent: chunk_ref.parent,
                chunk: merged_index,
            },
        );
        Ok(())
    }

    fn n_free_blocks(&self) -> usize {
        self.arenas.values().map(Arena::free_chunk_count).sum()
    }

    fn free_bytes(&self) -> usize {
        self.arenas
            .values()
            .flat_map(Arena::iter)
            .map(|c| self.parents[c.parent].slab[c.chunk].size)
            .sum()
    }

    fn total_bytes(&self) -> usize {
        self.parents.iter().map(|p| p.allocation.size_bytes()).sum()
    }
}

/// A caching memory pool bound to a single device.
///
/// Not `Sync`-safe for concurrent compound use: the internal `Mutex` exists only so that a
/// [`PooledMemory`] can reclaim its chunk on `Drop` from whatever thread happens to drop it, not to
/// make `malloc`/`free` safe to call concurrently from multiple threads against the same pool.
/// Callers are expected to serialize access per device, as described in the concurrency notes.
#[derive(Clone)]
pub struct SingleDevicePool {
    inner: Arc<Mutex<PoolInner>>,
}

impl SingleDevicePool {
    pub fn new(runtime: Arc<dyn Runtime + Send + Sync>, device_id: DeviceId, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                runtime,
                device_id,
                config,
                parents: Vec::new(),
                arenas: HashMap::new(),
                in_use: HashMap::new(),
                finalizers: Vec::new(),
            })),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.lock().expect("pool mutex poisoned").device_id
    }

    /// Allocate `size` bytes, tagged with `stream`, preferring an already-free chunk over a fresh
    /// runtime allocation. A `size` of zero returns a pointer backed by a dedicated zero-size owner
    /// and never touches the pool's bookkeeping.
    pub fn malloc(&self, size: usize, stream: StreamId) -> Result<MemoryPointer> {
        if size == 0 {
            let owner: Arc<dyn MemoryOwner> = {
                let inner = self.inner.lock().map_err(Error::from)?;
                Arc::new(RawAllocation::from_raw_parts(
                    inner.runtime.clone(),
                    inner.device_id,
                    0,
                    0,
                ))
            };
            return MemoryPointer::new(owner, 0);
        }

        let mut inner = self.inner.lock().map_err(Error::from)?;
        let rounded = round_up(size, inner.config.unit);

        let (parent_index, chunk_ref) = match inner.try_reuse(rounded, stream) {
            Some(found) => found,
            None => match inner.grow_and_reuse(rounded, stream) {
                Ok(found) => found,
                Err(first_err) => {
                    // Any non-OOM failure from the runtime propagates unchanged; the two-stage
                    // eviction retry below only applies to out-of-memory.
                    if !error::is_out_of_memory(&first_err) {
                        return Err(first_err);
                    }

                    // Stage one: release every fully-free parent and retry once.
                    log::warn!("device {:?} out of memory, releasing free parents and retrying", inner.device_id);
                    inner.release_free_parents();
                    match inner.grow_and_reuse(rounded, stream) {
                        Ok(found) => found,
                        Err(second_err) => {
                            if !error::is_out_of_memory(&second_err) {
                                return Err(second_err);
                            }

                            // Stage two: run registered host finalizers, then retry one last time.
                            log::warn!(
                                "device {:?} still out of memory after releasing free parents, running finalizers",
                                inner.device_id
                            );
                            let mut finalizers = std::mem::take(&mut inner.finalizers);
                            for finalizer in finalizers.iter_mut() {
                                finalizer();
                            }
                            inner.finalizers = finalizers;
                            inner.grow_and_reuse(rounded, stream)?
                        }
                    }
                }
            },
        };

        let address = inner.address_of(chunk_ref);
        inner.in_use.insert(address, chunk_ref);
        let allocation = inner.parents[parent_index].allocation.clone();
        drop(inner);

        let owner: Arc<dyn MemoryOwner> = Arc::new(PooledMemory {
            pool: Arc::downgrade(&self.inner),
            device_id: allocation.device_id(),
            runtime: Arc::clone(allocation.runtime()),
            address,
            size,
        });
        MemoryPointer::new(owner, 0)
    }

    /// Return the chunk backing `address` to its stream's free list. Most callers never need this
    /// directly: the [`PooledMemory`] returned transitively through a [`MemoryPointer`] does this
    /// automatically on `Drop`.
    pub fn free(&self, address: u64) -> Result<()> {
        self.inner.lock().map_err(Error::from)?.free_internal(address)
    }

    /// Release every parent allocation that is currently entirely free back to the runtime.
    /// Returns the number of parent allocations released.
    pub fn free_all_blocks(&self) -> usize {
        self.inner
            .lock()
            .expect("pool mutex poisoned")
            .release_free_parents()
    }

    /// Deprecated alias for [`Self::free_all_blocks`]. Emits a one-time `log::warn!` diagnostic on
    /// its first call, then delegates.
    #[deprecated(note = "use free_all_blocks instead")]
    pub fn free_all_free(&self) -> usize {
        if !FREE_ALL_FREE_DEPRECATION_WARNED.swap(true, Ordering::Relaxed) {
            log::warn!("SingleDevicePool::free_all_free is deprecated, use free_all_blocks instead");
        }
        self.free_all_blocks()
    }

    /// Register a callback invoked once, in registration order, during the second stage of the
    /// out-of-memory retry in [`Self::malloc`] - after releasing free parents has already failed to
    /// make room. Intended for host-side work that can free up device memory indirectly, such as
    /// dropping cached results a caller no longer needs.
    pub fn register_finalizer(&self, finalizer: impl FnMut() + Send + 'static) {
        self.inner
            .lock()
            .expect("pool mutex poisoned")
            .finalizers
            .push(Box::new(finalizer));
    }

    pub fn n_free_blocks(&self) -> usize {
        self.inner.lock().expect("pool mutex poisoned").n_free_blocks()
    }

    pub fn free_bytes(&self) -> usize {
        self.inner.lock().expect("pool mutex poisoned").free_bytes()
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().expect("pool mutex poisoned").total_bytes()
    }

    pub fn used_bytes(&self) -> usize {
        let inner = self.inner.lock().expect("pool mutex poisoned");
        inner.total_bytes() - inner.free_bytes()
    }
}

/// The owner handle backing a [`MemoryPointer`] produced by [`SingleDevicePool::malloc`]. Returns
/// its chunk to the pool's free list on `Drop`; a no-op if the pool has already been dropped.
pub struct PooledMemory {
    pool: Weak<Mutex<PoolInner>>,
    device_id: DeviceId,
    runtime: Arc<dyn Runtime + Send + Sync>,
    address: u64,
    size: usize,
}

impl std::fmt::Debug for PooledMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledMemory")
            .field("device_id", &self.device_id)
            .field("address", &format_args!("0x{:x}", self.address))
            .field("size", &self.size)
            .finish()
    }
}

impl MemoryOwner for PooledMemory {
    fn base_address(&self) -> u64 {
        self.address
    }

    fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn runtime(&self) -> &Arc<dyn Runtime + Send + Sync> {
        &self.runtime
    }
}

impl Drop for PooledMemory {
    fn drop(&mut self) {
        if self.size == 0 {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            if let Ok(mut inner) = pool.lock() {
                let _ = inner.free_internal(self.address);
            }
        }
    }
}
