//! Growing, coalescing pool resource
//!
//! The pool front-ends a slow or coarse-grained upstream allocator. It
//! services allocations from a coalescing free list first and falls back to
//! geometrically growing upstream blocks, so steady-state traffic never
//! reaches upstream. When upstream runs dry it walks a retry ladder:
//! flush deferred deallocations, halve the block size down to the request
//! size, and finally hand completely free blocks back to upstream before
//! one last attempt.
//!
//! Locking order is strictly upstream lock -> free-list lock, never the
//! reverse.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::error::{PoolError, PoolResult};
use crate::free_list::{BestFitFreeList, FreeList};
use crate::options::PoolOptions;
use crate::resource::{dangling_sentinel, MemoryContext, MemoryResource};
use crate::sync::{synchronize, DeallocParams, DeviceMask, NullSyncHook, SyncHook, SyncScope};

/// A contiguous range obtained from upstream and not yet released.
#[derive(Debug, Clone, Copy)]
struct UpstreamBlock {
    ptr: NonNull<u8>,
    bytes: usize,
    alignment: usize,
}

// SAFETY: the block records an address and never dereferences it; the
// upstream resource that produced it is Send + Sync by trait bound.
unsafe impl Send for UpstreamBlock {}
unsafe impl Sync for UpstreamBlock {}

/// State guarded by the upstream lock: the owned-block set and the growth
/// series position.
#[derive(Debug)]
struct UpstreamState {
    blocks: Vec<UpstreamBlock>,
    next_block_size: usize,
}

/// Counter snapshot for monitoring and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Successful upstream allocations over the pool's lifetime.
    pub upstream_allocations: u64,
    /// Blocks returned to upstream (shutdown, `free_all`, memory pressure).
    pub upstream_deallocations: u64,
    /// Total bytes ever obtained from upstream.
    pub bytes_from_upstream: u64,
    /// Allocations served from the free list.
    pub free_list_hits: u64,
    /// Allocations that had to go to upstream.
    pub free_list_misses: u64,
    /// Fully free blocks released to upstream by the retry ladder.
    pub blocks_released_under_pressure: u64,
    /// Blocks currently owned.
    pub owned_blocks: usize,
    /// Bytes currently owned.
    pub owned_bytes: usize,
    /// Current growth series position (clamped to `max_block_size`).
    pub next_block_size: usize,
}

#[derive(Debug, Default)]
struct StatCounters {
    upstream_allocations: AtomicU64,
    upstream_deallocations: AtomicU64,
    bytes_from_upstream: AtomicU64,
    free_list_hits: AtomicU64,
    free_list_misses: AtomicU64,
    blocks_released_under_pressure: AtomicU64,
}

type FlushFn = Box<dyn Fn() + Send + Sync>;

/// Memory pool drawing geometrically growing blocks from an upstream
/// resource and recycling freed ranges through a coalescing free list.
///
/// All operations take `&self`; the pool is safe to share across threads.
/// `allocate` is the only operation that can fail, and only once the
/// upstream retry ladder is exhausted.
pub struct PoolResource<U: MemoryResource, F: FreeList = BestFitFreeList> {
    upstream: U,
    options: PoolOptions,
    sync_hook: Arc<dyn SyncHook>,
    /// Pool lock: guards the free list.
    free_list: Mutex<F>,
    /// Upstream lock: serializes upstream calls and owned-block mutation.
    upstream_state: Mutex<UpstreamState>,
    counters: StatCounters,
    /// Installed by the deferred-deallocation layer so the retry ladder can
    /// wait for a queue drain.
    flush_hook: OnceLock<FlushFn>,
}

/// Recover the guard when a panicking thread poisoned the lock; the guarded
/// structures are only mutated through non-panicking operations.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

impl<U: MemoryResource> PoolResource<U> {
    /// Pool with the default best-fit free list and a no-op sync hook.
    pub fn new(upstream: U, options: PoolOptions) -> PoolResult<Self> {
        Self::with_parts(upstream, options, BestFitFreeList::new(), Arc::new(NullSyncHook))
    }

    /// Pool with the default free list and an explicit sync hook.
    pub fn with_sync_hook(
        upstream: U,
        options: PoolOptions,
        sync_hook: Arc<dyn SyncHook>,
    ) -> PoolResult<Self> {
        Self::with_parts(upstream, options, BestFitFreeList::new(), sync_hook)
    }
}

impl<U: MemoryResource, F: FreeList> PoolResource<U, F> {
    /// Fully explicit constructor: injected free-list strategy and sync hook.
    pub fn with_parts(
        upstream: U,
        options: PoolOptions,
        free_list: F,
        sync_hook: Arc<dyn SyncHook>,
    ) -> PoolResult<Self> {
        options.validate()?;
        let next_block_size = options.min_block_size;
        Ok(PoolResource {
            upstream,
            options,
            sync_hook,
            free_list: Mutex::new(free_list),
            upstream_state: Mutex::new(UpstreamState {
                blocks: Vec::new(),
                next_block_size,
            }),
            counters: StatCounters::default(),
            flush_hook: OnceLock::new(),
        })
    }

    /// Allocate `bytes` bytes aligned to at least `alignment`.
    ///
    /// Zero-byte requests return the dangling sentinel. Fails only when
    /// upstream cannot satisfy any block in the retry ladder.
    pub fn allocate(&self, bytes: usize, alignment: usize) -> PoolResult<NonNull<u8>> {
        if bytes == 0 {
            return Ok(dangling_sentinel());
        }
        if !alignment.is_power_of_two() {
            return Err(PoolError::InvalidAlignment(alignment));
        }

        {
            let mut list = lock(&self.free_list);
            if let Some(addr) = list.get(bytes, alignment) {
                self.counters.free_list_hits.fetch_add(1, Ordering::Relaxed);
                // addr comes from a range carved out of an upstream block
                return Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) });
            }
        }
        self.counters.free_list_misses.fetch_add(1, Ordering::Relaxed);

        let alignment = alignment.max(self.options.upstream_alignment);
        let (block, blk_size) = self.get_upstream_block(bytes, alignment)?;
        if blk_size == bytes {
            // exactly the required size: unlikely to ever coalesce with the
            // pool, hand the whole block to the caller
            return Ok(block);
        }
        let mut list = lock(&self.free_list);
        list.put(block.as_ptr() as usize + bytes, blk_size - bytes);
        Ok(block)
    }

    /// Return a range, waiting at the configured sync scope first.
    pub fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, alignment: usize) {
        if bytes == 0 || ptr == dangling_sentinel() {
            return;
        }
        synchronize(self.sync_hook.as_ref(), self.options.sync);
        self.deallocate_no_sync(ptr, bytes, alignment);
    }

    /// Return a range for immediate reuse, skipping synchronization.
    ///
    /// The caller must guarantee no in-flight work targets the range.
    pub fn deallocate_no_sync(&self, ptr: NonNull<u8>, bytes: usize, _alignment: usize) {
        if bytes == 0 || ptr == dangling_sentinel() {
            return;
        }
        let mut list = lock(&self.free_list);
        list.put(ptr.as_ptr() as usize, bytes);
    }

    /// Return multiple ranges with a single synchronization pass: at most
    /// one wait per distinct device across the batch.
    pub fn bulk_deallocate(&self, params: &[DeallocParams]) {
        if params.is_empty() {
            return;
        }
        self.synchronize_batch(params);
        let mut list = lock(&self.free_list);
        for par in params {
            if par.bytes == 0 || par.ptr == dangling_sentinel() {
                continue;
            }
            list.put(par.ptr.as_ptr() as usize, par.bytes);
        }
    }

    /// Free-list-only allocation attempt; never touches upstream.
    pub fn try_allocate_from_free(&self, bytes: usize, alignment: usize) -> Option<NonNull<u8>> {
        if bytes == 0 || !alignment.is_power_of_two() {
            return None;
        }
        let mut list = lock(&self.free_list);
        let addr = list.get(bytes, alignment)?;
        self.counters.free_list_hits.fetch_add(1, Ordering::Relaxed);
        Some(unsafe { NonNull::new_unchecked(addr as *mut u8) })
    }

    /// Return every owned block to upstream and clear the free list.
    ///
    /// Callers must have quiesced: outstanding pointers become invalid.
    pub fn free_all(&self) {
        let mut state = lock(&self.upstream_state);
        let mut list = lock(&self.free_list);
        let released = state.blocks.len();
        for block in state.blocks.drain(..) {
            self.upstream.deallocate(block.ptr, block.bytes, block.alignment);
        }
        self.counters
            .upstream_deallocations
            .fetch_add(released as u64, Ordering::Relaxed);
        list.clear();
        if released > 0 {
            tracing::debug!(blocks = released, "returned all owned blocks to upstream");
        }
    }

    /// Wait for deferred deallocations to drain, if a deferred layer is
    /// stacked on this pool. No-op otherwise.
    pub fn flush_deferred(&self) {
        if let Some(hook) = self.flush_hook.get() {
            hook();
        }
    }

    pub(crate) fn set_flush_hook(&self, hook: FlushFn) {
        // at most one deferred layer per pool; a second install is ignored
        let _ = self.flush_hook.set(hook);
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    pub(crate) fn sync_hook(&self) -> &Arc<dyn SyncHook> {
        &self.sync_hook
    }

    /// Number of upstream blocks currently owned.
    pub fn owned_block_count(&self) -> usize {
        lock(&self.upstream_state).blocks.len()
    }

    /// Bytes currently owned across all upstream blocks.
    pub fn owned_bytes(&self) -> usize {
        lock(&self.upstream_state)
            .blocks
            .iter()
            .map(|b| b.bytes)
            .sum()
    }

    /// Bytes currently sitting in the free list.
    pub fn free_bytes(&self) -> usize {
        lock(&self.free_list).free_bytes()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PoolStats {
        let (owned_blocks, owned_bytes, next_block_size) = {
            let state = lock(&self.upstream_state);
            (
                state.blocks.len(),
                state.blocks.iter().map(|b| b.bytes).sum(),
                state.next_block_size,
            )
        };
        PoolStats {
            upstream_allocations: self.counters.upstream_allocations.load(Ordering::Relaxed),
            upstream_deallocations: self.counters.upstream_deallocations.load(Ordering::Relaxed),
            bytes_from_upstream: self.counters.bytes_from_upstream.load(Ordering::Relaxed),
            free_list_hits: self.counters.free_list_hits.load(Ordering::Relaxed),
            free_list_misses: self.counters.free_list_misses.load(Ordering::Relaxed),
            blocks_released_under_pressure: self
                .counters
                .blocks_released_under_pressure
                .load(Ordering::Relaxed),
            owned_blocks,
            owned_bytes,
            next_block_size,
        }
    }

    /// Obtain a block of at least `min_bytes` from upstream, walking the
    /// retry ladder on failure. Returns the block and its actual size.
    fn get_upstream_block(
        &self,
        min_bytes: usize,
        alignment: usize,
    ) -> PoolResult<(NonNull<u8>, usize)> {
        let mut state = lock(&self.upstream_state);
        let mut blk_size = Self::grow_block_size(&mut state, &self.options, min_bytes);
        let mut tried_return_to_upstream = false;
        loop {
            match self.upstream.allocate(blk_size, alignment) {
                Ok(ptr) => {
                    // recording the block must not lose it: give it back to
                    // upstream if the owned-block set cannot grow
                    if state.blocks.try_reserve(1).is_err() {
                        self.upstream.deallocate(ptr, blk_size, alignment);
                        return Err(PoolError::OutOfMemory {
                            bytes: blk_size,
                            alignment,
                        });
                    }
                    state.blocks.push(UpstreamBlock {
                        ptr,
                        bytes: blk_size,
                        alignment,
                    });
                    self.counters
                        .upstream_allocations
                        .fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .bytes_from_upstream
                        .fetch_add(blk_size as u64, Ordering::Relaxed);
                    tracing::debug!(bytes = blk_size, alignment, "new upstream block");
                    return Ok((ptr, blk_size));
                }
                Err(err) => {
                    tracing::debug!(bytes = blk_size, %err, "upstream allocation failed");
                    // outstanding deferred deallocations may hold the memory
                    // that would satisfy this request
                    self.flush_deferred();
                    if !self.options.try_smaller_on_failure {
                        return Err(err);
                    }
                    if blk_size == min_bytes {
                        // reached the minimum and still nothing: hand fully
                        // free blocks back so upstream can reorganize
                        if tried_return_to_upstream
                            || !self.options.return_to_upstream_on_failure
                            || state.blocks.is_empty()
                        {
                            return Err(err);
                        }
                        if self.release_free_blocks(&mut state) == 0 {
                            return Err(err);
                        }
                        tried_return_to_upstream = true;
                    }
                    blk_size = min_bytes.max(blk_size >> 1);
                    // shrink the growth series too, a bigger block would
                    // likely fail again
                    state.next_block_size = blk_size;
                }
            }
        }
    }

    /// Release every owned block whose whole extent sits in the free list.
    /// Returns the number of blocks released.
    ///
    /// The scan runs under the pool lock; the upstream calls happen after it
    /// is dropped, still under the upstream lock held by the caller.
    fn release_free_blocks(&self, state: &mut UpstreamState) -> usize {
        let mut removed = vec![false; state.blocks.len()];
        let mut freed = 0usize;
        {
            let mut list = lock(&self.free_list);
            for (i, block) in state.blocks.iter().enumerate() {
                removed[i] = list.remove_if_in_list(block.ptr.as_ptr() as usize, block.bytes);
                if removed[i] {
                    freed += 1;
                }
            }
        }
        if freed == 0 {
            return 0;
        }
        for i in (0..state.blocks.len()).rev() {
            if removed[i] {
                let block = state.blocks.swap_remove(i);
                self.upstream.deallocate(block.ptr, block.bytes, block.alignment);
                tracing::warn!(
                    bytes = block.bytes,
                    "released fully free block to upstream under memory pressure"
                );
            }
        }
        self.counters
            .upstream_deallocations
            .fetch_add(freed as u64, Ordering::Relaxed);
        self.counters
            .blocks_released_under_pressure
            .fetch_add(freed as u64, Ordering::Relaxed);
        freed
    }

    /// Advance the growth series and pick the next upstream request size.
    ///
    /// The size is aligned to 1/1024th of itself or 4 KiB, whichever is
    /// larger. Upstream resources often have coarse size granularity;
    /// aligning the request raises the chance that consecutive blocks come
    /// out physically adjacent so the free list can coalesce them. The
    /// stored series is clamped to `max_block_size`, but the returned value
    /// is not, so oversized requests are honored exactly.
    fn grow_block_size(
        state: &mut UpstreamState,
        options: &PoolOptions,
        min_bytes: usize,
    ) -> usize {
        let grown = (state.next_block_size as f64 * options.growth_factor as f64) as usize;
        let mut actual = min_bytes.max(grown);
        let size_alignment = 1usize << (actual.ilog2() as i32 - 10).max(12);
        actual = align_up(actual, size_alignment);
        state.next_block_size = actual.min(options.max_block_size);
        actual
    }

    fn synchronize_batch(&self, params: &[DeallocParams]) {
        match self.options.sync {
            SyncScope::None => {}
            SyncScope::System => self.sync_hook.sync_all_devices(),
            SyncScope::Device => {
                let mut mask = DeviceMask::new();
                for par in params {
                    let dev = if par.sync_device < 0 {
                        self.sync_hook.current_device()
                    } else {
                        par.sync_device
                    };
                    if mask.insert(dev) {
                        self.sync_hook.sync_device(dev);
                    }
                }
            }
        }
    }
}

impl<U: MemoryResource, F: FreeList> MemoryResource for PoolResource<U, F> {
    fn allocate(&self, bytes: usize, alignment: usize) -> PoolResult<NonNull<u8>> {
        PoolResource::allocate(self, bytes, alignment)
    }

    fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, alignment: usize) {
        PoolResource::deallocate(self, ptr, bytes, alignment)
    }

    fn context(&self) -> MemoryContext {
        self.upstream.context()
    }
}

impl<U: MemoryResource, F: FreeList> Drop for PoolResource<U, F> {
    fn drop(&mut self) {
        self.free_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::SystemAllocator;

    fn test_state(next_block_size: usize) -> UpstreamState {
        UpstreamState {
            blocks: Vec::new(),
            next_block_size,
        }
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
    }

    #[test]
    fn test_grow_block_size_applies_growth_factor() {
        let opt = PoolOptions::host(); // min 4096, growth 2
        let mut state = test_state(opt.min_block_size);
        let size = PoolResource::<SystemAllocator>::grow_block_size(&mut state, &opt, 100);
        assert_eq!(size, 8192);
        assert_eq!(state.next_block_size, 8192);
        let size = PoolResource::<SystemAllocator>::grow_block_size(&mut state, &opt, 100);
        assert_eq!(size, 16384);
    }

    #[test]
    fn test_grow_block_size_small_sizes_align_to_page() {
        let opt = PoolOptions::host().with_min_block_size(1024);
        let mut state = test_state(1024);
        // 2048 grows below the 4 KiB floor and is aligned up to it
        let size = PoolResource::<SystemAllocator>::grow_block_size(&mut state, &opt, 1);
        assert_eq!(size, 4096);
    }

    #[test]
    fn test_grow_block_size_large_sizes_align_coarser() {
        let opt = PoolOptions::host().with_max_block_size(1 << 40);
        let mut state = test_state(3 << 20);
        // 6 MiB candidate: alignment is 2^(22-10) = 4 KiB at this magnitude
        let size = PoolResource::<SystemAllocator>::grow_block_size(&mut state, &opt, 1);
        assert_eq!(size % 4096, 0);
        assert!(size >= 6 << 20);
    }

    #[test]
    fn test_grow_block_size_clamps_state_not_result() {
        let opt = PoolOptions::host()
            .with_min_block_size(4096)
            .with_max_block_size(1 << 20);
        let mut state = test_state(1 << 20);
        let oversized = 1 << 22;
        let size = PoolResource::<SystemAllocator>::grow_block_size(&mut state, &opt, oversized);
        assert!(size >= oversized);
        assert_eq!(state.next_block_size, 1 << 20);
    }

    #[test]
    fn test_grow_block_size_honors_oversized_exactly() {
        let opt = PoolOptions::host().with_max_block_size(1 << 20);
        let mut state = test_state(1 << 20);
        // already 4 KiB-aligned oversized request comes back unchanged
        let oversized = (1 << 22) + 4096;
        let size = PoolResource::<SystemAllocator>::grow_block_size(&mut state, &opt, oversized);
        assert_eq!(size, oversized);
    }
}
