//! Deferred deallocation on a background worker
//!
//! Releasing device memory can require waiting for in-flight asynchronous
//! work, which is too expensive for the hot path. This layer buffers
//! returns in two alternating queues and drains them on a worker thread:
//! the worker takes the submission queue, flips the index so new returns
//! accumulate in the other queue, and only then performs the (potentially
//! long) batched synchronization, never holding the queue mutex across it.
//!
//! The queue mutex is a leaf lock: it is never held while acquiring the
//! pool or upstream locks.

use std::mem;
use std::ptr::NonNull;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::error::PoolResult;
use crate::free_list::{BestFitFreeList, FreeList};
use crate::options::PoolOptions;
use crate::pool::{PoolResource, PoolStats};
use crate::resource::{dangling_sentinel, MemoryContext, MemoryResource};
use crate::sync::{DeallocParams, NullSyncHook, SyncHook, CURRENT_DEVICE};

struct QueueState {
    queues: [Vec<DeallocParams>; 2],
    /// Which queue receives submissions; the worker drains the other.
    queue_idx: usize,
    /// Records taken by the worker but not yet inserted into the free list.
    in_flight: usize,
    /// Incremented after every completed drain.
    flush_epoch: u64,
    worker: Option<JoinHandle<()>>,
    stopped: bool,
}

struct DeferredShared {
    mtx: Mutex<QueueState>,
    /// Work available.
    cv: Condvar,
    /// A flush completed.
    ready: Condvar,
}

impl DeferredShared {
    fn new() -> Self {
        DeferredShared {
            mtx: Mutex::new(QueueState {
                queues: [Vec::new(), Vec::new()],
                queue_idx: 0,
                in_flight: 0,
                flush_epoch: 0,
                worker: None,
                stopped: false,
            }),
            cv: Condvar::new(),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.mtx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn outstanding(state: &QueueState) -> usize {
        state.queues[0].len() + state.queues[1].len() + state.in_flight
    }

    /// Wait for one full queue drain. Deliberately does not guarantee both
    /// queues are empty on return: waiting for that could deadlock with
    /// concurrent submitters.
    fn flush(&self) {
        let mut guard = self.lock();
        if Self::outstanding(&guard) == 0 {
            return;
        }
        let epoch = guard.flush_epoch;
        while guard.flush_epoch == epoch && Self::outstanding(&guard) > 0 {
            guard = self
                .ready
                .wait(guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

/// Pool wrapper that pushes reclamation onto a background worker.
///
/// Deallocations are enqueued and the call returns immediately; the worker
/// batches them, synchronizes once per distinct device, and inserts the
/// ranges into the base pool's free list. `allocate` applies backpressure
/// when too many returns are outstanding.
pub struct DeferredDeallocPool<U: MemoryResource + 'static, F: FreeList + 'static = BestFitFreeList>
{
    pool: Arc<PoolResource<U, F>>,
    shared: Arc<DeferredShared>,
}

impl<U: MemoryResource + 'static> DeferredDeallocPool<U> {
    /// Deferred pool with the default best-fit free list and no-op sync.
    pub fn new(upstream: U, options: PoolOptions) -> PoolResult<Self> {
        Self::with_parts(upstream, options, BestFitFreeList::new(), Arc::new(NullSyncHook))
    }

    /// Deferred pool with the default free list and an explicit sync hook.
    pub fn with_sync_hook(
        upstream: U,
        options: PoolOptions,
        sync_hook: Arc<dyn SyncHook>,
    ) -> PoolResult<Self> {
        Self::with_parts(upstream, options, BestFitFreeList::new(), sync_hook)
    }
}

impl<U: MemoryResource + 'static, F: FreeList + 'static> DeferredDeallocPool<U, F> {
    pub fn with_parts(
        upstream: U,
        options: PoolOptions,
        free_list: F,
        sync_hook: Arc<dyn SyncHook>,
    ) -> PoolResult<Self> {
        let pool = Arc::new(PoolResource::with_parts(
            upstream, options, free_list, sync_hook,
        )?);
        let shared = Arc::new(DeferredShared::new());
        // hook the retry ladder up to the queues: a drain may hold exactly
        // the blocks that would satisfy a failing upstream request
        let flush_shared = Arc::clone(&shared);
        pool.set_flush_hook(Box::new(move || flush_shared.flush()));
        Ok(DeferredDeallocPool { pool, shared })
    }

    /// Allocate with backpressure: when more returns are outstanding than
    /// `max_outstanding_deallocations`, wait for a queue drain first.
    pub fn allocate(&self, bytes: usize, alignment: usize) -> PoolResult<NonNull<u8>> {
        let options = self.pool.options();
        if options.enable_deferred_deallocation
            && self.outstanding_dealloc_count() > options.max_outstanding_deallocations
        {
            self.flush_deferred();
        }
        self.pool.allocate(bytes, alignment)
    }

    /// Queue a return for the background worker.
    ///
    /// `device_id == CURRENT_DEVICE` is resolved against the sync hook now,
    /// not at flush time: the submitting and flushing threads may differ.
    pub fn deferred_deallocate(
        &self,
        ptr: NonNull<u8>,
        bytes: usize,
        alignment: usize,
        device_id: i32,
    ) {
        if bytes == 0 || ptr == dangling_sentinel() {
            return;
        }
        let device_id = if device_id < 0 {
            self.pool.sync_hook().current_device()
        } else {
            device_id
        };
        {
            let mut state = self.shared.lock();
            let idx = state.queue_idx;
            state.queues[idx].push(DeallocParams {
                sync_device: device_id,
                ptr,
                bytes,
                alignment,
            });
            if state.worker.is_none() {
                state.worker = Some(self.spawn_worker());
            }
        }
        self.shared.cv.notify_one();
    }

    /// Synchronous return through the base pool, bypassing the queues.
    pub fn deallocate_no_sync(&self, ptr: NonNull<u8>, bytes: usize, alignment: usize) {
        self.pool.deallocate_no_sync(ptr, bytes, alignment);
    }

    /// Batched synchronous return through the base pool.
    pub fn bulk_deallocate(&self, params: &[DeallocParams]) {
        self.pool.bulk_deallocate(params);
    }

    /// Records queued or taken by the worker but not yet reclaimed.
    pub fn outstanding_dealloc_count(&self) -> usize {
        DeferredShared::outstanding(&self.shared.lock())
    }

    /// Whether both queues are empty and no batch is in flight.
    pub fn no_pending_deallocs(&self) -> bool {
        self.outstanding_dealloc_count() == 0
    }

    /// Wait until at least one queue drain completes. Returns immediately
    /// when nothing is pending.
    pub fn flush_deferred(&self) {
        self.shared.flush();
    }

    /// The wrapped pool resource.
    pub fn base(&self) -> &PoolResource<U, F> {
        &self.pool
    }

    pub fn options(&self) -> &PoolOptions {
        self.pool.options()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn spawn_worker(&self) -> JoinHandle<()> {
        let pool = Arc::clone(&self.pool);
        let shared = Arc::clone(&self.shared);
        std::thread::spawn(move || Self::run_worker(&pool, &shared))
    }

    fn run_worker(pool: &PoolResource<U, F>, shared: &DeferredShared) {
        tracing::debug!("deferred deallocation worker started");
        let mut guard = shared.lock();
        loop {
            guard = shared
                .cv
                .wait_while(guard, |s| !s.stopped && s.queues[s.queue_idx].is_empty())
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if guard.stopped {
                break;
            }
            let idx = guard.queue_idx;
            guard.queue_idx = 1 - idx;
            let batch = mem::take(&mut guard.queues[idx]);
            guard.in_flight = batch.len();
            drop(guard);

            pool.bulk_deallocate(&batch);

            guard = shared.lock();
            guard.in_flight = 0;
            guard.flush_epoch += 1;
            shared.ready.notify_all();
        }
        tracing::debug!("deferred deallocation worker stopped");
    }
}

impl<U: MemoryResource + 'static, F: FreeList + 'static> MemoryResource
    for DeferredDeallocPool<U, F>
{
    fn allocate(&self, bytes: usize, alignment: usize) -> PoolResult<NonNull<u8>> {
        DeferredDeallocPool::allocate(self, bytes, alignment)
    }

    fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, alignment: usize) {
        if self.pool.options().enable_deferred_deallocation {
            self.deferred_deallocate(ptr, bytes, alignment, CURRENT_DEVICE);
        } else {
            self.pool.deallocate(ptr, bytes, alignment);
        }
    }

    fn context(&self) -> MemoryContext {
        self.pool.context()
    }
}

impl<U: MemoryResource + 'static, F: FreeList + 'static> Drop for DeferredDeallocPool<U, F> {
    fn drop(&mut self) {
        let handle = {
            let mut state = self.shared.lock();
            state.stopped = true;
            state.worker.take()
        };
        self.shared.cv.notify_all();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        // drain whatever the worker left behind, synchronously
        let (q0, q1) = {
            let mut state = self.shared.lock();
            (
                mem::take(&mut state.queues[0]),
                mem::take(&mut state.queues[1]),
            )
        };
        self.pool.bulk_deallocate(&q0);
        self.pool.bulk_deallocate(&q1);
    }
}
