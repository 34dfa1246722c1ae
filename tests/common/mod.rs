//! Common test utilities for pool testing
//!
//! Provides a recording upstream with failure injection and sync hooks that
//! record or gate synchronization, so tests can observe exactly what the
//! pool asked of its collaborators.

// shared across test binaries; not every binary uses every helper
#![allow(dead_code)]

use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use memforge::{MemoryResource, PoolResult, SyncHook, SystemAllocator};

/// One observed upstream allocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamCall {
    pub bytes: usize,
    pub alignment: usize,
    pub succeeded: bool,
}

type FailurePredicate = Box<dyn Fn(usize, usize) -> bool + Send + Sync>;

struct MockUpstreamInner {
    system: SystemAllocator,
    calls: Mutex<Vec<UpstreamCall>>,
    outstanding_bytes: AtomicUsize,
    dealloc_count: AtomicUsize,
    /// Called with (requested bytes, currently outstanding bytes); returning
    /// true makes the attempt fail.
    fail_when: Mutex<Option<FailurePredicate>>,
}

/// Upstream over the system allocator that records every call and can be
/// told to fail on demand.
#[derive(Clone)]
pub struct MockUpstream {
    inner: Arc<MockUpstreamInner>,
}

impl MockUpstream {
    pub fn new() -> Self {
        MockUpstream {
            inner: Arc::new(MockUpstreamInner {
                system: SystemAllocator::new(),
                calls: Mutex::new(Vec::new()),
                outstanding_bytes: AtomicUsize::new(0),
                dealloc_count: AtomicUsize::new(0),
                fail_when: Mutex::new(None),
            }),
        }
    }

    pub fn set_fail_when<P>(&self, predicate: P)
    where
        P: Fn(usize, usize) -> bool + Send + Sync + 'static,
    {
        *self.inner.fail_when.lock().unwrap() = Some(Box::new(predicate));
    }

    pub fn clear_fail_when(&self) {
        *self.inner.fail_when.lock().unwrap() = None;
    }

    pub fn calls(&self) -> Vec<UpstreamCall> {
        self.inner.calls.lock().unwrap().clone()
    }

    pub fn allocation_count(&self) -> usize {
        self.inner.calls.lock().unwrap().len()
    }

    pub fn successful_allocation_count(&self) -> usize {
        self.inner
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.succeeded)
            .count()
    }

    pub fn failed_allocation_count(&self) -> usize {
        self.allocation_count() - self.successful_allocation_count()
    }

    pub fn dealloc_count(&self) -> usize {
        self.inner.dealloc_count.load(Ordering::Relaxed)
    }

    /// Net bytes currently held by callers of this upstream.
    pub fn outstanding_bytes(&self) -> usize {
        self.inner.outstanding_bytes.load(Ordering::Relaxed)
    }
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryResource for MockUpstream {
    fn allocate(&self, bytes: usize, alignment: usize) -> PoolResult<NonNull<u8>> {
        let outstanding = self.outstanding_bytes();
        let should_fail = self
            .inner
            .fail_when
            .lock()
            .unwrap()
            .as_ref()
            .map(|pred| pred(bytes, outstanding))
            .unwrap_or(false);

        let result = if should_fail {
            Err(memforge::PoolError::OutOfMemory { bytes, alignment })
        } else {
            self.inner.system.allocate(bytes, alignment)
        };
        self.inner.calls.lock().unwrap().push(UpstreamCall {
            bytes,
            alignment,
            succeeded: result.is_ok(),
        });
        if result.is_ok() {
            self.inner
                .outstanding_bytes
                .fetch_add(bytes, Ordering::Relaxed);
        }
        result
    }

    fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, alignment: usize) {
        self.inner
            .outstanding_bytes
            .fetch_sub(bytes, Ordering::Relaxed);
        self.inner.dealloc_count.fetch_add(1, Ordering::Relaxed);
        self.inner.system.deallocate(ptr, bytes, alignment);
    }
}

/// Sync hook that records every wait it is asked to perform.
#[derive(Debug, Default)]
pub struct RecordingSyncHook {
    current: AtomicI32,
    device_syncs: Mutex<Vec<i32>>,
    system_syncs: AtomicUsize,
}

impl RecordingSyncHook {
    pub fn new() -> Self {
        RecordingSyncHook::default()
    }

    pub fn set_current_device(&self, device_id: i32) {
        self.current.store(device_id, Ordering::Relaxed);
    }

    pub fn device_syncs(&self) -> Vec<i32> {
        self.device_syncs.lock().unwrap().clone()
    }

    pub fn system_sync_count(&self) -> usize {
        self.system_syncs.load(Ordering::Relaxed)
    }
}

impl SyncHook for RecordingSyncHook {
    fn current_device(&self) -> i32 {
        self.current.load(Ordering::Relaxed)
    }

    fn sync_device(&self, device_id: i32) {
        self.device_syncs.lock().unwrap().push(device_id);
    }

    fn sync_all_devices(&self) {
        self.system_syncs.fetch_add(1, Ordering::Relaxed);
    }
}

/// Sync hook whose waits block until the test releases them. Lets a test
/// pin the worker inside a batch while it stages the next one.
#[derive(Default)]
pub struct GatedSyncHook {
    state: Mutex<GateState>,
    cond: Condvar,
    device_syncs: Mutex<Vec<i32>>,
}

#[derive(Default)]
struct GateState {
    open: bool,
    waiting: usize,
}

impl GatedSyncHook {
    pub fn new() -> Self {
        GatedSyncHook::default()
    }

    /// Block the calling test until some sync wait has parked on the gate.
    pub fn wait_until_blocked(&self) {
        let mut state = self.state.lock().unwrap();
        while state.waiting == 0 {
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Open the gate, releasing current and future waits.
    pub fn open(&self) {
        let mut state = self.state.lock().unwrap();
        state.open = true;
        self.cond.notify_all();
    }

    pub fn device_syncs(&self) -> Vec<i32> {
        self.device_syncs.lock().unwrap().clone()
    }

    fn park(&self) {
        let mut state = self.state.lock().unwrap();
        state.waiting += 1;
        self.cond.notify_all();
        while !state.open {
            state = self.cond.wait(state).unwrap();
        }
        state.waiting -= 1;
    }
}

impl SyncHook for GatedSyncHook {
    fn current_device(&self) -> i32 {
        0
    }

    fn sync_device(&self, device_id: i32) {
        self.device_syncs.lock().unwrap().push(device_id);
        self.park();
    }

    fn sync_all_devices(&self) {
        self.park();
    }
}
