//! Synchronization hooks gating memory reuse
//!
//! Freed device memory may still be the target of in-flight asynchronous
//! work. Before a range re-enters circulation the pool waits at a
//! configurable scope: not at all, for the device the range belongs to, or
//! for every device in the system. The wait itself is abstracted behind
//! `SyncHook` so host pools pay nothing and tests can observe the calls.

use std::ptr::NonNull;

/// Device id meaning "the device current at submission time".
pub const CURRENT_DEVICE: i32 = -1;

/// Breadth of the wait performed before freed memory becomes reusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncScope {
    /// No synchronization; memory is reusable immediately.
    #[default]
    None,
    /// Wait for the device associated with the range to quiesce.
    Device,
    /// Wait for every device in the system.
    System,
}

/// Capability to wait for in-flight work targeting device memory.
pub trait SyncHook: Send + Sync {
    /// Device considered current on the calling thread.
    fn current_device(&self) -> i32 {
        0
    }

    /// Block until work scheduled on `device_id` has completed.
    fn sync_device(&self, device_id: i32);

    /// Block until every device in the system has quiesced.
    fn sync_all_devices(&self);
}

/// Identity hook for host pools: every wait is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSyncHook;

impl SyncHook for NullSyncHook {
    fn sync_device(&self, _device_id: i32) {}

    fn sync_all_devices(&self) {}
}

/// Perform the wait configured by `scope`.
pub fn synchronize(hook: &dyn SyncHook, scope: SyncScope) {
    match scope {
        SyncScope::None => {}
        SyncScope::Device => hook.sync_device(hook.current_device()),
        SyncScope::System => hook.sync_all_devices(),
    }
}

/// One deferred or batched deallocation.
#[derive(Debug, Clone, Copy)]
pub struct DeallocParams {
    /// Device to synchronize with; `CURRENT_DEVICE` is resolved at
    /// submission time, not at flush time.
    pub sync_device: i32,
    pub ptr: NonNull<u8>,
    pub bytes: usize,
    pub alignment: usize,
}

impl DeallocParams {
    pub fn new(ptr: NonNull<u8>, bytes: usize, alignment: usize) -> Self {
        DeallocParams {
            sync_device: CURRENT_DEVICE,
            ptr,
            bytes,
            alignment,
        }
    }

    pub fn with_device(mut self, device_id: i32) -> Self {
        self.sync_device = device_id;
        self
    }
}

// SAFETY: the record carries an address the pool never dereferences;
// thread safety of the memory itself is governed by the sync scope and the
// caller's lifecycle contract.
unsafe impl Send for DeallocParams {}
unsafe impl Sync for DeallocParams {}

/// Number of device ids the bitmap can deduplicate.
const MAX_TRACKED_DEVICES: i32 = 256;

/// Set of already-synchronized device ids for batched deallocation.
///
/// Small ids are tracked exactly in a 256-bit bitmap. Ids beyond the bitmap
/// degrade to comparing against the previously synchronized device, which
/// still collapses runs of equal ids.
#[derive(Debug, Default)]
pub struct DeviceMask {
    bits: [u32; (MAX_TRACKED_DEVICES as usize) >> 5],
    prev: Option<i32>,
}

impl DeviceMask {
    pub fn new() -> Self {
        DeviceMask::default()
    }

    /// Record `device_id` as synchronized. Returns `true` if the caller
    /// should perform the wait, `false` if it is known to be redundant.
    pub fn insert(&mut self, device_id: i32) -> bool {
        if (0..MAX_TRACKED_DEVICES).contains(&device_id) {
            let bin = (device_id >> 5) as usize;
            let bit = 1u32 << (device_id & 31);
            if self.bits[bin] & bit != 0 {
                return false;
            }
            self.bits[bin] |= bit;
            self.prev = Some(device_id);
            true
        } else if self.prev == Some(device_id) {
            false
        } else {
            self.prev = Some(device_id);
            true
        }
    }
}
