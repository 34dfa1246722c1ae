//! Memory-resource capability shared by the pool and its upstream
//!
//! A `MemoryResource` hands out aligned byte ranges identified by raw
//! pointers. The pool consumes one as its upstream (an OS allocator, a
//! device-memory driver) and exposes the same capability to its own
//! consumers, so pools can be stacked.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::{PoolError, PoolResult};

/// Execution context associated with a memory resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryContext {
    /// Device the memory belongs to, `None` for host memory.
    pub device_id: Option<i32>,
}

/// Sentinel pointer returned for zero-byte allocations.
///
/// Deallocating the sentinel is a no-op on every path.
#[inline]
pub fn dangling_sentinel() -> NonNull<u8> {
    NonNull::dangling()
}

/// Capability to allocate and release aligned byte ranges.
///
/// Implementations never hand out overlapping ranges and accept back only
/// ranges they previously handed out, with the same `(ptr, bytes)`.
pub trait MemoryResource: Send + Sync {
    /// Allocate `bytes` bytes aligned to at least `alignment`.
    ///
    /// A zero-byte request returns the dangling sentinel without touching
    /// the backing resource.
    fn allocate(&self, bytes: usize, alignment: usize) -> PoolResult<NonNull<u8>>;

    /// Return a range obtained from `allocate`.
    ///
    /// Must be called with the same `(ptr, bytes)` the allocation returned.
    /// `alignment` is informational; passing a value that differs from the
    /// original allocation is undefined. Zero bytes or the sentinel pointer
    /// are ignored.
    fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, alignment: usize);

    /// Context of the memory this resource provides.
    fn context(&self) -> MemoryContext {
        MemoryContext::default()
    }
}

impl<T: MemoryResource + ?Sized> MemoryResource for std::sync::Arc<T> {
    fn allocate(&self, bytes: usize, alignment: usize) -> PoolResult<NonNull<u8>> {
        (**self).allocate(bytes, alignment)
    }

    fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, alignment: usize) {
        (**self).deallocate(ptr, bytes, alignment)
    }

    fn context(&self) -> MemoryContext {
        (**self).context()
    }
}

/// Host upstream backed by the system allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAllocator;

impl SystemAllocator {
    pub fn new() -> Self {
        SystemAllocator
    }
}

impl MemoryResource for SystemAllocator {
    fn allocate(&self, bytes: usize, alignment: usize) -> PoolResult<NonNull<u8>> {
        if bytes == 0 {
            return Ok(dangling_sentinel());
        }
        let layout = Layout::from_size_align(bytes, alignment)
            .map_err(|_| PoolError::InvalidAlignment(alignment))?;
        // SAFETY: layout has a non-zero size, checked above.
        let ptr = unsafe { alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(PoolError::OutOfMemory { bytes, alignment })
    }

    fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, alignment: usize) {
        if bytes == 0 || ptr == dangling_sentinel() {
            return;
        }
        let layout = match Layout::from_size_align(bytes, alignment) {
            Ok(layout) => layout,
            Err(_) => return,
        };
        // SAFETY: `ptr` was returned by `alloc` with this exact layout; the
        // caller contract forbids double-free and size mismatch.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_allocator_roundtrip() {
        let alloc = SystemAllocator::new();
        let ptr = alloc.allocate(1024, 64).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 64, 0);
        alloc.deallocate(ptr, 1024, 64);
    }

    #[test]
    fn test_zero_bytes_returns_sentinel() {
        let alloc = SystemAllocator::new();
        let ptr = alloc.allocate(0, 8).unwrap();
        assert_eq!(ptr, dangling_sentinel());
        // releasing the sentinel must be a no-op
        alloc.deallocate(ptr, 0, 8);
    }

    #[test]
    fn test_invalid_alignment_rejected() {
        let alloc = SystemAllocator::new();
        let result = alloc.allocate(64, 100);
        assert!(matches!(result, Err(PoolError::InvalidAlignment(100))));
    }

    #[test]
    fn test_host_context() {
        let alloc = SystemAllocator::new();
        assert_eq!(alloc.context().device_id, None);
    }
}
