//! memforge - growing, coalescing memory pool
//!
//! A pool allocator for front-ending a slow or coarse-grained upstream
//! resource such as an OS page allocator or a device-memory driver. Callers
//! obtain and return aligned byte ranges; the pool amortizes upstream cost
//! by requesting geometrically growing blocks, subdividing them, and
//! recycling freed ranges through a coalescing free list.
//!
//! For device memory, where releasing a range requires waiting for in-flight
//! asynchronous work, [`DeferredDeallocPool`] pushes reclamation onto a
//! background worker and batches the synchronization.
//!
//! # Example
//!
//! ```rust
//! use memforge::{PoolOptions, PoolResource, SystemAllocator};
//!
//! let pool = PoolResource::new(SystemAllocator::new(), PoolOptions::host())?;
//! let ptr = pool.allocate(1024, 64)?;
//! // ... use the memory ...
//! pool.deallocate(ptr, 1024, 64);
//! # Ok::<(), memforge::PoolError>(())
//! ```

pub mod deferred;
pub mod error;
pub mod free_list;
pub mod logging;
pub mod options;
pub mod pool;
pub mod resource;
pub mod sync;

pub use deferred::DeferredDeallocPool;
pub use error::{PoolError, PoolResult};
pub use free_list::{BestFitFreeList, FreeList};
pub use options::PoolOptions;
pub use pool::{PoolResource, PoolStats};
pub use resource::{dangling_sentinel, MemoryContext, MemoryResource, SystemAllocator};
pub use sync::{
    synchronize, DeallocParams, DeviceMask, NullSyncHook, SyncHook, SyncScope, CURRENT_DEVICE,
};
