//! Pool configuration
//!
//! Options are immutable after pool construction. Two presets cover the
//! common cases: `host()` for pools front-ending the system allocator and
//! `device()` for pools front-ending a device-memory driver, where freed
//! ranges must wait for in-flight work and reclamation is pushed onto a
//! background worker.

use crate::error::{PoolError, PoolResult};
use crate::sync::SyncScope;

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

/// Configuration for a pool resource.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Minimum size of blocks requested from upstream.
    pub min_block_size: usize,
    /// Cap on the growth series. Oversized user requests still go through
    /// and are honored exactly.
    pub max_block_size: usize,
    /// Geometric growth multiplier between successive upstream requests.
    pub growth_factor: f32,
    /// Retry with halved block sizes when upstream fails.
    pub try_smaller_on_failure: bool,
    /// Return completely free blocks to upstream when an allocation from
    /// upstream failed, then retry once. Ignored when
    /// `try_smaller_on_failure` is off.
    pub return_to_upstream_on_failure: bool,
    /// To what extent `deallocate` synchronizes before memory is reusable.
    pub sync: SyncScope,
    /// Route deallocations through the background worker.
    pub enable_deferred_deallocation: bool,
    /// Outstanding deferred deallocations above which `allocate` first
    /// waits for a queue drain.
    pub max_outstanding_deallocations: usize,
    /// Alignment floor applied to every upstream request.
    pub upstream_alignment: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions::host()
    }
}

impl PoolOptions {
    /// Preset for pools over the system allocator.
    pub fn host() -> Self {
        PoolOptions {
            min_block_size: 4 * KIB,
            max_block_size: 256 * MIB,
            growth_factor: 2.0,
            try_smaller_on_failure: true,
            return_to_upstream_on_failure: true,
            sync: SyncScope::None,
            enable_deferred_deallocation: false,
            max_outstanding_deallocations: 16,
            upstream_alignment: 256,
        }
    }

    /// Preset for pools over a device-memory driver.
    pub fn device() -> Self {
        PoolOptions {
            min_block_size: MIB,
            max_block_size: 1 << 32,
            growth_factor: 2.0,
            try_smaller_on_failure: true,
            return_to_upstream_on_failure: true,
            sync: SyncScope::Device,
            enable_deferred_deallocation: true,
            max_outstanding_deallocations: 16,
            upstream_alignment: 256,
        }
    }

    pub fn with_min_block_size(mut self, bytes: usize) -> Self {
        self.min_block_size = bytes;
        self
    }

    pub fn with_max_block_size(mut self, bytes: usize) -> Self {
        self.max_block_size = bytes;
        self
    }

    pub fn with_growth_factor(mut self, factor: f32) -> Self {
        self.growth_factor = factor;
        self
    }

    pub fn with_try_smaller_on_failure(mut self, enabled: bool) -> Self {
        self.try_smaller_on_failure = enabled;
        self
    }

    pub fn with_return_to_upstream_on_failure(mut self, enabled: bool) -> Self {
        self.return_to_upstream_on_failure = enabled;
        self
    }

    pub fn with_sync(mut self, scope: SyncScope) -> Self {
        self.sync = scope;
        self
    }

    pub fn with_deferred_deallocation(mut self, enabled: bool) -> Self {
        self.enable_deferred_deallocation = enabled;
        self
    }

    pub fn with_max_outstanding_deallocations(mut self, count: usize) -> Self {
        self.max_outstanding_deallocations = count;
        self
    }

    pub fn with_upstream_alignment(mut self, alignment: usize) -> Self {
        self.upstream_alignment = alignment;
        self
    }

    pub fn validate(&self) -> PoolResult<()> {
        if self.min_block_size == 0 {
            return Err(PoolError::InvalidConfiguration(
                "min_block_size cannot be zero".to_string(),
            ));
        }
        if self.max_block_size < self.min_block_size {
            return Err(PoolError::InvalidConfiguration(format!(
                "max_block_size ({}) is below min_block_size ({})",
                self.max_block_size, self.min_block_size
            )));
        }
        if !(self.growth_factor >= 1.0) {
            return Err(PoolError::InvalidConfiguration(format!(
                "growth_factor must be >= 1, got {}",
                self.growth_factor
            )));
        }
        if !self.upstream_alignment.is_power_of_two() {
            return Err(PoolError::InvalidConfiguration(format!(
                "upstream_alignment must be a power of two, got {}",
                self.upstream_alignment
            )));
        }
        Ok(())
    }
}
