//! A thin handle type that owns exactly one physical device allocation.
//!
//! This is the base of the allocator's ownership hierarchy: a [`RawAllocation`] is acquired via a
//! single call to [`Runtime::malloc`] and released via exactly one matching [`Runtime::free`] on
//! [`Drop`], so a leaked reference can never leak the underlying device memory along with it.

use std::sync::Arc;

use crate::memory_pointer::MemoryOwner;
use crate::runtime::{DeviceId, Runtime};

/// Owns one physical device allocation. Exclusively owned by a [`crate::chunk::Chunk`] on the
/// pooled path, or directly by a [`crate::memory_pointer::MemoryPointer`] on the unpooled path.
#[derive(Debug)]
pub struct RawAllocation {
    runtime: Arc<dyn Runtime + Send + Sync>,
    device_id: DeviceId,
    base_address: u64,
    size_bytes: usize,
}

impl RawAllocation {
    /// Allocate `size_bytes` on `device_id` through `runtime`. If `size_bytes` is zero, no runtime
    /// call is made and `base_address` is `0`, per the invariant in the data model.
    pub fn new(
        runtime: Arc<dyn Runtime + Send + Sync>,
        device_id: DeviceId,
        size_bytes: usize,
    ) -> anyhow::Result<Self> {
        let base_address = if size_bytes == 0 {
            0
        } else {
            runtime.malloc(size_bytes)?
        };
        Ok(Self {
            runtime,
            device_id,
            base_address,
            size_bytes,
        })
    }

    /// Wrap an already-acquired raw device allocation. Used when a caller obtained the address
    /// through some other path (for example, a zero-size pointer construction) and wants it tracked
    /// as a `RawAllocation` regardless.
    pub(crate) fn from_raw_parts(
        runtime: Arc<dyn Runtime + Send + Sync>,
        device_id: DeviceId,
        base_address: u64,
        size_bytes: usize,
    ) -> Self {
        Self {
            runtime,
            device_id,
            base_address,
            size_bytes,
        }
    }

    /// The device this allocation lives on.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// The base device address of this allocation. Zero if and only if this is a zero-size
    /// allocation.
    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    /// The size, in bytes, of this allocation.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }
}

impl MemoryOwner for RawAllocation {
    fn base_address(&self) -> u64 {
        self.base_address
    }

    fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn runtime(&self) -> &Arc<dyn Runtime + Send + Sync> {
        &self.runtime
    }
}

impl Drop for RawAllocation {
    fn drop(&mut self) {
        if self.size_bytes != 0 {
            #[cfg(feature = "log-objects")]
            log::trace!(
                "freeing raw allocation 0x{:x} ({} bytes) on device {:?}",
                self.base_address,
                self.size_bytes,
                self.device_id
            );
            self.runtime.free(self.base_address);
        }
    }
}
