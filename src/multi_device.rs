//! A thin facade dispatching to one [`SingleDevicePool`] per device, constructed lazily the first
//! time a given device is requested, rather than eagerly up front for devices that might never be
//! touched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::error::Error;
use crate::memory_pointer::MemoryPointer;
use crate::pool::{PoolConfig, SingleDevicePool};
use crate::runtime::{DeviceId, Runtime, StreamId};

/// Owns one [`SingleDevicePool`] per device seen so far, all sharing a single `config` and
/// `runtime` collaborator.
pub struct MultiDevicePool {
    runtime: Arc<dyn Runtime + Send + Sync>,
    config: PoolConfig,
    pools: Mutex<HashMap<DeviceId, SingleDevicePool>>,
}

impl MultiDevicePool {
    pub fn new(runtime: Arc<dyn Runtime + Send + Sync>, config: PoolConfig) -> Self {
        Self {
            runtime,
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn pool_for(&self, device_id: DeviceId) -> Result<SingleDevicePool> {
        let mut pools = self.pools.lock().map_err(Error::from)?;
        if let Some(pool) = pools.get(&device_id) {
            return Ok(pool.clone());
        }
        let pool = SingleDevicePool::new(self.runtime.clone(), device_id, self.config);
        pools.insert(device_id, pool.clone());
        Ok(pool)
    }

    /// Allocate `size` bytes on the device currently active in the runtime's calling context.
    pub fn malloc(&self, size: usize, stream: StreamId) -> Result<MemoryPointer> {
        let device_id = self.runtime.get_device();
        self.malloc_on(device_id, size, stream)
    }

    /// Allocate `size` bytes specifically on `device_id`, regardless of which device is currently
    /// active in the runtime's calling context.
    pub fn malloc_on(&self, device_id: DeviceId, size: usize, stream: StreamId) -> Result<MemoryPointer> {
        self.pool_for(device_id)?.malloc(size, stream)
    }

    /// The pool backing `device_id`, constructing it if this is the first request for that device.
    pub fn pool(&self, device_id: DeviceId) -> Result<SingleDevicePool> {
        self.pool_for(device_id)
    }

    /// Release every fully-free parent allocation across every device pool constructed so far.
    /// Returns the total number of parent allocations released.
    pub fn free_all_blocks(&self) -> usize {
        let pools = self.pools.lock().expect("multi-device pool mutex poisoned");
        pools.values().map(SingleDevicePool::free_all_blocks).sum()
    }

    /// Deprecated alias for [`Self::free_all_blocks`].
    #[deprecated(note = "use free_all_blocks instead")]
    pub fn free_all_free(&self) -> usize {
        self.free_all_blocks()
    }
}
