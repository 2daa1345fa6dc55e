//! Re-exports most commonly used types in the library

pub use traits::*;

pub use crate::arena::{round_up, Arena, ChunkRef};
pub use crate::chunk::Chunk;
pub use crate::current_allocator::{alloc, clear_current_allocator, set_current_allocator};
pub use crate::error::Error;
pub use crate::memory_pointer::{CopySource, HostBuffer, MemoryOwner, MemoryPointer};
pub use crate::multi_device::MultiDevicePool;
pub use crate::pool::{PoolConfig, PooledMemory, SingleDevicePool};
pub use crate::raw_allocation::RawAllocation;
pub use crate::runtime::{DeviceId, MemcpyKind, Runtime, StreamId};

/// Re-exports all important traits of the library
pub mod traits {
    pub use crate::memory_pointer::MemoryOwner;
    pub use crate::runtime::Runtime;
}
