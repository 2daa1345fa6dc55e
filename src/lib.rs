//! A caching device-memory allocator for GPU runtimes.
//!
//! `devalloc` sits between application code and a GPU runtime's raw `malloc`/`free`, caching freed
//! blocks instead of returning them to the runtime immediately. Repeated alloc/free cycles of
//! similar sizes - the common case in iterative GPU workloads - are served from a pool of
//! already-allocated memory instead of round-tripping through the runtime's (typically synchronizing
//! and expensive) allocator on every call.
//!
//! To get started, construct a [`runtime::Runtime`] implementation for your backend and hand it to a
//! [`pool::SingleDevicePool`]:
//! ```
//! use devalloc::prelude::*;
//! use std::sync::Arc;
//!
//! # fn example(runtime: Arc<dyn Runtime + Send + Sync>) -> anyhow::Result<()> {
//! let pool = SingleDevicePool::new(runtime, DeviceId(0), PoolConfig::default());
//! let ptr = pool.malloc(4096, StreamId::DEFAULT)?;
//! ptr.memset(0, 4096)?;
//! # Ok(())
//! # }
//! ```
//! Applications that run across several devices can use [`multi_device::MultiDevicePool`] instead,
//! which lazily constructs one [`pool::SingleDevicePool`] per device on first use.
//!
//! For further reading, check out the following modules:
//! - [`runtime`] for the collaborator trait this crate expects a backend to provide.
//! - [`pool`] for the single-device caching allocator itself.
//! - [`multi_device`] for the per-device facade.
//! - [`memory_pointer`] for the value type every allocation is handed back as.
//! - [`current_allocator`] for the process-wide swappable allocator slot.
//! - [`error`] for the error type returned across this crate's public API.

pub mod prelude;
pub use crate::prelude::*;

pub mod arena;
pub mod chunk;
pub mod current_allocator;
pub mod error;
pub mod memory_pointer;
pub mod multi_device;
pub mod peer_access;
pub mod pool;
pub mod raw_allocation;
pub mod runtime;
