//! A process-wide, swappable "current allocator" function slot.
//!
//! Lets call sites that do not want to thread a pool handle through every signature ask for memory
//! with a single free function, [`alloc`], while still letting an application wire that call through
//! to whatever [`MultiDevicePool`](crate::multi_device::MultiDevicePool) or
//! [`SingleDevicePool`](crate::pool::SingleDevicePool) it has constructed. Built on the
//! `once_cell::sync::Lazy<Mutex<...>>` global-state pattern, since the slot has to be initialized
//! lazily with a sensible default and then swapped out under a lock from arbitrary call sites.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use once_cell::sync::Lazy;

use crate::error::Error;
use crate::memory_pointer::MemoryPointer;
use crate::runtime::StreamId;

/// The function a call to [`alloc`] currently forwards to.
pub type AllocatorFn = dyn Fn(usize, StreamId) -> Result<MemoryPointer> + Send + Sync;

static CURRENT: Lazy<Mutex<Arc<AllocatorFn>>> = Lazy::new(|| Mutex::new(Arc::new(unset_allocator)));

fn unset_allocator(_size: usize, _stream: StreamId) -> Result<MemoryPointer> {
    Err(anyhow::Error::from(Error::InvalidArgument(
        "no current allocator has been set; call set_current_allocator first",
    )))
}

/// Install `f` as the process-wide current allocator, replacing whatever was set before.
pub fn set_current_allocator(f: impl Fn(usize, StreamId) -> Result<MemoryPointer> + Send + Sync + 'static) {
    let mut current = CURRENT.lock().expect("current-allocator mutex poisoned");
    *current = Arc::new(f);
}

/// Restore the default state, in which [`alloc`] always fails. Mainly useful for tests that need a
/// clean slate between cases sharing this process-wide slot.
pub fn clear_current_allocator() {
    let mut current = CURRENT.lock().expect("current-allocator mutex poisoned");
    *current = Arc::new(unset_allocator);
}

/// Allocate `size` bytes tagged with `stream` through whichever allocator is currently installed.
pub fn alloc(size: usize, stream: StreamId) -> Result<MemoryPointer> {
    let current = CURRENT.lock().expect("current-allocator mutex poisoned").clone();
    current(size, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_allocator_fails() {
        clear_current_allocator();
        assert!(alloc(128, StreamId::DEFAULT).is_err());
    }
}
