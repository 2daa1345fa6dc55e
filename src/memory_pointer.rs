//! The allocator's public return type: a value carrying an owning allocation handle plus an
//! absolute offset into it, together with pointer arithmetic and the copy/memset contract clients
//! actually use.
//!
//! A small `Copy`-ish value type that carries an address and an offset into a parent allocation,
//! and forwards reads/writes through that parent without owning it directly.

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;

use crate::error::Error;
use crate::peer_access;
use crate::runtime::{DeviceId, MemcpyKind, Runtime, StreamId};

/// Anything a [`MemoryPointer`] can be rooted in: a [`crate::raw_allocation::RawAllocation`] on the
/// unpooled path, or a [`crate::pool::PooledMemory`] on the cached path.
pub trait MemoryOwner: Debug + Send + Sync {
    /// The device address this owner's region begins at. Zero only for a zero-size owner.
    fn base_address(&self) -> u64;
    /// The device this owner's memory lives on.
    fn device_id(&self) -> DeviceId;
    /// The runtime collaborator to forward copy/memset/peer-access calls to.
    fn runtime(&self) -> &Arc<dyn Runtime + Send + Sync>;
}

/// A host-side buffer used as the source or destination of a host↔device copy.
#[derive(Debug, Copy, Clone)]
pub struct HostBuffer {
    ptr: *mut u8,
    len: usize,
}

impl HostBuffer {
    /// Wrap a mutable host byte slice for use as a copy destination or source.
    pub fn new(slice: &mut [u8]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
        }
    }

    fn address(&self) -> u64 {
        self.ptr as u64
    }
}

// SAFETY: the pointer is only ever dereferenced by the runtime collaborator during a copy the
// caller explicitly issued; we do not read or write through it ourselves.
unsafe impl Send for HostBuffer {}

/// Polymorphic copy source for [`MemoryPointer::copy_from`] / [`MemoryPointer::copy_from_async`]:
/// either another device pointer, or a host buffer.
#[derive(Debug)]
pub enum CopySource<'a> {
    Device(&'a MemoryPointer),
    Host(HostBuffer),
}

/// A pointer into device memory: an owning allocation handle plus an absolute byte offset into it.
///
/// Cloning a `MemoryPointer` is cheap (it clones the `Arc` to the owner) and produces another
/// pointer into the exact same region; arithmetic produces a new pointer into the same owner at a
/// different offset.
#[derive(Clone)]
pub struct MemoryPointer {
    owner: Arc<dyn MemoryOwner>,
    offset: u64,
}

impl Debug for MemoryPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPointer")
            .field("device", &self.device_id())
            .field("address", &format_args!("0x{:x}", self.address()))
            .finish()
    }
}

impl MemoryPointer {
    /// Construct a pointer at `offset` bytes into `owner`.
    /// # Errors
    /// Fails if `offset != 0` while `owner.base_address() == 0` (a zero-size owner has no valid
    /// non-zero offsets).
    pub fn new(owner: Arc<dyn MemoryOwner>, offset: u64) -> Result<Self> {
        if owner.base_address() == 0 && offset != 0 {
            return Err(anyhow::Error::from(Error::InvalidArgument(
                "offset into a zero-size allocation must be zero",
            )));
        }
        Ok(Self { owner, offset })
    }

    /// The absolute device address this pointer refers to.
    pub fn address(&self) -> u64 {
        self.owner.base_address() + self.offset
    }

    /// The device this pointer's memory lives on.
    pub fn device_id(&self) -> DeviceId {
        self.owner.device_id()
    }

    fn runtime(&self) -> &Arc<dyn Runtime + Send + Sync> {
        self.owner.runtime()
    }

    /// Returns a new pointer offset forward by `n` bytes, into the same owner.
    pub fn add(&self, n: u64) -> MemoryPointer {
        MemoryPointer {
            owner: self.owner.clone(),
            offset: self.offset + n,
        }
    }

    /// Returns a new pointer offset backward by `n` bytes, into the same owner.
    /// # Errors
    /// Fails if `n` is larger than the current offset.
    pub fn sub(&self, n: u64) -> Result<MemoryPointer> {
        let offset = self.offset.checked_sub(n).ok_or_else(|| {
            anyhow::Error::from(Error::InvalidArgument("pointer arithmetic underflowed offset"))
        })?;
        Ok(MemoryPointer {
            owner: self.owner.clone(),
            offset,
        })
    }

    /// Offset this pointer forward by `n` bytes in place.
    pub fn add_assign(&mut self, n: u64) {
        self.offset += n;
    }

    /// Offset this pointer backward by `n` bytes in place.
    /// # Errors
    /// Fails if `n` is larger than the current offset.
    pub fn sub_assign(&mut self, n: u64) -> Result<()> {
        self.offset = self.offset.checked_sub(n).ok_or_else(|| {
            anyhow::Error::from(Error::InvalidArgument("pointer arithmetic underflowed offset"))
        })?;
        Ok(())
    }

    /// Copy `n` bytes from `src` (on any device) into `self`, enabling peer access first if `src`
    /// lives on a different device. A no-op if `n == 0`.
    pub fn copy_from_device(&self, src: &MemoryPointer, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        if src.device_id() != self.device_id() {
            peer_access::ensure_peer_access(self.runtime().as_ref(), self.device_id(), src.device_id())?;
        }
        self.runtime()
            .memcpy(self.address(), src.address(), n, MemcpyKind::DeviceToDevice)
    }

    /// Asynchronous variant of [`Self::copy_from_device`], enqueued on `stream` (the calling
    /// context's current stream if `None`).
    pub fn copy_from_device_async(
        &self,
        src: &MemoryPointer,
        n: usize,
        stream: Option<StreamId>,
    ) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        if src.device_id() != self.device_id() {
            peer_access::ensure_peer_access(self.runtime().as_ref(), self.device_id(), src.device_id())?;
        }
        let stream = stream.unwrap_or_else(|| self.runtime().current_stream());
        self.runtime()
            .memcpy_async(self.address(), src.address(), n, MemcpyKind::DeviceToDevice, stream)
    }

    /// Copy a host byte slice into this device pointer. A no-op if `src` is empty.
    pub fn copy_from_host(&self, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        self.runtime()
            .memcpy(self.address(), src.as_ptr() as u64, src.len(), MemcpyKind::HostToDevice)
    }

    /// Copy this device pointer's memory into a host byte slice. A no-op if `dst` is empty.
    pub fn copy_to_host(&self, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        self.runtime()
            .memcpy(dst.as_mut_ptr() as u64, self.address(), dst.len(), MemcpyKind::DeviceToHost)
    }

    /// Asynchronous variant of [`Self::copy_from_host`].
    /// # Safety contract
    /// `src` must be backed by pinned host memory for correctness; this is not verified here, the
    /// same as the underlying runtime does not verify it.
    pub fn copy_from_host_async(&self, src: &[u8], stream: Option<StreamId>) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        let stream = stream.unwrap_or_else(|| self.runtime().current_stream());
        self.runtime().memcpy_async(
            self.address(),
            src.as_ptr() as u64,
            src.len(),
            MemcpyKind::HostToDevice,
            stream,
        )
    }

    /// Asynchronous variant of [`Self::copy_to_host`].
    /// # Safety contract
    /// `dst` must be backed by pinned host memory for correctness; this is not verified here.
    pub fn copy_to_host_async(&self, dst: &mut [u8], stream: Option<StreamId>) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let stream = stream.unwrap_or_else(|| self.runtime().current_stream());
        self.runtime().memcpy_async(
            dst.as_mut_ptr() as u64,
            self.address(),
            dst.len(),
            MemcpyKind::DeviceToHost,
            stream,
        )
    }

    /// Polymorphic copy: dispatches to [`Self::copy_from_device`] or [`Self::copy_from_host`]
    /// depending on `src`.
    pub fn copy_from(&self, src: CopySource, n: usize) -> Result<()> {
        match src {
            CopySource::Device(ptr) => self.copy_from_device(ptr, n),
            CopySource::Host(buf) => {
                if n == 0 {
                    return Ok(());
                }
                self.runtime()
                    .memcpy(self.address(), buf.address(), n, MemcpyKind::HostToDevice)
            }
        }
    }

    /// Asynchronous variant of [`Self::copy_from`].
    pub fn copy_from_async(&self, src: CopySource, n: usize, stream: Option<StreamId>) -> Result<()> {
        let stream = stream.unwrap_or_else(|| self.runtime().current_stream());
        match src {
            CopySource::Device(ptr) => self.copy_from_device_async(ptr, n, Some(stream)),
            CopySource::Host(buf) => {
                if n == 0 {
                    return Ok(());
                }
                self.runtime()
                    .memcpy_async(self.address(), buf.address(), n, MemcpyKind::HostToDevice, stream)
            }
        }
    }

    /// Fill `n` bytes starting at this pointer with `value`. A no-op if `n == 0`.
    pub fn memset(&self, value: u8, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        self.runtime().memset(self.address(), value, n)
    }

    /// Asynchronous variant of [`Self::memset`], enqueued on `stream` (the calling context's
    /// current stream if `None`).
    pub fn memset_async(&self, value: u8, n: usize, stream: Option<StreamId>) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let stream = stream.unwrap_or_else(|| self.runtime().current_stream());
        self.runtime().memset_async(self.address(), value, n, stream)
    }
}
