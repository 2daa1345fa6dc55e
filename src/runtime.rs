//! The GPU runtime collaborator.
//!
//! Everything in this module is deliberately thin: device selection, raw `malloc`/`free`, memcpy,
//! memset, peer access and stream/event objects are the runtime's job, not this crate's. A caching
//! pool only needs the small surface described by the [`Runtime`] trait below; production code plugs
//! in a real backend (a CUDA/HIP/Level Zero binding, for instance), and tests plug in an in-memory
//! fake (see `tests/framework`).

use std::fmt::Debug;

use anyhow::Result;

use crate::error::Error;

/// Identifies a physical device known to the runtime.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DeviceId(pub u32);

/// Identifies an execution stream (an ordered timeline of device work) on a device.
///
/// This is a plain value wrapping the runtime's opaque stream handle. See the design notes on
/// stream identity: a runtime whose stream handles are not guaranteed unique should instead key
/// arenas on the identity of a reference-counted stream object.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct StreamId(pub u64);

impl StreamId {
    /// The stream every device implicitly executes on when no other stream has been selected.
    pub const DEFAULT: StreamId = StreamId(0);
}

/// Direction of a memory copy, mirroring `cudaMemcpyKind`-style runtimes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MemcpyKind {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
    /// Let the runtime infer the direction from the pointers involved.
    Default,
}

/// Minimal surface a GPU runtime must expose for [`crate::pool::SingleDevicePool`] to cache
/// allocations on top of it.
///
/// All methods are synchronous with the host except the `*_async` variants, which enqueue work on
/// the given stream and return immediately. Implementors must report an out-of-memory condition
/// from `malloc` as [`Error::OutOfMemory`]; every other failure should be wrapped in
/// [`Error::RuntimeError`] and propagates unchanged.
pub trait Runtime: Debug {
    /// Synchronously allocate `n` bytes on the currently active device. `n` is never zero; callers
    /// handle the zero-size case before reaching the runtime.
    fn malloc(&self, n: usize) -> Result<u64>;

    /// Synchronously free a raw allocation previously returned by `malloc` on the currently active
    /// device.
    fn free(&self, address: u64);

    /// Synchronous memory copy. `n` is never zero; callers skip issuing copies of zero length.
    fn memcpy(&self, dst: u64, src: u64, n: usize, kind: MemcpyKind) -> Result<()>;

    /// Asynchronous memory copy enqueued on `stream`.
    fn memcpy_async(&self, dst: u64, src: u64, n: usize, kind: MemcpyKind, stream: StreamId) -> Result<()>;

    /// Synchronous byte fill.
    fn memset(&self, address: u64, value: u8, n: usize) -> Result<()>;

    /// Asynchronous byte fill enqueued on `stream`.
    fn memset_async(&self, address: u64, value: u8, n: usize, stream: StreamId) -> Result<()>;

    /// The currently active device for the calling context.
    fn get_device(&self) -> DeviceId;

    /// Switch the currently active device for the calling context.
    fn set_device(&self, id: DeviceId);

    /// Whether `from` can directly access memory resident on `to` (peer access).
    fn can_access_peer(&self, from: DeviceId, to: DeviceId) -> bool;

    /// Enable peer access from the currently active device to `peer`. Idempotent on the runtime,
    /// but costly, which is why [`crate::peer_access`] caches the outcome.
    fn enable_peer_access(&self, peer: DeviceId) -> Result<()>;

    /// The stream that is "current" for the calling context, used as the default stream argument
    /// for async operations and as the stream tag for `malloc` when none is given explicitly.
    fn current_stream(&self) -> StreamId;
}

pub(crate) fn runtime_error(msg: impl Into<String>) -> anyhow::Error {
    anyhow::Error::from(Error::RuntimeError(msg.into()))
}
