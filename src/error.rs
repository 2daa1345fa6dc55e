//! Exposes the devalloc error type

use std::sync::PoisonError;

use thiserror::Error;

/// Error type that devalloc can return.
#[derive(Error, Debug)]
pub enum Error {
    /// Raised by [`SingleDevicePool::free`](crate::pool::SingleDevicePool::free) when given an address
    /// that is not currently tracked in the in-use map. This is always a caller bug: either a double
    /// free, or an address obtained from a different pool.
    #[error("cannot free out-of-pool memory")]
    InvalidFreeAddress,
    /// The underlying runtime reported it is out of device memory. Callers that see this bubble out of
    /// [`SingleDevicePool::malloc`](crate::pool::SingleDevicePool::malloc) have already exhausted the
    /// two-stage eviction retry of that function.
    #[error("device is out of memory")]
    OutOfMemory,
    /// Construction-site argument validation failed (negative/zero size where disallowed, misaligned
    /// offset, size not a multiple of the allocation unit). Represents programmer error, not a runtime
    /// condition.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// A shared lock (the peer-access cache, or the current-allocator slot) was poisoned by a panicking
    /// holder.
    #[error("poisoned mutex")]
    PoisonError,
    /// An opaque, non-out-of-memory error surfaced verbatim from the [`Runtime`](crate::runtime::Runtime)
    /// collaborator.
    #[error("runtime error: {0}")]
    RuntimeError(String),
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::PoisonError
    }
}

/// Whether `err` is (or wraps) [`Error::OutOfMemory`]. Used by
/// [`SingleDevicePool::malloc`](crate::pool::SingleDevicePool::malloc) to tell a recoverable OOM
/// from the runtime apart from an opaque failure that must propagate unchanged.
pub fn is_out_of_memory(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<Error>(), Some(Error::OutOfMemory))
}
