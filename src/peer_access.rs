//! Process-wide cache of checked peer-access pairs.
//!
//! Asking the runtime to enable peer access is a real device-to-device negotiation and not free to
//! repeat, so the result of a successful check is cached for the lifetime of the process rather than
//! re-checked on every cross-device copy.

use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::Result;
use once_cell::sync::Lazy;

use crate::runtime::{DeviceId, Runtime};

static CHECKED_PAIRS: Lazy<Mutex<HashSet<(DeviceId, DeviceId)>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Ensure `from` can access memory resident on `to`, enabling peer access through `runtime` the
/// first time this exact ordered pair is requested and caching the outcome thereafter.
///
/// Switches the runtime's active device to `from` for the duration of the check and restores
/// whatever was active beforehand on every exit path, including failure.
pub fn ensure_peer_access(runtime: &(dyn Runtime + Send + Sync), from: DeviceId, to: DeviceId) -> Result<()> {
    if from == to {
        return Ok(());
    }

    {
        let checked = CHECKED_PAIRS.lock().map_err(crate::error::Error::from)?;
        if checked.contains(&(from, to)) {
            return Ok(());
        }
    }

    log::debug!("negotiating peer access from device {:?} to device {:?}", from, to);
    let previous = runtime.get_device();
    runtime.set_device(from);
    let result = (|| {
        if runtime.can_access_peer(from, to) {
            runtime.enable_peer_access(to)?;
        } else {
            log::debug!("peer access from {:?} to {:?} unavailable", from, to);
        }
        Ok(())
    })();
    runtime.set_device(previous);
    result?;

    let mut checked = CHECKED_PAIRS.lock().map_err(crate::error::Error::from)?;
    checked.insert((from, to));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::Mutex as StdMutex;

    use crate::runtime::{MemcpyKind, StreamId};

    #[derive(Debug)]
    struct CountingRuntime {
        active: StdMutex<Cell<DeviceId>>,
        enable_calls: StdMutex<Vec<(DeviceId, DeviceId)>>,
    }

    impl CountingRuntime {
        fn new(initial: DeviceId) -> Self {
            Self {
                active: StdMutex::new(Cell::new(initial)),
                enable_calls: StdMutex::new(Vec::new()),
            }
        }
    }

    impl Runtime for CountingRuntime {
        fn malloc(&self, _n: usize) -> Result<u64> {
            unimplemented!()
        }
        fn free(&self, _address: u64) {}
        fn memcpy(&self, _dst: u64, _src: u64, _n: usize, _kind: MemcpyKind) -> Result<()> {
            unimplemented!()
        }
        fn memcpy_async(&self, _dst: u64, _src: u64, _n: usize, _kind: MemcpyKind, _stream: StreamId) -> Result<()> {
            unimplemented!()
        }
        fn memset(&self, _address: u64, _value: u8, _n: usize) -> Result<()> {
            unimplemented!()
        }
        fn memset_async(&self, _address: u64, _value: u8, _n: usize, _stream: StreamId) -> Result<()> {
            unimplemented!()
        }
        fn get_device(&self) -> DeviceId {
            self.active.lock().unwrap().get()
        }
        fn set_device(&self, id: DeviceId) {
            self.active.lock().unwrap().set(id);
        }
        fn can_access_peer(&self, _from: DeviceId, _to: DeviceId) -> bool {
            true
        }
        fn enable_peer_access(&self, peer: DeviceId) -> Result<()> {
            let from = self.get_device();
            self.enable_calls.lock().unwrap().push((from, peer));
            Ok(())
        }
        fn current_stream(&self) -> StreamId {
            StreamId::DEFAULT
        }
    }

    #[test]
    fn same_device_is_a_no_op() {
        let rt = CountingRuntime::new(DeviceId(0));
        ensure_peer_access(&rt, DeviceId(0), DeviceId(0)).unwrap();
        assert!(rt.enable_calls.lock().unwrap().is_empty());
    }

    #[test]
    fn restores_previous_active_device_on_success() {
        let rt = CountingRuntime::new(DeviceId(7));
        ensure_peer_access(&rt, DeviceId(1), DeviceId(2)).unwrap();
        assert_eq!(rt.get_device(), DeviceId(7));
    }
}
