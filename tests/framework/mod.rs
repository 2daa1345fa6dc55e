//! A fake [`Runtime`] backed by an in-process byte buffer, standing in for a real GPU backend in
//! integration tests.

use std::sync::Mutex;

use anyhow::Result;
use devalloc::prelude::*;

/// An in-memory stand-in for a GPU runtime. Device memory is simulated as one growing byte buffer;
/// addresses are offsets into it. Host-side copies dereference real host pointers, since those are
/// genuine process memory.
#[derive(Debug)]
pub struct FakeRuntime {
    memory: Mutex<Vec<u8>>,
    active_device: Mutex<DeviceId>,
    peer_access_calls: Mutex<Vec<(DeviceId, DeviceId)>>,
    oom_budget: Mutex<usize>,
    runtime_error_budget: Mutex<usize>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            // Reserve address 0 so it never collides with the zero-size sentinel address.
            memory: Mutex::new(vec![0u8; 1]),
            active_device: Mutex::new(DeviceId(0)),
            peer_access_calls: Mutex::new(Vec::new()),
            oom_budget: Mutex::new(0),
            runtime_error_budget: Mutex::new(0),
        }
    }

    /// The next `n` calls to `malloc` fail with [`devalloc::Error::OutOfMemory`].
    pub fn force_oom(&self, n: usize) {
        *self.oom_budget.lock().unwrap() = n;
    }

    /// The next `n` calls to `malloc` fail with an opaque, non-out-of-memory
    /// [`devalloc::Error::RuntimeError`].
    pub fn force_runtime_error(&self, n: usize) {
        *self.runtime_error_budget.lock().unwrap() = n;
    }

    pub fn peer_access_call_count(&self, from: DeviceId, to: DeviceId) -> usize {
        self.peer_access_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|&&pair| pair == (from, to))
            .count()
    }
}

impl Runtime for FakeRuntime {
    fn malloc(&self, n: usize) -> Result<u64> {
        let mut budget = self.oom_budget.lock().unwrap();
        if *budget > 0 {
            *budget -= 1;
            return Err(anyhow::Error::from(Error::OutOfMemory));
        }
        drop(budget);

        let mut err_budget = self.runtime_error_budget.lock().unwrap();
        if *err_budget > 0 {
            *err_budget -= 1;
            return Err(anyhow::Error::from(Error::RuntimeError("simulated device fault".into())));
        }
        drop(err_budget);

        let mut mem = self.memory.lock().unwrap();
        let address = mem.len() as u64;
        mem.resize(mem.len() + n, 0);
        Ok(address)
    }

    fn free(&self, _address: u64) {
        // The fake never shrinks its backing buffer; freed ranges are simply abandoned.
    }

    fn memcpy(&self, dst: u64, src: u64, n: usize, kind: MemcpyKind) -> Result<()> {
        match kind {
            MemcpyKind::DeviceToDevice | MemcpyKind::Default => {
                let mut mem = self.memory.lock().unwrap();
                let mut tmp = vec![0u8; n];
                tmp.copy_from_slice(&mem[src as usize..src as usize + n]);
                mem[dst as usize..dst as usize + n].copy_from_slice(&tmp);
            }
            MemcpyKind::HostToDevice => {
                let mut mem = self.memory.lock().unwrap();
                let host = unsafe { std::slice::from_raw_parts(src as *const u8, n) };
                mem[dst as usize..dst as usize + n].copy_from_slice(host);
            }
            MemcpyKind::DeviceToHost => {
                let mem = self.memory.lock().unwrap();
                let host = unsafe { std::slice::from_raw_parts_mut(dst as *mut u8, n) };
                host.copy_from_slice(&mem[src as usize..src as usize + n]);
            }
        }
        Ok(())
    }

    fn memcpy_async(&self, dst: u64, src: u64, n: usize, kind: MemcpyKind, _stream: StreamId) -> Result<()> {
        self.memcpy(dst, src, n, kind)
    }

    fn memset(&self, address: u64, value: u8, n: usize) -> Result<()> {
        let mut mem = self.memory.lock().unwrap();
        mem[address as usize..address as usize + n].fill(value);
        Ok(())
    }

    fn memset_async(&self, address: u64, value: u8, n: usize, _stream: StreamId) -> Result<()> {
        self.memset(address, value, n)
    }

    fn get_device(&self) -> DeviceId {
        *self.active_device.lock().unwrap()
    }

    fn set_device(&self, id: DeviceId) {
        *self.active_device.lock().unwrap() = id;
    }

    fn can_access_peer(&self, _from: DeviceId, _to: DeviceId) -> bool {
        true
    }

    fn enable_peer_access(&self, peer: DeviceId) -> Result<()> {
        let from = self.get_device();
        self.peer_access_calls.lock().unwrap().push((from, peer));
        Ok(())
    }

    fn current_stream(&self) -> StreamId {
        StreamId::DEFAULT
    }
}
