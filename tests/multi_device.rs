use std::sync::Arc;

use devalloc::prelude::*;

mod framework;
use framework::FakeRuntime;

#[test]
fn malloc_on_dispatches_to_a_distinct_pool_per_device() {
    let runtime = Arc::new(FakeRuntime::new());
    let multi = MultiDevicePool::new(runtime, PoolConfig::default());

    let a = multi.malloc_on(DeviceId(0), 1024, StreamId::DEFAULT).unwrap();
    let b = multi.malloc_on(DeviceId(1), 1024, StreamId::DEFAULT).unwrap();

    assert_eq!(a.device_id(), DeviceId(0));
    assert_eq!(b.device_id(), DeviceId(1));
}

#[test]
fn the_same_device_is_served_by_the_same_pool_across_calls() {
    let runtime = Arc::new(FakeRuntime::new());
    let multi = MultiDevicePool::new(runtime, PoolConfig::default());

    let first = multi.malloc_on(DeviceId(0), 1024, StreamId::DEFAULT).unwrap();
    let address = first.address();
    drop(first);

    let second = multi.malloc_on(DeviceId(0), 1024, StreamId::DEFAULT).unwrap();
    assert_eq!(second.address(), address, "repeated requests for one device should hit its pool's cache");
}

#[test]
fn malloc_uses_the_runtimes_currently_active_device() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.set_device(DeviceId(3));
    let multi = MultiDevicePool::new(runtime, PoolConfig::default());

    let ptr = multi.malloc(1024, StreamId::DEFAULT).unwrap();
    assert_eq!(ptr.device_id(), DeviceId(3));
}

#[test]
fn free_all_blocks_sweeps_every_device_pool_constructed_so_far() {
    let runtime = Arc::new(FakeRuntime::new());
    let multi = MultiDevicePool::new(runtime, PoolConfig::default());

    let a = multi.malloc_on(DeviceId(0), 1024, StreamId::DEFAULT).unwrap();
    drop(a);
    let b = multi.malloc_on(DeviceId(1), 1024, StreamId::DEFAULT).unwrap();
    drop(b);

    let released = multi.free_all_blocks();
    assert_eq!(released, 2, "both device pools' fully-free parent should be released");
}
