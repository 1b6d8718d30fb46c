use bytemuck::{Pod, Zeroable};
use rayos_dispatch::hal::sim::{KernelInvocation, SimCodeObject, SimPlatform};
use rayos_dispatch::packet::dispatch_control_word;
use rayos_dispatch::types::Dim3;
use rayos_dispatch::*;
use std::sync::Arc;
use std::time::Duration;

const MEMSIZE: usize = 1024 * 1024;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct HelloArgs {
    out: u64,
    len: u64,
}

fn hello_world(inv: &KernelInvocation) {
    let args: HelloArgs = unsafe { inv.kernargs() };
    let out = args.out as *mut i32;
    for i in 0..inv.work_items().min(args.len) {
        unsafe { out.add(i as usize).write(i as i32) };
    }
}

fn sim() -> Arc<SimPlatform> {
    Arc::new(
        SimPlatform::builder()
            .queue_max_size(1024)
            .kernel("hello_world", hello_world)
            .build(),
    )
}

#[test]
fn hello_world_end_to_end() {
    let sim = sim();
    let rt = DispatchRuntime::initialize(sim.clone(), RuntimeConfig::default()).unwrap();
    assert_eq!(rt.queue().capacity(), 1024);

    let blob = SimCodeObject::new(["hello_world"]).to_bytes();
    let program = rt.load_program(&blob, "hello_world").unwrap();

    let mut kernarg = rt.allocate(RegionClass::Kernarg, MEMSIZE).unwrap();
    let mut cpubuf = rt.allocate(RegionClass::HostVisibleLocal, MEMSIZE).unwrap();
    let gpubuf = rt.allocate(RegionClass::DeviceLocal, MEMSIZE).unwrap();
    kernarg
        .write_pod(0, &HelloArgs { out: gpubuf.address(), len: (MEMSIZE / 4) as u64 })
        .unwrap();

    let signal = rt.create_signal().unwrap();
    let desc = DispatchDescriptor::new(program.kernel_object())
        .workgroup(64, 1, 1)
        .grid(2048, 1, 1)
        .kernarg(kernarg.address())
        .completion_signal(&signal);

    let index = rt.dispatch(&desc).unwrap();
    assert_eq!(index, 0);
    assert!(rt.wait(&signal, Duration::from_secs(10)));
    assert_eq!(signal.value(), 0);

    let records = sim.drain_records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.index, 0);
    assert_eq!(record.dimensions(), 1);
    assert_eq!(record.control, dispatch_control_word(1));
    assert_eq!(record.kernel_object, program.kernel_object());
    assert_eq!(record.grid, Dim3::new(2048, 1, 1));
    assert_eq!(record.workgroup, Dim3::new(64, 1, 1));
    assert_eq!(record.kernarg_address, kernarg.address());
    assert_eq!(record.completion_signal, signal.handle());
    assert_eq!(record.doorbell, 0);
    assert_eq!(record.fault, None);

    gpubuf.assign_agent(rt.host().handle).unwrap();
    gpubuf.copy_to(&mut cpubuf).unwrap();
    let ints: Vec<i32> = cpubuf.to_pod_vec().unwrap();
    assert!(ints[..2048].iter().enumerate().all(|(i, v)| *v == i as i32));
    assert!(ints[2048..].iter().all(|v| *v == 0));
}

#[test]
fn runtime_shuts_down_after_last_user() {
    let sim = sim();
    let rt = DispatchRuntime::initialize(sim.clone(), RuntimeConfig::default()).unwrap();
    let blob = SimCodeObject::new(["hello_world"]).to_bytes();
    let program = rt.load_program(&blob, "hello_world").unwrap();

    drop(rt);
    assert!(sim.is_initialized(), "program still holds the runtime");
    drop(program);
    assert!(!sim.is_initialized());
    assert_eq!(sim.shutdown_count(), 1);
    assert_eq!(sim.live_allocations(), 0);
    assert_eq!(sim.live_signals(), 0);
}

#[test]
fn selects_accelerator_by_index() {
    let sim = Arc::new(
        SimPlatform::builder()
            .accelerator("gfx906")
            .accelerator("gfx90a")
            .accelerator("gfx1100")
            .build(),
    );
    let rt = DispatchRuntimeBuilder::new()
        .with_selection(SelectionPolicy::Index(1))
        .build(sim.clone())
        .unwrap();
    assert_eq!(rt.accelerator().name, "gfx90a");

    let rt = DispatchRuntimeBuilder::new().build(sim).unwrap();
    assert_eq!(rt.accelerator().name, "gfx1100");
}

#[test]
fn missing_device_local_region_fails_on_allocation_only() {
    let sim = Arc::new(SimPlatform::builder().without_region(RegionClass::DeviceLocal).build());
    let rt = DispatchRuntime::initialize(sim, RuntimeConfig::default()).unwrap();
    assert!(rt.allocate(RegionClass::Kernarg, 64).is_ok());
    assert!(matches!(
        rt.allocate(RegionClass::DeviceLocal, 64),
        Err(DispatchError::RegionUnavailable(RegionClass::DeviceLocal))
    ));
}

#[test]
fn zero_grid_is_rejected_without_taking_a_slot() {
    let rt = DispatchRuntime::initialize(sim(), RuntimeConfig::default()).unwrap();
    let blob = SimCodeObject::new(["hello_world"]).to_bytes();
    let program = rt.load_program(&blob, "hello_world").unwrap();

    let desc = DispatchDescriptor::new(program.kernel_object()).grid(0, 1, 1);
    assert!(matches!(rt.dispatch(&desc), Err(DispatchError::InvalidGeometry { .. })));
    assert_eq!(rt.stats().reserved, 0);
}
