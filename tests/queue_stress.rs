use rayos_dispatch::hal::sim::{KernelInvocation, SimCodeObject, SimPlatform};
use rayos_dispatch::types::KernelObject;
use rayos_dispatch::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const PRODUCERS: u64 = 8;
const PER_PRODUCER: u64 = 200;

/// Every packet carries (producer, sequence) twice: once in the kernarg
/// word and once in its geometry. A torn or early-visible slot breaks the match.
fn tag(producer: u64, seq: u64) -> DispatchDescriptor {
    DispatchDescriptor::new(KernelObject::NULL)
        .workgroup(producer as u16 + 1, 1, 1)
        .grid(seq as u32 + 1, 1, 1)
        .kernarg((producer << 32) | seq)
}

fn checker(mismatches: Arc<AtomicUsize>) -> impl Fn(&KernelInvocation) + Send + Sync + 'static {
    move |inv| {
        let producer = inv.kernarg_address >> 32;
        let seq = inv.kernarg_address & 0xffff_ffff;
        if inv.workgroup.x as u64 != producer + 1 || inv.grid.x as u64 != seq + 1 {
            mismatches.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn stress(capacity: u32, slow: bool) {
    let mismatches = Arc::new(AtomicUsize::new(0));
    let check = checker(mismatches.clone());
    let sim = Arc::new(
        SimPlatform::builder()
            .kernel("check", move |inv: &KernelInvocation| {
                check(inv);
                if slow {
                    thread::sleep(Duration::from_micros(50));
                }
            })
            .build(),
    );
    let rt = DispatchRuntimeBuilder::new()
        .with_queue_size(capacity)
        .with_overflow_policy(OverflowPolicy::Backpressure)
        .build(sim.clone())
        .unwrap();
    let blob = SimCodeObject::new(["check"]).to_bytes();
    let program = rt.load_program(&blob, "check").unwrap();

    let total = PRODUCERS * PER_PRODUCER;
    let signal = CompletionSignal::with_value(rt.runtime(), total as i64).unwrap();

    thread::scope(|s| {
        for producer in 0..PRODUCERS {
            let rt = &rt;
            let signal = &signal;
            let kernel = program.kernel_object();
            s.spawn(move || {
                for seq in 0..PER_PRODUCER {
                    let mut desc = tag(producer, seq).completion_signal(signal);
                    desc.kernel_object = kernel;
                    rt.dispatch(&desc).unwrap();
                }
            });
        }
    });

    assert!(signal.wait(Duration::from_secs(30)), "value left: {}", signal.value());
    assert_eq!(mismatches.load(Ordering::Relaxed), 0);

    let records = sim.drain_records();
    assert_eq!(records.len() as u64, total);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.index, i as u64, "retired out of index order");
        assert_eq!(record.fault, None);
    }

    let stats = rt.stats();
    assert_eq!(stats.reserved, total);
    assert_eq!(stats.consumed, total);
    assert_eq!(stats.published, total);
    assert_eq!(stats.in_flight(), 0);
}

#[test]
fn concurrent_producers_publish_complete_packets() {
    stress(1024, false);
}

#[test]
fn backpressure_wraps_a_small_ring_without_overwriting() {
    stress(16, true);
}

#[test]
fn in_flight_never_exceeds_capacity() {
    let sim = Arc::new(
        SimPlatform::builder()
            .kernel("slow", |_| thread::sleep(Duration::from_millis(1)))
            .build(),
    );
    let rt = DispatchRuntimeBuilder::new().with_queue_size(4).build(sim.clone()).unwrap();
    let program = rt
        .load_program(&SimCodeObject::new(["slow"]).to_bytes(), "slow")
        .unwrap();

    let signal = CompletionSignal::with_value(rt.runtime(), 20).unwrap();
    let desc = DispatchDescriptor::new(program.kernel_object()).completion_signal(&signal);
    for _ in 0..20 {
        rt.dispatch(&desc).unwrap();
        assert!(rt.stats().in_flight() <= 4);
    }
    assert!(signal.wait(Duration::from_secs(10)));
    assert_eq!(sim.drain_records().len(), 20);
}
