//! End-to-end epoch scenarios: clean commits, corruption-driven rollbacks,
//! fatal frees, and the multi-threaded rendezvous.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use rewind_runtime::{
    fault, EpochPhase, Runtime, RuntimeConfig, Watchpoint, WatchpointAssist,
};

fn small_runtime() -> Runtime {
    let config = RuntimeConfig::builder()
        .heap_size(1 << 20)
        .max_free_objects(256)
        .build();
    Runtime::new(config).unwrap()
}

/// Watchpoint assist that records arm requests for inspection.
struct RecordingAssist(Arc<Mutex<Vec<Watchpoint>>>);

impl WatchpointAssist for RecordingAssist {
    fn arm(&self, watchpoint: &Watchpoint) -> bool {
        self.0.lock().unwrap().push(*watchpoint);
        true
    }
}

#[test]
fn clean_epoch_commits_and_drains() {
    let rt = small_runtime();
    let p = rt.malloc(24);
    assert!(!p.is_null());
    unsafe {
        std::ptr::write_bytes(p, 0x42, 24);
    }
    rt.free(p);
    rt.epoch_end();

    let stats = rt.stats();
    assert_eq!(stats.epochs_committed, 1);
    assert_eq!(stats.epochs_rolled_back, 0);
    assert_eq!(stats.quarantined, 0);
    assert!(!stats.has_rolled_back);
    assert_eq!(rt.phase(), EpochPhase::NormalExecution);
}

#[test]
fn one_byte_tail_overflow_rolls_back_and_arms_watchpoint() {
    let armed = Arc::new(Mutex::new(Vec::new()));
    let config = RuntimeConfig::builder().heap_size(1 << 20).build();
    let rt = Runtime::with_assist(config, Box::new(RecordingAssist(Arc::clone(&armed)))).unwrap();

    // 24 requested out of a 32-byte block: offset 24 is the first guard byte.
    let p = rt.malloc(24);
    unsafe {
        p.add(24).write(0x99);
    }
    rt.epoch_end();

    let stats = rt.stats();
    assert_eq!(stats.epochs_rolled_back, 1);
    assert!(stats.has_rolled_back);

    let armed = armed.lock().unwrap();
    assert_eq!(armed.len(), 1);
    assert_eq!(armed[0].addr, p as usize + 24);
}

#[test]
fn rollback_restores_globals_and_heap_byte_for_byte() {
    let rt = small_runtime();

    let mut global = vec![0x11u8; 128];
    unsafe {
        rt.register_global_region(global.as_mut_ptr(), global.len());
    }

    let survivor = rt.malloc(48);
    unsafe {
        std::ptr::write_bytes(survivor, 0x22, 48);
    }
    rt.epoch_end();
    assert_eq!(rt.stats().epochs_committed, 1);

    // New epoch: disturb everything, then trip an overflow.
    global.fill(0x33);
    unsafe {
        std::ptr::write_bytes(survivor, 0x44, 48);
    }
    let doomed = rt.malloc(24);
    unsafe {
        doomed.add(24).write(0x01);
    }
    rt.epoch_end();

    assert_eq!(rt.stats().epochs_rolled_back, 1);
    assert!(global.iter().all(|&b| b == 0x11));
    for i in 0..48 {
        assert_eq!(unsafe { survivor.add(i).read() }, 0x22);
    }
    // The doomed allocation predates nothing: it is gone from the metadata.
    assert_eq!(rt.get_size(doomed), 0);
}

#[test]
fn double_free_aborts_with_report() {
    fault::panic_on_fatal(true);
    static REPORTED: AtomicBool = AtomicBool::new(false);
    fault::add_fault_hook(|report| {
        if report.kind == rewind_runtime::FaultKind::DoubleFree {
            REPORTED.store(true, Ordering::SeqCst);
        }
    });

    let rt = small_runtime();
    let p = rt.malloc(16);
    rt.free(p);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        rt.free(p);
    }));
    assert!(result.is_err());
    assert!(REPORTED.load(Ordering::SeqCst));
}

#[test]
fn memalign_round_trip_is_clean() {
    let rt = small_runtime();
    let p = rt.memalign(64, 100);
    assert!(!p.is_null());
    assert_eq!(p as usize % 64, 0);
    unsafe {
        std::ptr::write_bytes(p, 0x5A, 100);
    }
    rt.free(p);
    rt.epoch_end();

    let stats = rt.stats();
    assert_eq!(stats.epochs_committed, 1);
    assert_eq!(stats.watchpoints, 0);
    assert!(!stats.has_rolled_back);
}

#[test]
fn use_after_free_rolls_back() {
    let rt = small_runtime();
    let p = rt.malloc(40);
    rt.free(p);
    // Write through the stale pointer into the quarantined block.
    unsafe {
        p.add(8).write(0xFE);
    }
    rt.epoch_end();

    let stats = rt.stats();
    assert_eq!(stats.epochs_rolled_back, 1);
    assert!(stats.has_rolled_back);
}

#[test]
fn quarantine_pressure_forces_epoch_end_without_loss() {
    let config = RuntimeConfig::builder()
        .heap_size(1 << 20)
        .max_free_objects(8)
        .build();
    let rt = Runtime::new(config).unwrap();

    for _ in 0..9 {
        let p = rt.malloc(16);
        assert!(!p.is_null());
        rt.free(p);
        rt.checkpoint();
    }

    let stats = rt.stats();
    assert!(stats.epoch_ends >= 1, "quarantine pressure must end the epoch");
    assert_eq!(stats.frees, 9);
    assert!(stats.quarantined < 8);
    assert_eq!(stats.epochs_rolled_back, 0);
}

#[test]
fn syscall_buffer_overlapping_guards_is_vetoed() {
    let rt = small_runtime();
    let p = rt.malloc(24);
    assert!(rt.check_syscall_buffer(p, 24).is_ok());
    assert!(rt.check_syscall_buffer(p, 25).is_err());
}

#[test]
fn concurrent_rendezvous_has_one_committer() {
    const WORKERS: usize = 4;
    const WARMUP_ITERS: usize = 200;

    let config = RuntimeConfig::builder()
        .heap_size(1 << 22)
        .max_free_objects(4096)
        .build();
    let rt = Arc::new(Runtime::new(config).unwrap());
    let ready = Arc::new(Barrier::new(WORKERS + 1));
    let stop = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::new();
    for _ in 0..WORKERS {
        let rt = Arc::clone(&rt);
        let ready = Arc::clone(&ready);
        let stop = Arc::clone(&stop);
        handles.push(std::thread::spawn(move || {
            rt.register_thread();
            ready.wait();
            let mut iters = 0usize;
            while !stop.load(Ordering::Relaxed) {
                if iters < WARMUP_ITERS {
                    let p = rt.malloc(32);
                    if !p.is_null() {
                        unsafe {
                            std::ptr::write_bytes(p, 0x77, 32);
                        }
                        rt.free(p);
                    }
                }
                rt.checkpoint();
                iters += 1;
            }
            rt.unregister_thread();
            iters
        }));
    }

    ready.wait();
    // Let the workers churn, then end the epoch from this thread: it becomes
    // the committer, all four workers park, and everyone resumes together.
    std::thread::sleep(std::time::Duration::from_millis(20));
    rt.epoch_end();
    stop.store(true, Ordering::Relaxed);

    for handle in handles {
        let iters = handle.join().unwrap();
        assert!(iters > 0);
    }

    let stats = rt.stats();
    assert_eq!(stats.epoch_ends, 1, "the committer ran exactly once");
    assert_eq!(stats.epochs_committed, 1);
    assert_eq!(stats.epochs_rolled_back, 0);
    assert_eq!(rt.phase(), EpochPhase::NormalExecution);
    assert_eq!(stats.registered_threads, 1);
}
