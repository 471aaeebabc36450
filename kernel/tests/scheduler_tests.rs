//! Scheduler and synchronization tests (QEMU only): the blocking paths
//! that need real context switches and a live timer.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod qemu {
    extern crate alloc;

    use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use cinder_kernel::sched;
    use cinder_kernel::sync::{KCond, KMutex, RwLockWp};
    use cinder_kernel::test_framework::{exit_qemu, QemuExitCode};
    use cinder_kernel::{kernel_assert, kernel_assert_eq, serial_println};
    use lazy_static::lazy_static;

    #[path = "common/mod.rs"]
    mod common;

    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        common::init_test_env("scheduler tests");

        run(test_round_robin_fairness, "round_robin_fairness");
        run(test_mutex_contention, "mutex_contention");
        run(test_kcond_signal_and_timeout, "kcond_signal_and_timeout");
        run(test_rwlock_wp, "rwlock_wp");
        run(test_kernel_sleep_duration, "kernel_sleep_duration");
        run(test_kthread_join, "kthread_join");

        serial_println!("\nAll tests passed");
        exit_qemu(QemuExitCode::Success)
    }

    fn run(test: fn(), name: &str) {
        serial_println!("{}...", name);
        test();
        serial_println!("{}... [ok]", name);
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        cinder_kernel::test_framework::test_panic_handler(info)
    }

    // ===== Fairness (S5) =====

    static SPIN_COUNTS: [AtomicU64; 3] =
        [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)];
    static SPIN_STOP: AtomicBool = AtomicBool::new(false);

    extern "C" fn spinner(idx: usize) -> ! {
        while !SPIN_STOP.load(Ordering::Relaxed) {
            SPIN_COUNTS[idx].fetch_add(1, Ordering::Relaxed);
        }
        sched::kthread_exit(0);
    }

    fn test_round_robin_fairness() {
        let mut tids = [0u32; 3];
        for (i, tid) in tids.iter_mut().enumerate() {
            *tid = sched::kthread_create(spinner, i).expect("spawn spinner");
        }

        // Three CPU-bound threads fighting over ~10 timeslices.
        sched::kernel_sleep(30);
        SPIN_STOP.store(true, Ordering::Relaxed);

        for (i, &tid) in tids.iter().enumerate() {
            let ticks = sched::with_task(tid, |t| t.total_ticks).unwrap_or(0);
            serial_println!("  spinner {} (tid {}): {} ticks", i, tid, ticks);
            kernel_assert!(ticks >= 2, "spinner {} starved ({} ticks)", i, ticks);
            kernel_assert!(SPIN_COUNTS[i].load(Ordering::Relaxed) > 0);
        }

        for tid in tids {
            kernel_assert_eq!(sched::kthread_join(tid).expect("join"), 0);
        }
    }

    // ===== Contended mutex =====

    lazy_static! {
        static ref SHARED_MUTEX: KMutex = KMutex::new(false);
    }
    static SHARED_VALUE: AtomicU64 = AtomicU64::new(0);

    extern "C" fn mutex_worker(rounds: usize) -> ! {
        for _ in 0..rounds {
            SHARED_MUTEX.lock();
            // Non-atomic read-modify-write under the lock; a switch in
            // between corrupts the count without mutual exclusion.
            let v = SHARED_VALUE.load(Ordering::Relaxed);
            sched::kernel_yield();
            SHARED_VALUE.store(v + 1, Ordering::Relaxed);
            SHARED_MUTEX.unlock();
        }
        sched::kthread_exit(0);
    }

    fn test_mutex_contention() {
        SHARED_VALUE.store(0, Ordering::Relaxed);
        let a = sched::kthread_create(mutex_worker, 50).unwrap();
        let b = sched::kthread_create(mutex_worker, 50).unwrap();
        sched::kthread_join(a).unwrap();
        sched::kthread_join(b).unwrap();
        kernel_assert_eq!(SHARED_VALUE.load(Ordering::Relaxed), 100);
    }

    // ===== Condvar: signal vs timeout =====

    lazy_static! {
        static ref COND_MUTEX: KMutex = KMutex::new(false);
        static ref COND: KCond = KCond::new();
    }

    extern "C" fn signaler(_arg: usize) -> ! {
        sched::kernel_sleep(3);
        COND.signal_one();
        sched::kthread_exit(0);
    }

    fn test_kcond_signal_and_timeout() {
        // Timeout path: nobody signals, the wait reports it.
        COND_MUTEX.lock();
        let signalled = COND.wait(Some(&COND_MUTEX), 5);
        kernel_assert!(!signalled, "wait must time out");

        // Signal path: a helper fires after 3 ticks, well inside the
        // 100-tick timeout; the timer must be cancelled by the signal.
        let helper = sched::kthread_create(signaler, 0).unwrap();
        let signalled = COND.wait(Some(&COND_MUTEX), 100);
        kernel_assert!(signalled, "wait must be signalled");
        COND_MUTEX.unlock();
        sched::kthread_join(helper).unwrap();
    }

    // ===== Writer-preferring rwlock (S6) =====

    lazy_static! {
        static ref RW: RwLockWp = RwLockWp::new(false);
    }
    static READERS_DONE: AtomicU64 = AtomicU64::new(0);
    static WRITERS_DONE: AtomicU64 = AtomicU64::new(0);
    static WRITERS_RUNNING: AtomicU64 = AtomicU64::new(0);

    extern "C" fn rw_reader(_arg: usize) -> ! {
        for _ in 0..10 {
            RW.shlock();
            kernel_assert_eq!(WRITERS_RUNNING.load(Ordering::Relaxed), 0);
            sched::kernel_yield();
            RW.shunlock();
        }
        READERS_DONE.fetch_add(1, Ordering::Relaxed);
        sched::kthread_exit(0);
    }

    extern "C" fn rw_writer(_arg: usize) -> ! {
        for _ in 0..10 {
            RW.exlock();
            kernel_assert_eq!(WRITERS_RUNNING.fetch_add(1, Ordering::Relaxed), 0);
            sched::kernel_yield();
            WRITERS_RUNNING.fetch_sub(1, Ordering::Relaxed);
            RW.exunlock();
        }
        WRITERS_DONE.fetch_add(1, Ordering::Relaxed);
        sched::kthread_exit(0);
    }

    fn test_rwlock_wp() {
        let mut tids = alloc::vec::Vec::new();
        for _ in 0..10 {
            tids.push(sched::kthread_create(rw_reader, 0).unwrap());
            tids.push(sched::kthread_create(rw_writer, 0).unwrap());
        }
        for tid in tids {
            sched::kthread_join(tid).unwrap();
        }
        kernel_assert_eq!(READERS_DONE.load(Ordering::Relaxed), 10);
        kernel_assert_eq!(WRITERS_DONE.load(Ordering::Relaxed), 10);
        kernel_assert_eq!(WRITERS_RUNNING.load(Ordering::Relaxed), 0);
        kernel_assert!(!RW.has_writer());
    }

    // ===== Sleep accuracy =====

    fn test_kernel_sleep_duration() {
        let t0 = cinder_kernel::arch::timer::get_ticks();
        sched::kernel_sleep(10);
        let t1 = cinder_kernel::arch::timer::get_ticks();
        kernel_assert!(t1 - t0 >= 10, "slept only {} ticks", t1 - t0);
    }

    // ===== kthread join and reap =====

    extern "C" fn short_lived(code: usize) -> ! {
        sched::kernel_sleep(1);
        sched::kthread_exit(code as i32);
    }

    fn test_kthread_join() {
        let tid = sched::kthread_create(short_lived, 42).unwrap();
        kernel_assert_eq!(sched::kthread_join(tid).unwrap(), 42);
        // Reaped: no longer reachable in the task set.
        kernel_assert!(sched::get_task_state(tid).is_none());
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
