//! CinderOS kernel library.
//!
//! Exports the core subsystems for the kernel binary and for the QEMU
//! integration tests. Host-target builds (unit tests, coverage) link the
//! system allocator so `alloc` collections work under the standard test
//! harness.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![cfg_attr(target_os = "none", feature(custom_test_frameworks))]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
#![cfg_attr(all(test, target_os = "none"), test_runner(crate::test_runner))]
#![cfg_attr(all(test, target_os = "none"), reexport_test_harness_main = "test_main")]

#[cfg(feature = "alloc")]
extern crate alloc;

// Bare metal: the global allocator is a linked-list heap over a static
// region, initialized early in bring-up. The kernel's own allocator
// (mm::kmalloc) is a separate subsystem with its own contract.
#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(target_os = "none")]
const BOOT_HEAP_SIZE: usize = 4 * 1024 * 1024;

#[cfg(target_os = "none")]
static mut BOOT_HEAP: [u8; BOOT_HEAP_SIZE] = [0; BOOT_HEAP_SIZE];

/// Feed the global allocator its static region. First thing in bring-up.
#[cfg(target_os = "none")]
pub fn init_global_allocator() {
    // SAFETY: called once, before anything allocates; the static region
    // is exclusively owned by the allocator from here on.
    unsafe {
        ALLOCATOR
            .lock()
            .init(core::ptr::addr_of_mut!(BOOT_HEAP) as *mut u8, BOOT_HEAP_SIZE);
    }
}

// Host target: use the system allocator so unit tests allocate normally.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;
pub mod bootstrap;
pub mod config;
pub mod elf;
pub mod error;
pub mod fault;
pub mod fs;
pub mod irq;
pub mod klog;
pub mod mm;
pub mod process;
pub mod sched;
pub mod serial;
pub mod sync;
pub mod syscall;
pub mod test_framework;
pub mod time;

// Re-exports for the binary and the integration tests.
pub use error::{Errno, KernelError, KernelResult};
pub use test_framework::{exit_qemu, test_panic_handler, QemuExitCode, Testable};
#[cfg(all(test, target_os = "none"))]
pub use test_framework::test_runner;

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}

/// Heap allocation failure in a no_std kernel is unrecoverable.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}
