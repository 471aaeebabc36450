//! Memory subsystem tests (QEMU only): the frame allocator, heap ladder
//! growth and hi-vmem backing against real physical memory.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod qemu {
    extern crate alloc;

    use cinder_kernel::mm::frame::FRAME_ALLOCATOR;
    use cinder_kernel::mm::kmalloc::{kfree2, kmalloc, kmalloc_get_total_heap_allocation, kzmalloc};
    use cinder_kernel::test_framework::{exit_qemu, QemuExitCode};
    use cinder_kernel::{kernel_assert, kernel_assert_eq, serial_println};

    #[path = "common/mod.rs"]
    mod common;

    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        common::init_test_env("memory tests");

        run(test_frame_alloc_recycling, "frame_alloc_recycling");
        run(test_kmalloc_reuse, "kmalloc_reuse");
        run(test_kmalloc_write_through_pointers, "kmalloc_write_through_pointers");
        run(test_heap_ladder_growth, "heap_ladder_growth");

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

    fn test_frame_alloc_recycling() {
        let (a, b) = {
            let mut fa = FRAME_ALLOCATOR.lock();
            let a = fa.alloc_page().expect("frame");
            let b = fa.alloc_page().expect("frame");
            kernel_assert!(fa.is_allocated(a));
            kernel_assert!(fa.is_allocated(b));
            (a, b)
        };
        kernel_assert!(a != b);

        let mut fa = FRAME_ALLOCATOR.lock();
        fa.free_page(a);
        kernel_assert!(!fa.is_allocated(a));
        let again = fa.alloc_page().expect("frame");
        kernel_assert_eq!(again, a);
        fa.free_page(again);
        fa.free_page(b);
    }

    fn test_kmalloc_reuse() {
        // S2 on the real first heap.
        let p1 = kmalloc(10).unwrap();
        let p2 = kmalloc(10).unwrap();
        let p3 = kmalloc(50).unwrap();
        kernel_assert!(p1 != p2);

        kfree2(p1, 10);
        let p4 = kmalloc(10).unwrap();
        kernel_assert_eq!(p4, p1);

        kfree2(p2, 10);
        kfree2(p3, 50);
        kfree2(p4, 10);
    }

    fn test_kmalloc_write_through_pointers() {
        // On bare metal the returned pointers are directly usable memory.
        let p = kzmalloc(256).unwrap();
        // SAFETY: 256 bytes just allocated and zeroed.
        unsafe {
            let s = core::slice::from_raw_parts_mut(p.as_ptr(), 256);
            kernel_assert!(s.iter().all(|&b| b == 0));
            s[0] = 0x5A;
            s[255] = 0xA5;
            kernel_assert_eq!(s[0], 0x5A);
            kernel_assert_eq!(s[255], 0xA5);
        }
        kfree2(p, 256);
    }

    fn test_heap_ladder_growth() {
        // Allocations larger than the first heap force a dynamic hi-vmem
        // heap into existence, with lazily mapped backing.
        let before = kmalloc_get_total_heap_allocation();
        let big = kmalloc(12 * 1024 * 1024).expect("big allocation");

        // SAFETY: the 12 MiB block was just allocated; touch both ends.
        unsafe {
            let s = core::slice::from_raw_parts_mut(big.as_ptr(), 12 * 1024 * 1024);
            s[0] = 1;
            s[12 * 1024 * 1024 - 1] = 2;
        }

        kfree2(big, 12 * 1024 * 1024);
        kernel_assert_eq!(kmalloc_get_total_heap_allocation(), before);
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
