//! Kernel binary entry points.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
extern crate alloc;

#[cfg(target_os = "none")]
mod kernel_bin {
    use cinder_kernel::boot::{BootInfo, BootMemRegion};
    use cinder_kernel::mm::regions::MemRegionKind;
    use cinder_kernel::{bootstrap, sched};

    #[cfg(target_arch = "x86_64")]
    mod x86_64_entry {
        use super::*;
        use bootloader_api::config::{BootloaderConfig, Mapping};
        use bootloader_api::info::MemoryRegionKind;

        pub static BOOTLOADER_CONFIG: BootloaderConfig = {
            let mut config = BootloaderConfig::new_default();
            config.mappings.physical_memory = Some(Mapping::FixedAddress(
                cinder_kernel::config::KERNEL_BASE_VA,
            ));
            config
        };

        bootloader_api::entry_point!(kernel_entry, config = &BOOTLOADER_CONFIG);

        const MAX_BOOT_REGIONS: usize = 64;

        fn kernel_entry(info: &'static mut bootloader_api::BootInfo) -> ! {
            cinder_kernel::init_global_allocator();

            // Translate the loader's map into the portable shape.
            let mut map = [BootMemRegion {
                addr: 0,
                len: 0,
                kind: MemRegionKind::Reserved,
            }; MAX_BOOT_REGIONS];
            let mut n = 0;

            for r in info.memory_regions.iter() {
                if n == MAX_BOOT_REGIONS {
                    break;
                }
                map[n] = BootMemRegion {
                    addr: r.start,
                    len: r.end - r.start,
                    kind: match r.kind {
                        MemoryRegionKind::Usable => MemRegionKind::Available,
                        MemoryRegionKind::Bootloader => MemRegionKind::Bootloader,
                        _ => MemRegionKind::Reserved,
                    },
                };
                n += 1;
            }

            let boot_info = BootInfo {
                mem_map: &map[..n],
                cmdline: "",
                framebuffer: None,
                initrd: None,
                efi_runtime_services: 0,
            };

            cinder_kernel::arch::x86_64::gdt::init();
            cinder_kernel::arch::x86_64::idt::init();
            cinder_kernel::arch::x86_64::pic::init();
            // The MMU shadow must be watching before the first kernel
            // stack is mapped.
            cinder_kernel::arch::x86_64::mmu::init();

            bootstrap::init_core(&boot_info).expect("core init failed");

            // Timer on, preemption on, and the boot context becomes the
            // kernel main task.
            cinder_kernel::arch::x86_64::pit::init();
            cinder_kernel::arch::x86_64::pic::unmask(0);
            cinder_kernel::arch::enable_interrupts();
            sched::enable_preemption();

            super::kernel_main();
        }
    }

    #[cfg(target_arch = "riscv64")]
    mod riscv64_entry {
        use super::*;

        /// QEMU virt machine: 128 MiB of RAM at 0x8000_0000. Firmware
        /// hands over in S-mode with paging prepared by the loader stage.
        #[no_mangle]
        pub extern "C" fn _start() -> ! {
            cinder_kernel::init_global_allocator();

            let map = [
                BootMemRegion {
                    addr: 0x8000_0000,
                    len: 128 * 1024 * 1024,
                    kind: MemRegionKind::Available,
                },
                BootMemRegion {
                    addr: 0x8000_0000,
                    len: 2 * 1024 * 1024,
                    kind: MemRegionKind::Kernel,
                },
            ];

            let boot_info = BootInfo {
                mem_map: &map,
                cmdline: "",
                framebuffer: None,
                initrd: None,
                efi_runtime_services: 0,
            };

            bootstrap::init_core(&boot_info).expect("core init failed");
            sched::enable_preemption();
            super::kernel_main();
        }
    }

    /// The kernel main task: from here on everything interesting happens
    /// in kernel threads and user processes.
    pub fn kernel_main() -> ! {
        log::info!("CinderOS kernel up; entering idle loop");

        loop {
            cinder_kernel::arch::halt();
            if sched::need_resched() {
                sched::schedule();
            }
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        cinder_kernel::arch::disable_interrupts();
        cinder_kernel::kprintln!("\n*** KERNEL PANIC ***\n{}\n", info);

        if cinder_kernel::config::panic_dump_regs() {
            let tid = sched::current_tid();
            sched::with_task(tid, |t| {
                if let Some(regs) = t.user_regs {
                    cinder_kernel::kprintln!("task {}: {:#x?}", tid, regs);
                }
            });
        }

        loop {
            cinder_kernel::arch::halt();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel only runs on bare metal; the host build exists for the
    // unit-test harness in the library crate.
}
