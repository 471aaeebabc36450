//! Shared environment bring-up for the QEMU test binaries.

#![allow(dead_code)]

use cinder_kernel::boot::{BootInfo, BootMemRegion};
use cinder_kernel::mm::regions::MemRegionKind;
use cinder_kernel::{sched, serial_println};

/// Full subsystem init over the QEMU test machine's memory (256 MiB),
/// with timer and preemption running.
pub fn init_test_env(name: &str) {
    serial_println!("==== {} ====", name);
    cinder_kernel::init_global_allocator();

    #[cfg(target_arch = "x86_64")]
    {
        cinder_kernel::arch::x86_64::gdt::init();
        cinder_kernel::arch::x86_64::idt::init();
        cinder_kernel::arch::x86_64::pic::init();
        // Must watch paging before the first kernel stack is mapped.
        cinder_kernel::arch::x86_64::mmu::init();
    }

    let map = [
        BootMemRegion {
            addr: 0,
            len: 256 * 1024 * 1024,
            kind: MemRegionKind::Available,
        },
        // Test image + boot structures.
        BootMemRegion {
            addr: 0,
            len: 4 * 1024 * 1024,
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

    cinder_kernel::bootstrap::init_core(&boot_info).expect("test env init");

    #[cfg(target_arch = "x86_64")]
    {
        cinder_kernel::arch::x86_64::pit::init();
        cinder_kernel::arch::x86_64::pic::unmask(0);
        cinder_kernel::arch::enable_interrupts();
    }

    sched::enable_preemption();
}

/// Build a minimal ELF64 executable image in memory: one RW PT_LOAD
/// segment holding `code`, entry at its first byte.
pub fn synth_user_elf(vaddr: u64, code: &[u8]) -> alloc::vec::Vec<u8> {
    let mut v = alloc::vec![0u8; 0x78 + code.len()];
    v[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    v[4] = 2; // 64-bit
    v[5] = 1; // little endian
    v[6] = 1;
    v[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    #[cfg(target_arch = "riscv64")]
    v[18..20].copy_from_slice(&0xF3u16.to_le_bytes());
    #[cfg(not(target_arch = "riscv64"))]
    v[18..20].copy_from_slice(&0x3Eu16.to_le_bytes());
    v[24..32].copy_from_slice(&vaddr.to_le_bytes()); // entry
    v[32..40].copy_from_slice(&0x40u64.to_le_bytes()); // phoff
    v[54..56].copy_from_slice(&56u16.to_le_bytes());
    v[56..58].copy_from_slice(&1u16.to_le_bytes());

    let ph = 0x40;
    v[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    v[ph + 4..ph + 8].copy_from_slice(&7u32.to_le_bytes()); // RWX
    v[ph + 8..ph + 16].copy_from_slice(&0x78u64.to_le_bytes());
    v[ph + 16..ph + 24].copy_from_slice(&vaddr.to_le_bytes());
    let sz = code.len() as u64;
    v[ph + 32..ph + 40].copy_from_slice(&sz.to_le_bytes());
    v[ph + 40..ph + 48].copy_from_slice(&sz.to_le_bytes());
    v[0x78..].copy_from_slice(code);
    v
}

extern crate alloc;
