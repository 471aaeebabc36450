//! Build-time configuration and boot command-line options.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Size of a page / physical frame.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Base of the kernel half: the linear (identity-shifted) mapping of RAM.
pub const KERNEL_BASE_VA: u64 = 0xFFFF_8000_0000_0000;

/// How much physical memory the linear mapping covers.
pub const LINEAR_MAPPING_MB: u64 = 1024;
pub const LINEAR_MAPPING_SIZE: u64 = LINEAR_MAPPING_MB * 1024 * 1024;
pub const LINEAR_MAPPING_END: u64 = KERNEL_BASE_VA + LINEAR_MAPPING_SIZE;

/// hi-vmem: virtual space above the linear mapping used for ad-hoc
/// reservations. Reserve/release only; never auto-mapped.
pub const HI_VMEM_SIZE: u64 = 128 * 1024 * 1024;
pub const HI_VMEM_END: u64 = LINEAR_MAPPING_END + HI_VMEM_SIZE;

/// User half layout. The original 32-bit layout, kept in the low canonical
/// half of the 64-bit address space.
pub const USER_BASE_VA: u64 = 0x0040_0000;
pub const USER_VMEM_END: u64 = 0xC000_0000;
pub const USER_STACK_PAGES: usize = 16;
pub const USER_STACK_TOP: u64 = 0xBFFF_F000;
pub const MAX_BRK: u64 = 0x8000_0000;
/// Base of the per-process mmap heap window.
pub const USER_MMAP_BASE: u64 = 0x8000_0000;
pub const USER_MMAP_SIZE: u64 = 0x1000_0000;

/// Legacy ISA DMA window: at most this much, within the first 16 MiB.
pub const MAX_DMA: u64 = 256 * 1024;
pub const DMA_LIMIT: u64 = 16 * 1024 * 1024;

/// kmalloc defaults.
pub const KMALLOC_MIN_BLOCK: usize = 32;
pub const KMALLOC_HEAPS_COUNT: usize = 32;
pub const KMALLOC_FIRST_HEAP_SIZE: usize = 8 * 1024 * 1024;

/// Kernel stacks: 4 pages, with an unmapped guard page on each side.
pub const KERNEL_STACK_PAGES: usize = 4;

/// Per-process limits.
pub const MAX_HANDLES: usize = 16;
pub const MAX_PID: u32 = 32768;

/// Timer tick rate.
pub const TIMER_HZ: u32 = 100;

/// Default scheduler quantum, in ticks.
pub const DEFAULT_TIME_SLICE_TICKS: u32 = 5;

/// Number of IRQ lines the dispatch layer tracks.
pub const MAX_IRQ_LINES: usize = 64;

// ---------------------------------------------------------------------------
// Boot command-line options
// ---------------------------------------------------------------------------

static OPT_SCHED_QUANTUM: AtomicU32 = AtomicU32::new(DEFAULT_TIME_SLICE_TICKS);
static OPT_NO_COW: AtomicBool = AtomicBool::new(cfg!(feature = "no-cow"));
static OPT_PANIC_REGS: AtomicBool = AtomicBool::new(false);

/// Parse the boot command line (`key=value` and bare flags, space separated).
///
/// Unknown options are ignored so newer bootloaders stay compatible.
pub fn parse_cmdline(cmdline: &str) {
    for tok in cmdline.split_whitespace() {
        if let Some(v) = tok.strip_prefix("sched_quantum=") {
            if let Ok(q) = v.parse::<u32>() {
                if q > 0 {
                    OPT_SCHED_QUANTUM.store(q, Ordering::Relaxed);
                }
            }
        } else if tok == "no_cow" {
            OPT_NO_COW.store(true, Ordering::Relaxed);
        } else if tok == "panic_regs" {
            OPT_PANIC_REGS.store(true, Ordering::Relaxed);
        }
    }
}

/// Scheduler quantum in ticks, after cmdline overrides.
#[inline]
pub fn sched_quantum() -> u32 {
    OPT_SCHED_QUANTUM.load(Ordering::Relaxed)
}

/// Whether fork must deep-copy instead of COW.
#[inline]
pub fn fork_no_cow() -> bool {
    OPT_NO_COW.load(Ordering::Relaxed)
}

/// Whether panic should dump the register frame.
#[inline]
pub fn panic_dump_regs() -> bool {
    OPT_PANIC_REGS.load(Ordering::Relaxed)
}
