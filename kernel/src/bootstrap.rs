//! Kernel bring-up: turns the boot handoff into initialized subsystems, in
//! dependency order.

use crate::boot::BootInfo;
use crate::config::KMALLOC_FIRST_HEAP_SIZE;
use crate::error::{KernelError, KernelResult};
use crate::mm::frame::FRAME_ALLOCATOR;
use crate::mm::regions::{MemRegionKind, MEM_REGIONS};
use crate::mm::{kmalloc, paging, PhysAddr};
use crate::{irq, klog, sched, time};

/// Find a contiguous available region for the first kmalloc heap:
/// `KMALLOC_FIRST_HEAP_SIZE` bytes, megabyte aligned, above the first
/// 16 MiB (the DMA window and the kernel image live below).
fn pick_first_heap_region() -> KernelResult<PhysAddr> {
    let regions = MEM_REGIONS.lock();
    const MB: u64 = 1024 * 1024;

    for r in regions.iter() {
        if r.kind != MemRegionKind::Available || !r.extra.is_empty() {
            continue;
        }
        let lo = r.addr.max(16 * MB).div_ceil(MB) * MB;
        if lo + KMALLOC_FIRST_HEAP_SIZE as u64 <= r.end() {
            return Ok(PhysAddr::new(lo));
        }
    }

    Err(KernelError::OutOfMemory)
}

/// Initialize every core subsystem. On return the caller may enable
/// preemption and start scheduling.
pub fn init_core(boot_info: &BootInfo<'_>) -> KernelResult<()> {
    klog::init();
    crate::config::parse_cmdline(boot_info.cmdline);

    // Memory map: arch prologue, loader entries, arch epilogue (DMA carve).
    let total_mem = {
        let mut regions = MEM_REGIONS.lock();
        regions.add_initial_regions();
        for r in boot_info.mem_map {
            regions.append(r.to_region());
        }
        if let Some(initrd) = boot_info.initrd {
            regions.append(crate::mm::regions::MemRegion {
                addr: initrd.paddr,
                len: initrd.size,
                kind: MemRegionKind::Initrd,
                extra: crate::mm::regions::MemRegionExtra::empty(),
            });
        }
        regions.add_final_regions();
        regions.dump();

        regions.iter().map(|r| r.end()).max().unwrap_or(0)
    };

    // Frame allocator over the whole map, reserving every non-available
    // byte.
    {
        let mut fa = FRAME_ALLOCATOR.lock();
        fa.init(total_mem);
        fa.reserve_from_regions(&MEM_REGIONS.lock());
    }

    paging::init()?;

    // First kmalloc heap out of linearly-mapped memory.
    let heap_pa = pick_first_heap_region()?;
    {
        let mut fa = FRAME_ALLOCATOR.lock();
        fa.mark_reserved(heap_pa, KMALLOC_FIRST_HEAP_SIZE / (1024 * 1024));
    }
    kmalloc::init(heap_pa)?;

    sched::init()?;
    irq::init()?;
    sched::set_pre_switch_hook(pre_switch);

    // The RTC read belongs to the platform layer; without one the clock
    // starts at the epoch.
    time::init(0);

    log::info!("core init complete");
    Ok(())
}

/// Dispatcher hook: before a task runs, point the ring-0 trap stack at its
/// kernel stack, switch the hardware address space, and deliver pending
/// signals on the user edge.
fn pre_switch(tid: sched::Tid) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    if let Some(top) = sched::with_task(tid, |t| t.kernel_stack.as_ref().map(|s| s.top())).flatten()
    {
        crate::arch::x86_64::gdt::set_kernel_stack(top);
    }

    let is_user = sched::with_task(tid, |t| t.process.is_some()).unwrap_or(false);

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    if is_user {
        crate::arch::x86_64::mmu::activate(tid);
    } else {
        crate::arch::x86_64::mmu::activate_kernel();
    }

    if is_user {
        let _ = crate::process::signal::deliver_pending(tid);
    }
}
