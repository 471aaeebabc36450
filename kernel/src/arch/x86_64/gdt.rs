//! GDT and TSS.
//!
//! Selector layout is fixed: kernel code 0x08, kernel data 0x10, user code
//! 0x1B, user data 0x23 (RPL 3). The TSS carries the per-task kernel stack
//! the CPU switches to on a ring-3 interrupt; the dispatcher updates it at
//! every switch.

use core::cell::UnsafeCell;

use lazy_static::lazy_static;
use x86_64::instructions::tables::load_tss;
use x86_64::registers::segmentation::{Segment, SegmentSelector, CS, DS, ES, SS};
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

struct TssCell(UnsafeCell<TaskStateSegment>);

// SAFETY: rsp0 is written only with interrupts disabled on the only CPU.
unsafe impl Sync for TssCell {}

static TSS: TssCell = TssCell(UnsafeCell::new(TaskStateSegment::new()));

struct Selectors {
    kernel_code: SegmentSelector,
    kernel_data: SegmentSelector,
    tss: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        let _user_code = gdt.append(Descriptor::user_code_segment());
        let _user_data = gdt.append(Descriptor::user_data_segment());
        // SAFETY: the TSS is 'static; its address is stable.
        let tss = gdt.append(Descriptor::tss_segment(unsafe { &*TSS.0.get() }));
        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                tss,
            },
        )
    };
}

pub fn init() {
    GDT.0.load();
    // SAFETY: the selectors come from the table just loaded.
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        SS::set_reg(GDT.1.kernel_data);
        DS::set_reg(GDT.1.kernel_data);
        ES::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
}

/// Point the TSS at the kernel stack the CPU must take on a ring-3 trap.
pub fn set_kernel_stack(rsp0: u64) {
    // SAFETY: single CPU, callers run with interrupts disabled (the
    // dispatcher's pre-switch hook).
    unsafe {
        (*TSS.0.get()).privilege_stack_table[0] = VirtAddr::new(rsp0);
    }
}
