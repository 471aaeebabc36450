//! x86_64 support: interrupt gating, TLB ops, PIC gating, context switch.

pub mod context;
pub mod gdt;
pub mod idt;
pub mod mmu;
pub mod pic;
pub mod pit;

pub use context::{context_switch, Context};

use x86_64::instructions::interrupts;
use x86_64::VirtAddr;

/// Saved RFLAGS.IF state.
#[derive(Debug, Clone, Copy)]
pub struct IrqFlags(pub bool);

#[inline]
pub fn halt() {
    x86_64::instructions::hlt();
}

#[inline]
pub fn enable_interrupts() {
    interrupts::enable();
}

#[inline]
pub fn disable_interrupts() {
    interrupts::disable();
}

#[inline]
pub fn are_interrupts_enabled() -> bool {
    interrupts::are_enabled()
}

#[inline]
pub fn irq_save() -> IrqFlags {
    let was = interrupts::are_enabled();
    interrupts::disable();
    IrqFlags(was)
}

#[inline]
pub fn irq_restore(flags: IrqFlags) {
    if flags.0 {
        interrupts::enable();
    }
}

#[inline]
pub fn tlb_flush(vaddr: u64) {
    x86_64::instructions::tlb::flush(VirtAddr::new(vaddr));
}

#[inline]
pub fn tlb_flush_all() {
    x86_64::instructions::tlb::flush_all();
}

/// User-mode selectors (GDT layout: kernel CS/SS, then user CS/SS, RPL 3).
const USER_CS: u64 = 0x1B;
const USER_SS: u64 = 0x23;

/// IRETQ into user mode with the given frame.
pub fn enter_user_mode(regs: &super::UserRegs) -> ! {
    // SAFETY: builds a canonical iretq frame; the target code segment is
    // ring 3 and the entry state carries IF set so preemption keeps
    // working in user land.
    unsafe {
        core::arch::asm!(
            "push {ss}",
            "push {sp}",
            "push {flags}",
            "push {cs}",
            "push {pc}",
            "mov rdi, {a0}",
            "mov rsi, {a1}",
            "mov rdx, {a2}",
            "iretq",
            ss = in(reg) USER_SS,
            sp = in(reg) regs.sp,
            flags = in(reg) regs.flags | 0x202,
            cs = in(reg) USER_CS,
            pc = in(reg) regs.pc,
            a0 = in(reg) regs.args[0],
            a1 = in(reg) regs.args[1],
            a2 = in(reg) regs.args[2],
            in("rax") regs.ret,
            options(noreturn),
        );
    }
}
