//! RISC-V (S-mode) support: interrupt gating via sstatus, SBI services,
//! context switch.

pub mod context;
pub mod sbi;

pub use context::{context_switch, Context};

use riscv::register::sstatus;

/// Saved SIE state.
#[derive(Debug, Clone, Copy)]
pub struct IrqFlags(pub bool);

#[inline]
pub fn halt() {
    riscv::asm::wfi();
}

#[inline]
pub fn enable_interrupts() {
    // SAFETY: flipping sstatus.SIE in S-mode.
    unsafe { sstatus::set_sie() };
}

#[inline]
pub fn disable_interrupts() {
    // SAFETY: flipping sstatus.SIE in S-mode.
    unsafe { sstatus::clear_sie() };
}

#[inline]
pub fn are_interrupts_enabled() -> bool {
    sstatus::read().sie()
}

#[inline]
pub fn irq_save() -> IrqFlags {
    let was = are_interrupts_enabled();
    disable_interrupts();
    IrqFlags(was)
}

#[inline]
pub fn irq_restore(flags: IrqFlags) {
    if flags.0 {
        enable_interrupts();
    }
}

#[inline]
pub fn tlb_flush(vaddr: u64) {
    // SAFETY: sfence.vma with an address argument invalidates that entry.
    unsafe {
        core::arch::asm!("sfence.vma {}, zero", in(reg) vaddr);
    }
}

#[inline]
pub fn tlb_flush_all() {
    // SAFETY: bare sfence.vma invalidates all entries.
    unsafe {
        core::arch::asm!("sfence.vma zero, zero");
    }
}

/// SRET into user mode with the given frame.
pub fn enter_user_mode(regs: &super::UserRegs) -> ! {
    use riscv::register::{sepc, sstatus};

    // SAFETY: sets previous-privilege to U, previous-IE on, then sret.
    unsafe {
        sstatus::set_spp(sstatus::SPP::User);
        sstatus::set_spie();
        sepc::write(regs.pc as usize);
        core::arch::asm!(
            "mv sp, {sp}",
            "mv a0, {a0}",
            "mv a1, {a1}",
            "mv a2, {a2}",
            "sret",
            sp = in(reg) regs.sp,
            a0 = in(reg) regs.args[0],
            a1 = in(reg) regs.args[1],
            a2 = in(reg) regs.args[2],
            options(noreturn),
        );
    }
}
