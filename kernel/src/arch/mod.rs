//! Architecture abstraction layer.
//!
//! Everything the portable kernel needs from the CPU is funneled through the
//! free functions here: interrupt gating, TLB maintenance, the context
//! switch, and the timer tick source. Each is an intrinsic-like touchpoint;
//! the portable code never emits assembly itself.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod riscv64;

pub mod timer;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use self::x86_64 as imp;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
use self::riscv64 as imp;

#[cfg(not(target_os = "none"))]
mod host;
#[cfg(not(target_os = "none"))]
use self::host as imp;

pub use imp::{Context, IrqFlags};

/// Halt the CPU until the next interrupt.
#[inline]
pub fn halt() {
    imp::halt();
}

/// Enable external interrupts.
#[inline]
pub fn enable_interrupts() {
    imp::enable_interrupts();
}

/// Disable external interrupts.
#[inline]
pub fn disable_interrupts() {
    imp::disable_interrupts();
}

/// Whether external interrupts are currently enabled.
#[inline]
pub fn are_interrupts_enabled() -> bool {
    imp::are_interrupts_enabled()
}

/// Disable interrupts and return the previous state for [`irq_restore`].
#[inline]
pub fn irq_save() -> IrqFlags {
    imp::irq_save()
}

/// Restore the interrupt state saved by [`irq_save`].
#[inline]
pub fn irq_restore(flags: IrqFlags) {
    imp::irq_restore(flags);
}

/// Invalidate the TLB entry covering `vaddr`.
#[inline]
pub fn tlb_flush(vaddr: u64) {
    imp::tlb_flush(vaddr);
}

/// Invalidate the whole TLB (address-space switch).
#[inline]
pub fn tlb_flush_all() {
    imp::tlb_flush_all();
}

/// Swap kernel contexts: save into `old`, resume `new`.
///
/// # Safety
///
/// Both pointers must reference valid [`Context`] storage; `new` must have
/// been initialized by a previous switch or by `Context::new_kthread`.
#[inline]
pub unsafe fn context_switch(old: *mut Context, new: *const Context) {
    // SAFETY: forwarded contract.
    unsafe { imp::context_switch(old, new) }
}

// ---------------------------------------------------------------------------
// Saved user-mode register frame
// ---------------------------------------------------------------------------

/// Portable view of the register frame saved on kernel entry from user mode.
///
/// The arch trap stubs translate their native layout into this shape, so the
/// process layer (fork's return-value split, signal frames, exec) stays
/// architecture-free.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserRegs {
    /// Program counter to resume at.
    pub pc: u64,
    /// User stack pointer.
    pub sp: u64,
    /// Syscall return-value register (rax / a0).
    pub ret: u64,
    /// First three argument registers, kept for syscall restart.
    pub args: [u64; 3],
    /// Arch flags word (rflags / sstatus bits relevant to user mode).
    pub flags: u64,
}

impl UserRegs {
    /// Set the value the user code observes as the syscall result.
    #[inline]
    pub fn set_syscall_ret(&mut self, val: u64) {
        self.ret = val;
    }
}

/// Drop to user mode with the given register frame. Never returns.
pub fn enter_user_mode(regs: &UserRegs) -> ! {
    imp::enter_user_mode(regs)
}
