//! Kernel-to-kernel context switch (callee-saved registers only).

use core::arch::naked_asm;

/// Callee-saved register frame for a suspended kernel context.
#[derive(Debug, Default)]
#[repr(C)]
pub struct Context {
    pub sp: u64,
    pub ra: u64,
    pub s: [u64; 12],
}

impl Context {
    /// Build the initial frame of a kernel thread; the first switch into
    /// it enters the bootstrap shim, which balances the dispatcher's
    /// preemption hold and then runs `entry(arg)`. `arg` travels in s0,
    /// the entry pointer in s1.
    pub fn new_kthread(entry: extern "C" fn(usize) -> !, arg: usize, stack_top: u64) -> Self {
        let mut ctx = Self {
            sp: stack_top & !0xF,
            ra: kthread_trampoline as usize as u64,
            ..Self::default()
        };
        ctx.s[0] = arg as u64;
        ctx.s[1] = entry as usize as u64;
        ctx
    }
}

#[unsafe(naked)]
extern "C" fn kthread_trampoline() -> ! {
    naked_asm!(
        "mv a0, s0",
        "mv a1, s1",
        "call {bootstrap}",
        // the bootstrap is divergent; trap hard if it ever returns
        "unimp",
        bootstrap = sym crate::sched::kthread_bootstrap,
    );
}

/// Swap kernel contexts.
///
/// # Safety
///
/// Same contract as the x86_64 version: both pointers must reference valid
/// [`Context`] storage.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(old: *mut Context, new: *const Context) {
    naked_asm!(
        "sd sp,  0*8(a0)",
        "sd ra,  1*8(a0)",
        "sd s0,  2*8(a0)",
        "sd s1,  3*8(a0)",
        "sd s2,  4*8(a0)",
        "sd s3,  5*8(a0)",
        "sd s4,  6*8(a0)",
        "sd s5,  7*8(a0)",
        "sd s6,  8*8(a0)",
        "sd s7,  9*8(a0)",
        "sd s8, 10*8(a0)",
        "sd s9, 11*8(a0)",
        "sd s10,12*8(a0)",
        "sd s11,13*8(a0)",
        "ld sp,  0*8(a1)",
        "ld ra,  1*8(a1)",
        "ld s0,  2*8(a1)",
        "ld s1,  3*8(a1)",
        "ld s2,  4*8(a1)",
        "ld s3,  5*8(a1)",
        "ld s4,  6*8(a1)",
        "ld s5,  7*8(a1)",
        "ld s6,  8*8(a1)",
        "ld s7,  9*8(a1)",
        "ld s8, 10*8(a1)",
        "ld s9, 11*8(a1)",
        "ld s10,12*8(a1)",
        "ld s11,13*8(a1)",
        "ret",
    );
}
