//! Kernel-to-kernel context switch.
//!
//! Callee-saved registers plus RFLAGS are kept; caller-saved registers are
//! dead at every switch point because switches happen via an ordinary
//! function call. RFLAGS matters: a task suspended voluntarily (IF set)
//! may be resumed from the timer-interrupt edge (IF clear), and must get
//! its own interrupt state back.

use core::arch::naked_asm;

/// Saved register frame for a suspended kernel context.
#[derive(Debug, Default)]
#[repr(C)]
pub struct Context {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl Context {
    /// Build the initial frame of a kernel thread so that the first switch
    /// into it enters the bootstrap shim, which balances the dispatcher's
    /// preemption hold and then runs `entry(arg)`.
    ///
    /// The trampoline expects `arg` in r12 and the entry pointer in r13.
    pub fn new_kthread(entry: extern "C" fn(usize) -> !, arg: usize, stack_top: u64) -> Self {
        Self {
            rsp: stack_top & !0xF,
            r12: arg as u64,
            r13: entry as usize as u64,
            rip: kthread_trampoline as usize as u64,
            rflags: 0x202, // IF set
            ..Self::default()
        }
    }
}

#[unsafe(naked)]
extern "C" fn kthread_trampoline() -> ! {
    naked_asm!(
        "mov rdi, r12",
        "mov rsi, r13",
        "call {bootstrap}",
        // the bootstrap is divergent; trap hard if it ever returns
        "ud2",
        bootstrap = sym crate::sched::kthread_bootstrap,
    );
}

/// Swap kernel contexts: save the current state into `old` and resume
/// `new`.
///
/// # Safety
///
/// `old` must be writable [`Context`] storage; `new` must hold a frame
/// built by [`Context::new_kthread`] or a previous save.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(old: *mut Context, new: *const Context) {
    naked_asm!(
        // save into *rdi
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x38], rax",
        "pushfq",
        "pop rax",
        "mov [rdi + 0x40], rax",
        // load from *rsi
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "push qword ptr [rsi + 0x40]",
        "popfq",
        "jmp [rsi + 0x38]",
        "2:",
        "ret",
    );
}
