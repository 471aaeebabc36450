//! Host-target stand-ins so the portable kernel logic links and runs under
//! the ordinary `#[test]` harness. Nothing here touches hardware.

use core::sync::atomic::{AtomicBool, Ordering};

static FAKE_IF: AtomicBool = AtomicBool::new(true);

/// Saved interrupt state.
#[derive(Debug, Clone, Copy)]
pub struct IrqFlags(pub bool);

/// Kernel-context storage. Unused on the host: tests never really switch.
#[derive(Debug, Default)]
#[repr(C)]
pub struct Context {
    _opaque: [u64; 8],
}

impl Context {
    pub fn new_kthread(_entry: extern "C" fn(usize) -> !, _arg: usize, _stack_top: u64) -> Self {
        Self::default()
    }
}

pub fn halt() {
    core::hint::spin_loop();
}

pub fn enable_interrupts() {
    FAKE_IF.store(true, Ordering::Relaxed);
}

pub fn disable_interrupts() {
    FAKE_IF.store(false, Ordering::Relaxed);
}

pub fn are_interrupts_enabled() -> bool {
    FAKE_IF.load(Ordering::Relaxed)
}

pub fn irq_save() -> IrqFlags {
    let was = FAKE_IF.swap(false, Ordering::Relaxed);
    IrqFlags(was)
}

pub fn irq_restore(flags: IrqFlags) {
    FAKE_IF.store(flags.0, Ordering::Relaxed);
}

pub fn tlb_flush(_vaddr: u64) {}

pub fn tlb_flush_all() {}

/// # Safety
///
/// Never actually switches on the host; provided so the dispatcher compiles.
pub unsafe fn context_switch(_old: *mut Context, _new: *const Context) {}

pub fn enter_user_mode(_regs: &super::UserRegs) -> ! {
    unreachable!("no user mode on the host target");
}
