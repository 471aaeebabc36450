//! Fault handling: the resumable-call frames and page-fault routing.
//!
//! A fault-resumable call pushes a catch frame naming the fault vectors it
//! can absorb; inner code reports a catchable fault by returning it. The
//! frame restores the preemption counter to its push-time value, which is
//! the contract the rest of the kernel relies on. The hardware trap path
//! consults the same top-of-stack frame.
//!
//! Page faults route in order: COW resolution, then a user signal, then —
//! for kernel-context faults outside any catch frame — a panic.

use crate::mm::paging;
use crate::mm::VirtAddr;
use crate::process;
use crate::process::signal::SIGSEGV;
use crate::sched;

/// Page-fault vector number (the x86 numbering, used as the generic one).
pub const FAULT_PAGE: u32 = 14;
/// Division error.
pub const FAULT_DIV0: u32 = 0;
/// Invalid opcode.
pub const FAULT_ILL: u32 = 6;
/// General protection.
pub const FAULT_GP: u32 = 13;

/// One pushed catch frame.
#[derive(Debug, Clone, Copy)]
pub struct CatchFrame {
    /// Bitmask of fault vectors this frame absorbs (bit n = vector n).
    pub mask: u32,
    /// Preemption-disable depth to restore after a catch.
    pub saved_preempt_count: u32,
}

/// Run `f` with the given fault mask armed. Returns 0 if `f` completed, or
/// the bitmask of the caught fault. After a catch, the preemption counter
/// is back at its value from before the call.
pub fn fault_resumable_call(mask: u32, f: impl FnOnce() -> Result<(), u32>) -> u32 {
    let tid = sched::current_tid();
    let frame = CatchFrame {
        mask,
        saved_preempt_count: sched::disable_preemption_count(),
    };
    sched::with_task(tid, |t| t.fault_frames.push(frame));

    let res = f();

    let frame = sched::with_task(tid, |t| t.fault_frames.pop())
        .flatten()
        .expect("catch frame stack underflow");

    match res {
        Ok(()) => 0,
        Err(vector) => {
            assert!(
                frame.mask & (1 << vector) != 0,
                "fault {} escaped its resumable frame",
                vector
            );
            sched::restore_preempt_count(frame.saved_preempt_count);
            1 << vector
        }
    }
}

/// Whether the current task is inside a frame that absorbs `vector`.
pub fn is_fault_resumable(vector: u32) -> bool {
    sched::with_task(sched::current_tid(), |t| {
        t.fault_frames
            .last()
            .map(|f| f.mask & (1 << vector) != 0)
            .unwrap_or(false)
    })
    .unwrap_or(false)
}

/// Outcome of a page fault, for the trap stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultOutcome {
    /// Resolved (COW); retry the access.
    Resolved,
    /// A signal was raised against the faulting process.
    SignalRaised,
    /// The fault belongs to an armed resumable frame.
    Resumable,
    /// Nothing could absorb it: kernel bug.
    Fatal,
}

/// Handle a page fault at `fault_va` (`user_mode`: CPL at fault time).
///
/// `Resolved` means the logical translation is now valid (COW done or a
/// demand-install case); the arch layer refreshes its hardware view and
/// retries the access.
pub fn handle_page_fault(fault_va: u64, write: bool, user_mode: bool) -> PageFaultOutcome {
    // Write-protection faults may be COW work.
    if write {
        if let Some(proc) = process::current_process() {
            let mut mu = proc.mu.lock();
            if paging::handle_potential_cow(&mut mu.pdir, VirtAddr::new(fault_va)) {
                return PageFaultOutcome::Resolved;
            }
        }
    }

    // Valid in the logical directory but missing from the hardware shadow:
    // the access is fine, the translation just needs installing.
    if let Some(proc) = process::current_process() {
        let mu = proc.mu.lock();
        if let Some((_, flags)) = paging::translate(&mu.pdir, VirtAddr::new(fault_va)) {
            let perms_ok = (!write || flags.contains(paging::PteFlags::RW))
                && (!user_mode || flags.contains(paging::PteFlags::USER));
            if perms_ok {
                return PageFaultOutcome::Resolved;
            }
        }
    }

    // Kernel-half demand install: hi-vmem heap chunks are mapped logically
    // first and reach the hardware tables through this path.
    if !user_mode {
        if let Some((_, flags)) = paging::kernel_translate(VirtAddr::new(fault_va)) {
            if !write || flags.contains(paging::PteFlags::RW) {
                return PageFaultOutcome::Resolved;
            }
        }
    }

    if user_mode {
        let pid = sched::current_tid();
        let _ = process::signal::send_signal(pid, SIGSEGV);
        return PageFaultOutcome::SignalRaised;
    }

    if is_fault_resumable(FAULT_PAGE) {
        return PageFaultOutcome::Resumable;
    }

    PageFaultOutcome::Fatal
}
