//! Signals.
//!
//! Each process keeps a handler table and a pending mask. Delivery points:
//! the return-to-user edge, and blocking syscalls (which then fail with the
//! interrupted error). Synchronous faults raise their signal from the
//! fault handler. Handler invocation snapshots the interrupted register
//! frame; `sigreturn` restores it.

use crate::error::{KernelError, KernelResult};
use crate::sched::{self, Pid, TaskState};

pub const NSIG: usize = 32;

pub const SIGHUP: usize = 1;
pub const SIGINT: usize = 2;
pub const SIGQUIT: usize = 3;
pub const SIGILL: usize = 4;
pub const SIGABRT: usize = 6;
pub const SIGBUS: usize = 7;
pub const SIGFPE: usize = 8;
pub const SIGKILL: usize = 9;
pub const SIGSEGV: usize = 11;
pub const SIGPIPE: usize = 13;
pub const SIGTERM: usize = 15;
pub const SIGCHLD: usize = 17;
pub const SIGCONT: usize = 18;
pub const SIGSTOP: usize = 19;

/// Disposition of one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigAction {
    #[default]
    Default,
    Ignore,
    /// User-space handler entry point.
    Handler(u64),
}

/// Signals whose default disposition is to ignore.
fn default_ignores(sig: usize) -> bool {
    matches!(sig, SIGCHLD | SIGCONT)
}

/// Post `sig` to `pid`. Wakes the target if it sleeps in an interruptible
/// wait so the syscall can bail out with the interrupted error.
pub fn send_signal(pid: Pid, sig: usize) -> KernelResult<()> {
    if sig == 0 || sig >= NSIG {
        return Err(KernelError::InvalidArgument { name: "sig" });
    }

    let proc = super::get_process(pid).ok_or(KernelError::ProcessNotFound { pid })?;

    {
        let mut mu = proc.mu.lock();
        // SIGKILL and SIGSTOP cannot be ignored or caught.
        let act = mu.sig_handlers[sig];
        if sig != SIGKILL && sig != SIGSTOP {
            if act == SigAction::Ignore || (act == SigAction::Default && default_ignores(sig)) {
                return Ok(());
            }
        }
        mu.sig_pending |= 1 << sig;
    }

    // Interrupt a blocked task: waitpid & friends observe the pending bit
    // after waking and return the interrupted error.
    let _g = sched::PreemptGuard::new();
    if sched::get_task_state(pid) == Some(TaskState::Sleeping) {
        sched::task_reset_wait_obj(pid);
    }
    Ok(())
}

/// Take the lowest pending signal, clearing its bit.
pub fn fetch_pending(proc: &super::Process) -> Option<usize> {
    let mut mu = proc.mu.lock();
    if mu.sig_pending == 0 {
        return None;
    }
    let sig = mu.sig_pending.trailing_zeros() as usize;
    mu.sig_pending &= !(1u64 << sig);
    Some(sig)
}

pub fn has_pending(proc: &super::Process) -> bool {
    proc.mu.lock().sig_pending != 0
}

/// Install a handler (the `sigaction` core). SIGKILL/SIGSTOP refuse.
pub fn set_handler(proc: &super::Process, sig: usize, act: SigAction) -> KernelResult<SigAction> {
    if sig == 0 || sig >= NSIG || sig == SIGKILL || sig == SIGSTOP {
        return Err(KernelError::InvalidArgument { name: "sig" });
    }
    let mut mu = proc.mu.lock();
    let old = mu.sig_handlers[sig];
    mu.sig_handlers[sig] = act;
    Ok(old)
}

/// What delivery decided to do; the dispatcher acts on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    None,
    /// Process terminated by `sig`.
    Terminated(usize),
    /// A user handler frame was set up.
    HandlerEntered(usize),
}

/// Deliver one pending signal on the return-to-user edge of `pid`'s main
/// task.
pub fn deliver_pending(pid: Pid) -> Delivery {
    let Some(proc) = super::get_process(pid) else {
        return Delivery::None;
    };
    let Some(sig) = fetch_pending(&proc) else {
        return Delivery::None;
    };

    let act = proc.mu.lock().sig_handlers[sig];

    match act {
        SigAction::Ignore => Delivery::None,
        SigAction::Default => {
            if default_ignores(sig) {
                Delivery::None
            } else {
                // Default action of everything else in scope: terminate.
                super::exit::terminate(pid, encode_signaled(sig));
                Delivery::Terminated(sig)
            }
        }
        SigAction::Handler(entry) => {
            // Snapshot the interrupted frame; sigreturn restores it. The
            // handler runs with the signal number in the argument
            // register, on a 128-byte-offset stack (red zone skip).
            sched::with_task(pid, |t| {
                if let Some(regs) = t.user_regs.as_mut() {
                    proc.mu.lock().sig_saved_regs = Some(*regs);
                    regs.pc = entry;
                    regs.sp = (regs.sp - 128) & !0xF;
                    regs.args[0] = sig as u64;
                }
            });
            Delivery::HandlerEntered(sig)
        }
    }
}

/// Restore the frame interrupted by a caught signal.
pub fn sys_sigreturn(pid: Pid) -> KernelResult<()> {
    let proc = super::get_process(pid).ok_or(KernelError::ProcessNotFound { pid })?;
    let saved = proc
        .mu
        .lock()
        .sig_saved_regs
        .take()
        .ok_or(KernelError::InvalidArgument { name: "sigreturn" })?;

    sched::with_task(pid, |t| t.user_regs = Some(saved));
    Ok(())
}

/// wstatus encoding for death-by-signal.
pub fn encode_signaled(sig: usize) -> i32 {
    (sig as i32) & 0x7F
}
