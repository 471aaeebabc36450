//! fork and vfork.

use alloc::sync::Arc;

use crate::arch;
use crate::config;
use crate::error::{KernelError, KernelResult};
use crate::mm::paging;
use crate::sched::{self, task::KernelStack, Pid, Task, TaskState, Tid};

use super::{add_process, Process};

fn fork_inner(me: Tid, proc: &Arc<Process>, vfork: bool) -> KernelResult<Pid> {
    let pid = sched::with_scheduler(|s| crate::sched::task::alloc_pid(s.tasks()))?;

    // Clone the address space. COW by default; eager copy when disabled.
    let mut mu = proc.mu.lock();
    let new_pdir = if config::fork_no_cow() {
        paging::pdir_deep_clone(&mu.pdir)?
    } else {
        paging::pdir_clone(&mut mu.pdir)
    };

    let child_proc = Arc::new(Process::new(pid, proc.pid, mu.pgid));
    {
        let mut cmu = child_proc.mu.lock();
        cmu.pdir = new_pdir;
        cmu.cwd = mu.cwd.clone();
        cmu.brk = mu.brk;
        cmu.initial_brk = mu.initial_brk;
        cmu.mmap_heap = mu.mmap_heap.as_ref().map(|h| h.dup());
        cmu.sig_handlers = mu.sig_handlers;
        cmu.vforked = vfork;

        // Duplicate every open handle (same open file, refcount bumped).
        for (i, h) in mu.handles.iter().enumerate() {
            cmu.handles[i] = h.as_ref().map(|h| h.dup());
        }
    }
    mu.children.push(pid);
    drop(mu);

    // Child task: own kernel stack, parent's trap frame with ret = 0.
    let stack = match KernelStack::alloc() {
        Ok(s) => s,
        Err(e) => {
            let mut cmu = child_proc.mu.lock();
            paging::pdir_destroy(&mut cmu.pdir);
            drop(cmu);
            proc.mu.lock().children.retain(|&c| c != pid);
            return Err(e);
        }
    };

    let mut child = Task::new(pid);
    let mut regs = sched::with_task(me, |t| t.user_regs).flatten().unwrap_or_default();
    regs.set_syscall_ret(0);
    child.user_regs = Some(regs);
    child.process = Some(pid);
    child.context =
        arch::Context::new_kthread(super::exec::user_mode_entry, pid as usize, stack.top());
    child.kernel_stack = Some(stack);
    child.state = TaskState::Runnable;

    // Parent observes the child pid.
    sched::with_task(me, |t| {
        if let Some(r) = t.user_regs.as_mut() {
            r.set_syscall_ret(pid as u64);
        }
        if vfork {
            t.vfork_stopped = true;
        }
    });

    add_process(child_proc);
    sched::add_task(child);

    // Reload the (parent's) translations so the stripped RW bits take
    // effect immediately; cheaper than invalidating page by page.
    arch::tlb_flush_all();
    Ok(pid)
}

/// Fork the current process. Returns the child pid (the child itself
/// resumes in user mode with return value 0).
pub fn do_fork(vfork: bool) -> KernelResult<Pid> {
    let me = sched::current_tid();
    let proc = super::current_process().ok_or(KernelError::NotInitialized {
        subsystem: "current process",
    })?;

    sched::disable_preemption();
    let res = fork_inner(me, &proc, vfork);
    sched::enable_preemption();

    let child = res?;

    if vfork {
        // Stay stopped until the child execs or dies. The child exit and
        // exec paths clear the flag and the dispatcher skips us until
        // then.
        #[cfg(target_os = "none")]
        while sched::with_task(me, |t| t.vfork_stopped).unwrap_or(false) {
            sched::kernel_yield();
        }
    }

    Ok(child)
}
