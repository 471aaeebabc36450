//! Process termination.

use crate::sched::{self, TaskState, Tid};
use crate::sync::wobj::WaitObj;

use super::signal::SIGCHLD;
use super::wait::should_skip_child;
use super::INIT_PID;

/// Encode a normal exit for wstatus.
pub fn encode_exited(code: i32) -> i32 {
    (code & 0xFF) << 8
}

/// Terminate the process whose main task is `tid` with an already-encoded
/// wstatus: release handles, free the user half, reparent children, wake
/// waiters, go zombie. The task and process objects stay until reaped.
pub fn terminate(tid: Tid, wstatus: i32) {
    let _g = sched::PreemptGuard::new();

    let proc = match super::get_process(tid) {
        Some(p) => p,
        None => return,
    };

    // Release handles and tear down the user address space. The pdir
    // object itself lives until reap (the kernel half stays usable).
    {
        let mut mu = proc.mu.lock();
        for slot in mu.handles.iter_mut() {
            *slot = None;
        }
        crate::mm::paging::pdir_destroy(&mut mu.pdir);
        mu.mmap_heap = None;

        // Orphans go to init.
        let children = core::mem::take(&mut mu.children);
        drop(mu);

        for child in children {
            if let Some(cp) = super::get_process(child) {
                cp.set_ppid(if super::get_process(INIT_PID).is_some() {
                    INIT_PID
                } else {
                    0
                });
                if let Some(init) = super::get_process(INIT_PID) {
                    init.mu.lock().children.push(child);
                }
            }
        }
    }

    // vfork protocol: a vforked child releases its stopped parent on exit.
    let ppid = proc.ppid();
    if proc.mu.lock().vforked {
        sched::with_task(ppid, |t| {
            t.vfork_stopped = false;
        });
    }

    // Go zombie and wake everyone interested.
    let waiters = sched::with_task(tid, |t| {
        t.state = TaskState::Zombie;
        t.exit_wstatus = wstatus;
        core::mem::take(&mut t.exit_waiters)
    })
    .unwrap_or_default();

    for w in waiters {
        if sched::get_task_state(w) == Some(TaskState::Sleeping) {
            sched::task_reset_wait_obj(w);
        }
    }

    // A parent blocked on an any-child style wait is woken if the filter
    // matches this child.
    if ppid > 0 {
        let matches = sched::with_task(ppid, |t| {
            if t.state != TaskState::Sleeping {
                return false;
            }
            match t.wobj {
                WaitObj::Task(filter) if filter < 0 || filter == 0 => {
                    let waiter_pgid = super::get_process(ppid).map(|p| p.pgid()).unwrap_or(0);
                    !should_skip_child(waiter_pgid, &proc, filter)
                }
                _ => false,
            }
        })
        .unwrap_or(false);

        if matches {
            sched::task_reset_wait_obj(ppid);
        }

        let _ = super::signal::send_signal(ppid, SIGCHLD);
    }
}

/// `exit(code)`: terminate the calling process and never return.
pub fn do_exit(code: i32) -> ! {
    let tid = sched::current_tid();
    terminate(tid, encode_exited(code));

    loop {
        sched::schedule();
        crate::arch::halt();
    }
}
