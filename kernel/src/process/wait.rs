//! `waitpid`.
//!
//! The pid argument selects which children qualify:
//! `> 0` exactly that child, `0` any child in the caller's process group,
//! `-1` any child, `< -1` any child in group `-pid`.

use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::error::{KernelError, KernelResult};
use crate::sched::{self, Pid, TaskState};
use crate::sync::wobj::WaitObj;

use super::Process;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WaitOptions: u32 {
        const WNOHANG = 1;
        const WUNTRACED = 2;
        const WCONTINUED = 8;
    }
}

/// Whether `child` is outside the set selected by `pid_arg` for a waiter
/// in process group `waiter_pgid`.
pub fn should_skip_child(waiter_pgid: Pid, child: &Process, pid_arg: i32) -> bool {
    if pid_arg > 0 {
        return child.pid != pid_arg as Pid;
    }
    if pid_arg < -1 {
        return child.pgid() != (-pid_arg) as Pid;
    }
    if pid_arg == 0 {
        return child.pgid() != waiter_pgid;
    }
    // -1: any child qualifies.
    false
}

/// Reap one zombie: free its kernel stack and hardware address space, drop
/// it from the task table, the process table and the parent's children
/// list.
fn reap(parent: &Process, child_pid: Pid) -> i32 {
    let t = sched::remove_task(child_pid).expect("zombie task present");
    let wstatus = t.exit_wstatus;
    if let Some(stack) = t.kernel_stack {
        stack.free();
    }
    crate::mm::paging::note_user_space_dropped(child_pid);
    super::remove_process(child_pid);
    parent.mu.lock().children.retain(|&c| c != child_pid);
    wstatus
}

/// Core of `waitpid`. Returns `Ok(None)` for a WNOHANG miss.
pub fn sys_waitpid(pid_arg: i32, options: WaitOptions) -> KernelResult<Option<(Pid, i32)>> {
    let me = sched::current_tid();
    let proc = super::current_process().ok_or(KernelError::NotInitialized {
        subsystem: "current process",
    })?;
    let my_pgid = proc.pgid();

    loop {
        sched::disable_preemption();

        let children: Vec<Pid> = proc.mu.lock().children.clone();
        let mut matching = 0u32;
        let mut found: Option<Pid> = None;

        for child_pid in children {
            let Some(child) = super::get_process(child_pid) else {
                continue;
            };
            if should_skip_child(my_pgid, &child, pid_arg) {
                continue;
            }
            matching += 1;

            if sched::get_task_state(child_pid) == Some(TaskState::Zombie) {
                found = Some(child_pid);
                break;
            }
        }

        if let Some(child_pid) = found {
            let wstatus = reap(&proc, child_pid);
            sched::enable_preemption();
            return Ok(Some((child_pid, wstatus)));
        }

        // WNOHANG wins even over ECHILD: "nothing yet" is the answer
        // whenever the caller refused to hang.
        if options.contains(WaitOptions::WNOHANG) {
            sched::enable_preemption();
            return Ok(None);
        }

        if matching == 0 {
            sched::enable_preemption();
            return Err(KernelError::NoChildren);
        }

        // Block until a qualifying child changes state. For a specific
        // child we also enqueue on its exit-waiter list; any-child waits
        // are woken from the child's exit path by filter matching.
        if pid_arg > 0 {
            sched::with_task(pid_arg as Pid, |t| t.exit_waiters.push(me));
        }
        sched::task_set_wait_obj(WaitObj::Task(pid_arg), None);
        sched::enable_preemption();
        sched::enter_sleep_wait_state();
        let _ = sched::wobj_reset_current();

        if super::signal::has_pending(&proc) {
            return Err(KernelError::Interrupted);
        }
    }
}

/// Convenience used by the syscall layer and tests: does this process have
/// a reapable zombie right now (without blocking)?
pub fn try_wait_any(proc: &Arc<Process>) -> Option<(Pid, i32)> {
    let _g = sched::PreemptGuard::new();
    let children: Vec<Pid> = proc.mu.lock().children.clone();

    for child_pid in children {
        if sched::get_task_state(child_pid) == Some(TaskState::Zombie) {
            let wstatus = reap(proc, child_pid);
            return Some((child_pid, wstatus));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::exit::{encode_exited, terminate};
    use crate::process::test_support::{scrap_process, spawn_process};
    use crate::process::{get_process, signal};
    use crate::sched::test_support::set_current;

    #[test]
    fn test_should_skip_child_matrix() {
        let parent = spawn_process(0, TaskState::Runnable);
        let child = spawn_process(parent, TaskState::Runnable);
        let cp = get_process(child).unwrap();
        let child_pgid = cp.pgid();

        // pid > 0: exact match only.
        assert!(!should_skip_child(0, &cp, child as i32));
        assert!(should_skip_child(0, &cp, child as i32 + 1));

        // -1: never skipped.
        assert!(!should_skip_child(12345, &cp, -1));

        // 0: group must equal the waiter's.
        assert!(!should_skip_child(child_pgid, &cp, 0));
        assert!(should_skip_child(child_pgid + 1, &cp, 0));

        // < -1: group must equal -pid.
        assert!(!should_skip_child(0, &cp, -(child_pgid as i32)));
        assert!(should_skip_child(0, &cp, -(child_pgid as i32) - 1));

        scrap_process(child);
        scrap_process(parent);
    }

    #[test]
    fn test_waitpid_reaps_zombie_child() {
        // S3 logic: child exits 123, parent's waitpid returns the pid and
        // WEXITSTATUS 123; afterwards the child is fully gone.
        let parent = spawn_process(0, TaskState::Runnable);
        let child = spawn_process(parent, TaskState::Runnable);

        terminate(child, encode_exited(123));

        let prev = sched::current_tid();
        set_current(parent);
        let (pid, st) = sys_waitpid(child as i32, WaitOptions::empty())
            .unwrap()
            .unwrap();
        set_current(prev);

        assert_eq!(pid, child);
        assert_eq!((st >> 8) & 0xFF, 123);

        // Property 6: reaped means unreachable.
        assert!(sched::get_task_state(child).is_none());
        assert!(get_process(child).is_none());
        assert!(!get_process(parent).unwrap().mu.lock().children.contains(&child));

        scrap_process(parent);
    }

    #[test]
    fn test_waitpid_nohang_and_echild() {
        let parent = spawn_process(0, TaskState::Runnable);
        let child = spawn_process(parent, TaskState::Runnable);

        let prev = sched::current_tid();
        set_current(parent);

        // Child alive: WNOHANG reports "nothing yet".
        let r = sys_waitpid(-1, WaitOptions::WNOHANG).unwrap();
        assert!(r.is_none());

        // WNOHANG is checked before the child-count test, so even a wait
        // that matches no child at all reports "nothing yet" rather than
        // ECHILD.
        let r = sys_waitpid(child as i32 + 7, WaitOptions::WNOHANG).unwrap();
        assert!(r.is_none());

        // Without WNOHANG, no matching child means ECHILD.
        let e = sys_waitpid(child as i32 + 7, WaitOptions::empty()).unwrap_err();
        assert_eq!(e, KernelError::NoChildren);

        set_current(prev);

        scrap_process(child);
        scrap_process(parent);
    }

    #[test]
    fn test_waitpid_nohang_with_no_children_at_all() {
        let lonely = spawn_process(0, TaskState::Runnable);

        let prev = sched::current_tid();
        set_current(lonely);

        // Zero children: WNOHANG still returns "nothing yet"...
        let r = sys_waitpid(-1, WaitOptions::WNOHANG).unwrap();
        assert!(r.is_none());

        // ...while a hanging wait is refused with ECHILD.
        let e = sys_waitpid(-1, WaitOptions::empty()).unwrap_err();
        assert_eq!(e, KernelError::NoChildren);

        set_current(prev);
        scrap_process(lonely);
    }

    #[test]
    fn test_waitpid_interrupted_by_signal() {
        let parent = spawn_process(0, TaskState::Runnable);
        let _child = spawn_process(parent, TaskState::Runnable);

        // Pend a signal first: the blocking path notices it after the
        // (host no-op) sleep and bails out with EINTR.
        signal::send_signal(parent, signal::SIGTERM).unwrap();

        let prev = sched::current_tid();
        set_current(parent);
        let e = sys_waitpid(-1, WaitOptions::empty()).unwrap_err();
        set_current(prev);
        assert_eq!(e, KernelError::Interrupted);

        let pc = get_process(parent).unwrap();
        let _ = signal::fetch_pending(&pc);

        scrap_process(_child);
        scrap_process(parent);
    }
}
