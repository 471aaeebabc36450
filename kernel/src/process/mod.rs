//! Processes: the resource container around one user task.
//!
//! The table maps pid → `Arc<Process>`; the task side (scheduling state,
//! kernel stack, saved registers) lives in the scheduler arena under the
//! same id. Mutable process state sits behind an inner spin lock; the
//! recursive `fs_lock` serializes the slower handle/cwd/brk paths that may
//! sleep.

pub mod exec;
pub mod exit;
pub mod fork;
pub mod memory;
pub mod signal;
pub mod wait;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex as SpinMutex;

use crate::config::{MAX_HANDLES, USER_MMAP_BASE, USER_MMAP_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::fs::Handle;
use crate::mm::kmalloc::{BackingMode, Heap};
use crate::mm::paging::PageDirectory;
use crate::sched::{self, Pid, Tid};
use crate::sync::KMutex;
use self::signal::{SigAction, NSIG};

/// Pid of the init process; orphans are reparented to it.
pub const INIT_PID: Pid = 1;

/// Mutable process state.
pub struct ProcMut {
    pub pgid: Pid,
    pub pdir: PageDirectory,
    pub cwd: String,
    pub handles: [Option<Handle>; MAX_HANDLES],
    pub children: Vec<Pid>,
    pub brk: u64,
    pub initial_brk: u64,
    /// Metadata heap carving the per-process anonymous-mmap window.
    pub mmap_heap: Option<Heap>,
    pub vforked: bool,
    pub did_exec: bool,
    pub sig_handlers: [SigAction; NSIG],
    pub sig_pending: u64,
    /// Register snapshot taken when a signal handler was entered; restored
    /// by sigreturn.
    pub sig_saved_regs: Option<crate::arch::UserRegs>,
}

pub struct Process {
    pub pid: Pid,
    /// Parent pid; changes on reparenting, hence atomic.
    pub ppid: AtomicU32,
    /// Guards the handle table, cwd, mappings and brk across sleeps.
    pub fs_lock: KMutex,
    pub mu: SpinMutex<ProcMut>,
}

impl Process {
    /// A fresh process with empty address space and handle table.
    pub fn new(pid: Pid, ppid: Pid, pgid: Pid) -> Self {
        Self {
            pid,
            ppid: AtomicU32::new(ppid),
            fs_lock: KMutex::new(true),
            mu: SpinMutex::new(ProcMut {
                pgid,
                pdir: PageDirectory::new(),
                cwd: String::from("/"),
                handles: [const { None }; MAX_HANDLES],
                children: Vec::new(),
                brk: 0,
                initial_brk: 0,
                mmap_heap: None,
                vforked: false,
                did_exec: false,
                sig_handlers: [SigAction::Default; NSIG],
                sig_pending: 0,
                sig_saved_regs: None,
            }),
        }
    }

    pub fn ppid(&self) -> Pid {
        self.ppid.load(Ordering::Relaxed)
    }

    pub fn set_ppid(&self, ppid: Pid) {
        self.ppid.store(ppid, Ordering::Relaxed);
    }

    pub fn pgid(&self) -> Pid {
        self.mu.lock().pgid
    }

    /// Create the anonymous-mmap heap on first use.
    pub fn ensure_mmap_heap(mu: &mut ProcMut) -> KernelResult<()> {
        if mu.mmap_heap.is_none() {
            let h = Heap::new(
                USER_MMAP_BASE,
                USER_MMAP_SIZE as usize,
                crate::config::PAGE_SIZE,
                0,
                BackingMode::None,
            )?;
            mu.mmap_heap = Some(h);
        }
        Ok(())
    }

    /// Find a free handle slot, `Err(TooManyHandles)` if the table is full.
    pub fn install_handle(mu: &mut ProcMut, h: Handle) -> KernelResult<usize> {
        for (i, slot) in mu.handles.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(h);
                return Ok(i);
            }
        }
        Err(KernelError::TooManyHandles)
    }
}

static PROCESS_TABLE: SpinMutex<BTreeMap<Pid, Arc<Process>>> = SpinMutex::new(BTreeMap::new());

pub fn get_process(pid: Pid) -> Option<Arc<Process>> {
    PROCESS_TABLE.lock().get(&pid).cloned()
}

pub fn add_process(p: Arc<Process>) {
    let prev = PROCESS_TABLE.lock().insert(p.pid, p);
    assert!(prev.is_none(), "pid reuse while process alive");
}

pub fn remove_process(pid: Pid) -> Option<Arc<Process>> {
    PROCESS_TABLE.lock().remove(&pid)
}

/// The process the current task belongs to, if it has one.
pub fn current_process() -> Option<Arc<Process>> {
    let pid = sched::with_task(sched::current_tid(), |t| t.process)??;
    get_process(pid)
}

/// The process a given task belongs to.
pub fn process_of(tid: Tid) -> Option<Arc<Process>> {
    let pid = sched::with_task(tid, |t| t.process)??;
    get_process(pid)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::sched::{Task, TaskState};

    /// Build a process + its main task in the given state, bypassing fork.
    /// Returns the pid (== tid).
    pub fn spawn_process(ppid: Pid, state: TaskState) -> Pid {
        crate::sched::test_support::sched_test_init();
        let pid =
            sched::with_scheduler(|s| crate::sched::task::alloc_pid(s.tasks())).expect("pid");

        let mut t = Task::new(pid);
        t.state = state;
        t.process = Some(pid);
        t.user_regs = Some(Default::default());
        sched::add_task(t);

        let p = Arc::new(Process::new(pid, ppid, pid));
        add_process(Arc::clone(&p));

        if let Some(parent) = get_process(ppid) {
            parent.mu.lock().children.push(pid);
        }
        pid
    }

    /// Drop a test process and its task, regardless of state.
    pub fn scrap_process(pid: Pid) {
        if let Some(p) = remove_process(pid) {
            if let Some(parent) = get_process(p.ppid()) {
                parent.mu.lock().children.retain(|&c| c != pid);
            }
        }
        sched::with_task(pid, |t| t.state = TaskState::Zombie);
        sched::remove_task(pid);
    }
}
