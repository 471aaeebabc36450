//! Tasks: the schedulable unit.
//!
//! The task set is an arena keyed by tid (a balanced tree, so `get_task` is
//! O(log n)); all cross-references between tasks are tids, never pointers.
//! User pids live in `1..MAX_PID`; kernel threads (the idle task included)
//! get tids from a disjoint high range so the two never collide.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::{Context, UserRegs};
use crate::config::{KERNEL_STACK_PAGES, MAX_PID, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::mm::frame::FRAME_ALLOCATOR;
use crate::mm::{paging, VirtAddr};
use crate::sync::wobj::WaitObj;

pub type Tid = u32;
pub type Pid = u32;

/// First tid handed to kernel threads.
pub const KTHREAD_TID_BASE: Tid = 10_000;

/// Tid of the boot context, registered at scheduler init.
pub const MAIN_TID: Tid = KTHREAD_TID_BASE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Runnable,
    Running,
    Sleeping,
    Zombie,
}

/// A kernel stack with one unmapped guard page on each side.
pub struct KernelStack {
    /// Start of the reservation (the low guard page).
    base: VirtAddr,
    pages: usize,
}

impl KernelStack {
    /// Reserve `KERNEL_STACK_PAGES` + 2 guard pages of hi-vmem and map the
    /// inner pages.
    pub fn alloc() -> KernelResult<Self> {
        let pages = KERNEL_STACK_PAGES;
        let base = paging::hi_vmem_reserve((pages + 2) * PAGE_SIZE)?;

        let mut dummy = paging::PageDirectory::new();
        for i in 0..pages {
            let va = VirtAddr::new(base.as_u64() + ((i + 1) * PAGE_SIZE) as u64);
            let pa = FRAME_ALLOCATOR.lock().alloc_page().ok_or(KernelError::OutOfMemory)?;
            if let Err(e) = paging::map_page(&mut dummy, va, pa, paging::PteFlags::RW) {
                FRAME_ALLOCATOR.lock().free_page(pa);
                paging::unmap_pages_permissive(
                    &mut dummy,
                    VirtAddr::new(base.as_u64() + PAGE_SIZE as u64),
                    i,
                    true,
                );
                paging::hi_vmem_release(base, (pages + 2) * PAGE_SIZE);
                return Err(e);
            }
        }

        Ok(Self { base, pages })
    }

    /// Top of the usable stack (grows down from here).
    pub fn top(&self) -> u64 {
        self.base.as_u64() + ((self.pages + 1) * PAGE_SIZE) as u64
    }

    pub fn free(self) {
        let mut dummy = paging::PageDirectory::new();
        paging::unmap_pages_permissive(
            &mut dummy,
            VirtAddr::new(self.base.as_u64() + PAGE_SIZE as u64),
            self.pages,
            true,
        );
        paging::hi_vmem_release(self.base, (self.pages + 2) * PAGE_SIZE);
    }
}

/// The task control block.
pub struct Task {
    pub tid: Tid,
    pub state: TaskState,
    /// What this task sleeps on, if anything.
    pub wobj: WaitObj,
    /// Tick deadline of the armed wakeup timer, if any.
    pub wakeup_timer: Option<u64>,
    /// Encoded exit status, valid once `Zombie`.
    pub exit_wstatus: i32,
    /// Kernel stack; `None` only for the boot context (it runs on the boot
    /// stack) and after reaping.
    pub kernel_stack: Option<KernelStack>,
    /// Saved kernel context for the dispatcher.
    pub context: Context,
    /// Saved user-mode register frame; `None` for kernel threads.
    pub user_regs: Option<UserRegs>,
    /// Owning process, if this is a user task.
    pub process: Option<Pid>,
    /// Remaining time slice, in ticks.
    pub time_slice: u32,
    /// Total ticks this task has run.
    pub total_ticks: u64,
    /// Tids blocked in `waitpid`/`kthread_join` on this task's exit.
    pub exit_waiters: Vec<Tid>,
    /// vfork parent protocol: this task is stopped until its child execs
    /// or exits.
    pub vfork_stopped: bool,
    /// Stack of fault-resumable catch frames; the trap path consults the
    /// top entry.
    pub fault_frames: Vec<crate::fault::CatchFrame>,
}

impl Task {
    pub fn new(tid: Tid) -> Self {
        Self {
            tid,
            state: TaskState::Runnable,
            wobj: WaitObj::None,
            wakeup_timer: None,
            exit_wstatus: 0,
            kernel_stack: None,
            context: Context::default(),
            user_regs: None,
            process: None,
            time_slice: crate::config::sched_quantum(),
            total_ticks: 0,
            exit_waiters: Vec::new(),
            vfork_stopped: false,
            fault_frames: Vec::new(),
        }
    }

    pub fn is_kernel_thread(&self) -> bool {
        self.process.is_none()
    }
}

static NEXT_KTHREAD_TID: AtomicU32 = AtomicU32::new(KTHREAD_TID_BASE);
static NEXT_PID_HINT: AtomicU32 = AtomicU32::new(1);

/// Allocate a kernel-thread tid.
pub fn alloc_kthread_tid() -> Tid {
    NEXT_KTHREAD_TID.fetch_add(1, Ordering::Relaxed)
}

/// Allocate a user pid: scan from the hint, wrapping once, skipping pids
/// still present in the task table (zombies included).
pub fn alloc_pid(tasks: &BTreeMap<Tid, Task>) -> KernelResult<Pid> {
    let start = NEXT_PID_HINT.load(Ordering::Relaxed);

    for i in 0..MAX_PID {
        let pid = (start + i - 1) % MAX_PID + 1;
        if !tasks.contains_key(&pid) {
            NEXT_PID_HINT.store(pid % MAX_PID + 1, Ordering::Relaxed);
            return Ok(pid);
        }
    }

    Err(KernelError::PidExhausted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_allocation_skips_live_pids() {
        let mut tasks = BTreeMap::new();
        let p1 = alloc_pid(&tasks).unwrap();
        tasks.insert(p1, Task::new(p1));
        let p2 = alloc_pid(&tasks).unwrap();
        assert_ne!(p1, p2);
        assert!(p1 >= 1 && p1 < MAX_PID);
        assert!(p2 >= 1 && p2 < MAX_PID);
    }

    #[test]
    fn test_kthread_tids_disjoint_from_pids() {
        let t = alloc_kthread_tid();
        assert!(t >= KTHREAD_TID_BASE);
        assert!(MAX_PID < KTHREAD_TID_BASE);
    }

    #[test]
    fn test_kernel_stack_has_guard_gap() {
        crate::mm::test_support::mm_test_init();
        let s1 = KernelStack::alloc().unwrap();
        let s2 = KernelStack::alloc().unwrap();

        // The guard page right below the stack top region must not be
        // mapped; the inner pages must be.
        let pd = paging::PageDirectory::new();
        assert!(!paging::is_mapped(&pd, s1.base));
        assert!(paging::is_mapped(
            &pd,
            VirtAddr::new(s1.base.as_u64() + PAGE_SIZE as u64)
        ));
        assert!(!paging::is_mapped(&pd, VirtAddr::new(s1.top())));
        assert!(paging::is_mapped(&pd, VirtAddr::new(s1.top() - 1)));

        assert_ne!(s1.top(), s2.top());
        s1.free();
        s2.free();
    }
}
