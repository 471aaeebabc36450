//! The scheduler: cooperative-with-preemption, single run queue,
//! priority-less round robin.
//!
//! Each timer tick decrements the running task's remaining slice; at zero a
//! reschedule is requested and taken at the next preemption-enable or
//! return-to-user edge. The dispatcher walks the task tree circularly
//! starting after the current tid and picks the first runnable task, or the
//! idle task if none.

pub mod task;

pub use task::{Pid, Task, TaskState, Tid, KTHREAD_TID_BASE, MAIN_TID};

use alloc::collections::{BTreeMap, VecDeque};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

use crate::arch;
use crate::error::{KernelError, KernelResult};
use crate::sync::wobj::WaitObj;

pub struct Scheduler {
    tasks: BTreeMap<Tid, Task>,
    idle_tid: Tid,
}

impl Scheduler {
    const fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            idle_tid: 0,
        }
    }
}

static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// Tid of the running task; readable from any context.
#[cfg(target_os = "none")]
mod curr {
    use super::{AtomicU32, Ordering, Tid, MAIN_TID};

    static CURR_TID: AtomicU32 = AtomicU32::new(MAIN_TID);

    #[inline]
    pub fn get() -> Tid {
        CURR_TID.load(Ordering::Relaxed)
    }

    pub fn set(tid: Tid) {
        CURR_TID.store(tid, Ordering::Relaxed);
    }
}

/// On the host there is no single CPU: every test thread acts as its own
/// task, lazily registered on first use, so parallel tests do not fight
/// over one global "current".
#[cfg(not(target_os = "none"))]
mod curr {
    extern crate std;

    use super::{Task, TaskState, Tid};
    use core::cell::Cell;

    std::thread_local! {
        static CURR_TID: Cell<Tid> = const { Cell::new(0) };
    }

    pub fn get() -> Tid {
        let tid = CURR_TID.with(|c| c.get());
        if tid != 0 {
            return tid;
        }
        let tid = super::task::alloc_kthread_tid();
        let mut t = Task::new(tid);
        t.state = TaskState::Running;
        super::add_task(t);
        CURR_TID.with(|c| c.set(tid));
        tid
    }

    pub fn set(tid: Tid) {
        CURR_TID.with(|c| c.set(tid));
    }
}

/// Nested preemption-disable counter. Starts at 1: preemption is off until
/// the first task explicitly enables it after boot. Like the current tid,
/// this is per-CPU state, so on the host it is per test thread.
#[cfg(target_os = "none")]
mod preempt {
    use super::{AtomicU32, Ordering};

    static COUNT: AtomicU32 = AtomicU32::new(1);

    pub fn get() -> u32 {
        COUNT.load(Ordering::Relaxed)
    }

    pub fn set(v: u32) {
        COUNT.store(v, Ordering::Relaxed);
    }

    /// Returns the previous value.
    pub fn add(delta: i32) -> u32 {
        if delta >= 0 {
            COUNT.fetch_add(delta as u32, Ordering::Relaxed)
        } else {
            COUNT.fetch_sub((-delta) as u32, Ordering::Relaxed)
        }
    }
}

#[cfg(not(target_os = "none"))]
mod preempt {
    extern crate std;
    use core::cell::Cell;

    std::thread_local! {
        static COUNT: Cell<u32> = const { Cell::new(1) };
    }

    pub fn get() -> u32 {
        COUNT.with(|c| c.get())
    }

    pub fn set(v: u32) {
        COUNT.with(|c| c.set(v));
    }

    pub fn add(delta: i32) -> u32 {
        COUNT.with(|c| {
            let prev = c.get();
            c.set((prev as i64 + delta as i64) as u32);
            prev
        })
    }
}

/// Set by the tick path when the current slice is exhausted, or by wakers.
static NEED_RESCHED: AtomicBool = AtomicBool::new(false);

/// Remaining time slice of the running task, mutated from the tick IRQ.
static CURR_SLICE: AtomicU32 = AtomicU32::new(0);

/// Runs just before the dispatcher jumps to a user task: the process layer
/// hooks address-space switching and signal delivery here.
static PRE_SWITCH_HOOK: Mutex<Option<fn(Tid)>> = Mutex::new(None);

/// Register the pre-switch hook (process layer).
pub fn set_pre_switch_hook(hook: fn(Tid)) {
    *PRE_SWITCH_HOOK.lock() = Some(hook);
}

// ---------------------------------------------------------------------------
// Preemption control
// ---------------------------------------------------------------------------

#[inline]
pub fn disable_preemption() {
    preempt::add(1);
}

#[inline]
pub fn enable_preemption() {
    let prev = preempt::add(-1);
    assert!(prev > 0, "unbalanced enable_preemption");

    #[cfg(target_os = "none")]
    if prev == 1 && NEED_RESCHED.load(Ordering::Relaxed) {
        schedule();
    }
}

#[inline]
pub fn is_preemption_enabled() -> bool {
    preempt::get() == 0
}

#[inline]
pub fn disable_preemption_count() -> u32 {
    preempt::get()
}

/// Force the preemption-disable depth back to a saved value. Only the
/// fault-catch unwind path uses this.
pub(crate) fn restore_preempt_count(count: u32) {
    preempt::set(count);
}

/// RAII preemption-disable.
pub struct PreemptGuard(());

impl PreemptGuard {
    pub fn new() -> Self {
        disable_preemption();
        Self(())
    }
}

impl Default for PreemptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        enable_preemption();
    }
}

// ---------------------------------------------------------------------------
// Task-set access
// ---------------------------------------------------------------------------

#[inline]
pub fn current_tid() -> Tid {
    curr::get()
}

/// Run `f` against the task, if it exists.
pub fn with_task<R>(tid: Tid, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
    let mut sched = SCHEDULER.lock();
    sched.tasks.get_mut(&tid).map(f)
}

/// Run `f` against the whole scheduler state.
pub(crate) fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    f(&mut SCHEDULER.lock())
}

impl Scheduler {
    pub fn task(&self, tid: Tid) -> Option<&Task> {
        self.tasks.get(&tid)
    }

    pub fn task_mut(&mut self, tid: Tid) -> Option<&mut Task> {
        self.tasks.get_mut(&tid)
    }

    pub fn tasks(&self) -> &BTreeMap<Tid, Task> {
        &self.tasks
    }

    pub fn tasks_mut(&mut self) -> &mut BTreeMap<Tid, Task> {
        &mut self.tasks
    }
}

/// Insert a new task into the set.
pub fn add_task(task: Task) {
    let mut sched = SCHEDULER.lock();
    let prev = sched.tasks.insert(task.tid, task);
    assert!(prev.is_none(), "tid reuse while task still present");
}

/// Remove a reaped task. The caller owns the returned task (and frees its
/// kernel stack).
pub fn remove_task(tid: Tid) -> Option<Task> {
    let mut sched = SCHEDULER.lock();
    let t = sched.tasks.remove(&tid)?;
    assert_eq!(t.state, TaskState::Zombie, "removing a live task");
    Some(t)
}

pub fn get_task_state(tid: Tid) -> Option<TaskState> {
    with_task(tid, |t| t.state)
}

// ---------------------------------------------------------------------------
// Wait-object transitions
// ---------------------------------------------------------------------------

/// Put the current task to sleep on `wobj`, optionally enqueuing it on a
/// primitive's wait list. The caller yields afterwards.
pub fn task_set_wait_obj(wobj: WaitObj, wait_list: Option<&mut VecDeque<Tid>>) {
    let _g = PreemptGuard::new();
    let tid = current_tid();

    if let Some(list) = wait_list {
        list.push_back(tid);
    }

    with_task(tid, |t| {
        assert_ne!(t.state, TaskState::Sleeping);
        t.wobj = wobj;
        t.state = TaskState::Sleeping;
    });
}

/// Wake `tid`: clear its wobj and make it runnable again. Returns the old
/// wobj. The stale wait-list entry (if any) is left for lazy unlink.
pub fn task_reset_wait_obj(tid: Tid) -> Option<WaitObj> {
    let _g = PreemptGuard::new();
    let old = with_task(tid, |t| {
        assert_eq!(t.state, TaskState::Sleeping);
        t.state = TaskState::Runnable;
        t.wakeup_timer = None;
        core::mem::take(&mut t.wobj)
    })?;
    NEED_RESCHED.store(true, Ordering::Relaxed);
    Some(old)
}

/// Clear the *current* task's wobj without touching its state. Returns the
/// old value: a woken sleeper uses this to tell signal (already cleared by
/// the waker → `None` here) from timeout (still set).
pub fn wobj_reset_current() -> WaitObj {
    let _g = PreemptGuard::new();
    with_task(current_tid(), |t| core::mem::take(&mut t.wobj)).unwrap_or_default()
}

/// Arm the per-task wakeup timer `ticks` from now.
pub fn set_wakeup_timer(tid: Tid, ticks: u64) {
    let deadline = crate::arch::timer::get_ticks() + ticks;
    with_task(tid, |t| t.wakeup_timer = Some(deadline));
}

pub fn cancel_wakeup_timer(tid: Tid) {
    with_task(tid, |t| t.wakeup_timer = None);
}

/// Wake a task whose wakeup timer fired: make it runnable but leave the
/// wobj in place, which is how a timed-out condvar wait is distinguished
/// from a signalled one.
fn timer_wakeup(t: &mut Task) {
    if t.state == TaskState::Sleeping {
        t.state = TaskState::Runnable;
    }
    t.wakeup_timer = None;
}

// ---------------------------------------------------------------------------
// Tick path (IRQ context)
// ---------------------------------------------------------------------------

/// Called from the timer interrupt. Only atomics and `try_lock` here: this
/// runs above any spinlock holder.
pub fn sched_tick() {
    let now = crate::arch::timer::get_ticks();

    let slice = CURR_SLICE.load(Ordering::Relaxed);
    if slice <= 1 {
        NEED_RESCHED.store(true, Ordering::Relaxed);
    } else {
        CURR_SLICE.store(slice - 1, Ordering::Relaxed);
    }

    // Fire due wakeup timers. If the scheduler lock is held by the
    // interrupted context, the timers fire on the next tick instead.
    let curr = current_tid();
    if let Some(mut sched) = SCHEDULER.try_lock() {
        if let Some(t) = sched.tasks.get_mut(&curr) {
            t.total_ticks += 1;
        }
        for (_, t) in sched.tasks.iter_mut() {
            if let Some(deadline) = t.wakeup_timer {
                if deadline <= now {
                    timer_wakeup(t);
                    NEED_RESCHED.store(true, Ordering::Relaxed);
                }
            }
        }
    }
}

pub fn need_resched() -> bool {
    NEED_RESCHED.load(Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// The dispatcher
// ---------------------------------------------------------------------------

/// Pick the next runnable task: walk tids circularly starting after
/// `curr`, skipping vfork-stopped tasks and the idle task. Falls back to
/// the idle task.
fn pick_next(sched: &Scheduler, curr: Tid) -> Tid {
    let runnable = |t: &Task| t.state == TaskState::Runnable && !t.vfork_stopped;

    let after = sched
        .tasks
        .range((curr + 1)..)
        .find(|(tid, t)| **tid != sched.idle_tid && runnable(t))
        .map(|(tid, _)| *tid);

    let wrapped = || {
        sched
            .tasks
            .range(..=curr)
            .find(|(tid, t)| **tid != sched.idle_tid && runnable(t))
            .map(|(tid, _)| *tid)
    };

    after.or_else(wrapped).unwrap_or(sched.idle_tid)
}

/// Reschedule. If preemption is disabled the request stays pending.
pub fn schedule() {
    if !is_preemption_enabled() {
        NEED_RESCHED.store(true, Ordering::Relaxed);
        return;
    }

    disable_preemption();
    NEED_RESCHED.store(false, Ordering::Relaxed);

    let curr = current_tid();
    let (old_ctx, new_ctx, next) = {
        let mut sched = SCHEDULER.lock();

        let next = pick_next(&sched, curr);
        if next == curr {
            if let Some(t) = sched.tasks.get_mut(&curr) {
                if t.state == TaskState::Running {
                    t.time_slice = crate::config::sched_quantum();
                    CURR_SLICE.store(t.time_slice, Ordering::Relaxed);
                }
            }
            drop(sched);
            enable_preemption();
            return;
        }

        let old_ctx = match sched.tasks.get_mut(&curr) {
            Some(t) => {
                if t.state == TaskState::Running {
                    t.state = TaskState::Runnable;
                }
                &mut t.context as *mut arch::Context
            }
            None => core::ptr::null_mut(),
        };

        let t = sched.tasks.get_mut(&next).expect("picked task exists");
        t.state = TaskState::Running;
        t.time_slice = crate::config::sched_quantum();
        CURR_SLICE.store(t.time_slice, Ordering::Relaxed);
        let new_ctx = &t.context as *const arch::Context;

        curr::set(next);
        (old_ctx, new_ctx, next)
    };

    if let Some(hook) = *PRE_SWITCH_HOOK.lock() {
        hook(next);
        // Signal delivery may have killed the task we just picked.
        if get_task_state(next) != Some(TaskState::Running) {
            enable_preemption();
            return schedule();
        }
    }

    #[cfg(target_os = "none")]
    {
        // SAFETY: both contexts live in the task arena, which is stable
        // while this CPU (the only one) is inside the dispatcher with
        // preemption disabled. A null old_ctx only happens for an exiting
        // task whose context will never be resumed; we hand a scratch slot.
        unsafe {
            let mut scratch = arch::Context::default();
            let old = if old_ctx.is_null() { &mut scratch as *mut _ } else { old_ctx };
            arch::context_switch(old, new_ctx);
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = (old_ctx, new_ctx);
    }

    enable_preemption();
}

/// Voluntarily give up the CPU.
pub fn kernel_yield() {
    schedule();
}

/// Yield after the caller marked the current task sleeping. If a wakeup
/// (or an earlier preemption edge) already ran, this is a no-op.
pub fn enter_sleep_wait_state() {
    if get_task_state(current_tid()) == Some(TaskState::Sleeping) {
        schedule();
    }
}

/// Sleep for at least `ticks` timer ticks.
pub fn kernel_sleep(ticks: u64) {
    let tid = current_tid();
    {
        let _g = PreemptGuard::new();
        set_wakeup_timer(tid, ticks);
        task_set_wait_obj(WaitObj::Timer, None);
    }
    enter_sleep_wait_state();
    let _ = wobj_reset_current();
}

// ---------------------------------------------------------------------------
// Kernel threads
// ---------------------------------------------------------------------------

/// First Rust code of every fresh task context. The dispatcher switched in
/// here with its preemption hold still pending; balance it (and make sure
/// interrupts are on) before handing control to the entry function.
#[no_mangle]
pub extern "C" fn kthread_bootstrap(arg: usize, entry: extern "C" fn(usize) -> !) -> ! {
    enable_preemption();
    arch::enable_interrupts();
    entry(arg)
}

/// Spawn a kernel thread running `entry(arg)`.
pub fn kthread_create(entry: extern "C" fn(usize) -> !, arg: usize) -> KernelResult<Tid> {
    let tid = task::alloc_kthread_tid();
    let stack = task::KernelStack::alloc()?;

    let mut t = Task::new(tid);
    t.context = arch::Context::new_kthread(entry, arg, stack.top());
    t.kernel_stack = Some(stack);
    t.state = TaskState::Runnable;
    add_task(t);
    Ok(tid)
}

/// Terminate the calling kernel thread with `code`.
pub fn kthread_exit(code: i32) -> ! {
    let tid = current_tid();

    {
        let _g = PreemptGuard::new();
        let waiters = with_task(tid, |t| {
            t.state = TaskState::Zombie;
            t.exit_wstatus = (code & 0xFF) << 8;
            core::mem::take(&mut t.exit_waiters)
        })
        .expect("current task exists");

        for w in waiters {
            if get_task_state(w) == Some(TaskState::Sleeping) {
                task_reset_wait_obj(w);
            }
        }
    }

    loop {
        schedule();
        arch::halt();
    }
}

/// Wait for a kernel thread to exit, reap it, and return its exit code.
pub fn kthread_join(tid: Tid) -> KernelResult<i32> {
    loop {
        disable_preemption();

        let state = match get_task_state(tid) {
            Some(s) => s,
            None => {
                enable_preemption();
                return Err(KernelError::TaskNotFound { tid });
            }
        };

        if state == TaskState::Zombie {
            let t = remove_task(tid).expect("zombie still in table");
            let code = t.exit_wstatus >> 8;
            if let Some(stack) = t.kernel_stack {
                stack.free();
            }
            enable_preemption();
            return Ok(code);
        }

        let me = current_tid();
        with_task(tid, |t| t.exit_waiters.push(me));
        task_set_wait_obj(WaitObj::Task(tid as i32), None);
        enable_preemption();
        enter_sleep_wait_state();
        let _ = wobj_reset_current();
    }
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

extern "C" fn idle_main(_arg: usize) -> ! {
    loop {
        arch::halt();
        if need_resched() {
            schedule();
        }
    }
}

/// Register the boot context as the main task and spawn the idle task.
pub fn init() -> KernelResult<()> {
    let mut main = Task::new(MAIN_TID);
    main.state = TaskState::Running;
    add_task(main);
    curr::set(MAIN_TID);
    CURR_SLICE.store(crate::config::sched_quantum(), Ordering::Relaxed);

    let idle = kthread_create(idle_main, 0)?;
    with_scheduler(|s| s.idle_tid = idle);

    log::info!("sched: main tid {}, idle tid {}", MAIN_TID, idle);
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use spin::Once;

    static INIT: Once<()> = Once::new();

    /// Shared scheduler setup for unit tests: mm + a registered main task.
    pub fn sched_test_init() {
        crate::mm::test_support::mm_test_init();
        INIT.call_once(|| {
            init().expect("sched test init");
        });
    }

    /// Force the logical current task (host tests drive switches manually).
    pub fn set_current(tid: Tid) {
        curr::set(tid);
        with_task(tid, |t| t.state = TaskState::Running);
    }

    /// Create a bare test task in the given state, without a real stack.
    pub fn spawn_bare(state: TaskState) -> Tid {
        let tid = task::alloc_kthread_tid();
        let mut t = Task::new(tid);
        t.state = state;
        add_task(t);
        tid
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn local_sched(entries: &[(Tid, TaskState)]) -> Scheduler {
        let mut s = Scheduler::new();
        s.idle_tid = 999;
        s.tasks.insert(999, Task::new(999));
        for &(tid, state) in entries {
            let mut t = Task::new(tid);
            t.state = state;
            s.tasks.insert(tid, t);
        }
        s
    }

    #[test]
    fn test_pick_next_round_robin_order() {
        let s = local_sched(&[
            (10, TaskState::Running),
            (20, TaskState::Runnable),
            (30, TaskState::Sleeping),
            (40, TaskState::Runnable),
        ]);

        // Circular walk starting after current, skipping non-runnable.
        assert_eq!(pick_next(&s, 10), 20);
        assert_eq!(pick_next(&s, 20), 40);
        assert_eq!(pick_next(&s, 40), 20);
        // No runnable task at all → idle.
        let s2 = local_sched(&[(10, TaskState::Running)]);
        assert_eq!(pick_next(&s2, 10), 999);
    }

    #[test]
    fn test_pick_next_skips_vfork_stopped() {
        let mut s = local_sched(&[(10, TaskState::Running), (20, TaskState::Runnable)]);
        s.tasks.get_mut(&20).unwrap().vfork_stopped = true;
        assert_eq!(pick_next(&s, 10), 999);
    }

    #[test]
    fn test_wait_obj_transitions() {
        sched_test_init();
        let t = spawn_bare(TaskState::Runnable);

        with_task(t, |t| {
            t.state = TaskState::Sleeping;
            t.wobj = WaitObj::Timer;
        });

        let old = task_reset_wait_obj(t).unwrap();
        assert_eq!(old, WaitObj::Timer);
        assert_eq!(get_task_state(t), Some(TaskState::Runnable));
        with_task(t, |t| assert!(t.wobj.is_none()));

        with_task(t, |t| t.state = TaskState::Zombie);
        remove_task(t);
    }

    #[test]
    fn test_timer_wakeup_preserves_wobj() {
        sched_test_init();
        let t = spawn_bare(TaskState::Runnable);
        with_task(t, |task| {
            task.state = TaskState::Sleeping;
            task.wobj = WaitObj::Timer;
            task.wakeup_timer = Some(0); // already due
        });

        // The tick path skips timer work when the scheduler lock is
        // contended (another test thread may hold it); retry until it
        // lands.
        for _ in 0..1000 {
            sched_tick();
            if get_task_state(t) == Some(TaskState::Runnable) {
                break;
            }
        }

        // Timer wake leaves the wobj set; that is the timeout marker.
        with_task(t, |task| {
            assert_eq!(task.state, TaskState::Runnable);
            assert_eq!(task.wobj, WaitObj::Timer);
            assert!(task.wakeup_timer.is_none());
        });

        with_task(t, |t| t.state = TaskState::Zombie);
        remove_task(t);
    }

    #[test]
    fn test_preemption_counter_nesting() {
        sched_test_init();
        let before = disable_preemption_count();
        {
            let _a = PreemptGuard::new();
            let _b = PreemptGuard::new();
            assert_eq!(disable_preemption_count(), before + 2);
        }
        assert_eq!(disable_preemption_count(), before);
    }
}
