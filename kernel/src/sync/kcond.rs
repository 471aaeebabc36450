//! Condition variables.
//!
//! Classic semantics: a signal with no waiter is lost. `wait` atomically
//! (under preemption disable) drops the mutex and enqueues; wakeup by
//! signal clears the task's wobj *before* waking, wakeup by timer does not
//! — which is exactly how the return value tells the two apart.

use alloc::collections::VecDeque;
use spin::Mutex as SpinMutex;

use super::kmutex::KMutex;
use super::wobj::{ChannelId, WaitObj};
use crate::sched::{self, TaskState, Tid};

/// Sleep without a timeout in [`KCond::wait`].
pub const KCOND_WAIT_FOREVER: u64 = u64::MAX;

pub struct KCond {
    wait_list: SpinMutex<VecDeque<Tid>>,
    id: ChannelId,
}

impl KCond {
    pub fn new() -> Self {
        Self {
            wait_list: SpinMutex::new(VecDeque::new()),
            id: ChannelId::alloc(),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.id
    }

    /// Park `tid` on this condition's wait list without touching its
    /// state. Multi-object waiters (poll) register themselves this way;
    /// the entry is lazily unlinked like any other.
    pub(crate) fn add_poll_waiter(&self, tid: Tid) {
        self.wait_list.lock().push_back(tid);
    }

    pub fn is_anyone_waiting(&self) -> bool {
        let _g = sched::PreemptGuard::new();
        let list = self.wait_list.lock();
        let ch = self.id;
        list.iter().any(|&tid| {
            sched::with_task(tid, |t| t.state == TaskState::Sleeping && t.wobj.waits_on(ch))
                .unwrap_or(false)
        })
    }

    /// Wait for a signal, releasing `m` while asleep and re-acquiring it
    /// before returning. With a timeout in ticks, returns `false` if the
    /// timer fired first, `true` if signalled.
    pub fn wait(&self, m: Option<&KMutex>, timeout_ticks: u64) -> bool {
        if let Some(m) = m {
            assert!(m.is_curr_task_holding_lock());
        }
        let me = sched::current_tid();

        sched::disable_preemption();
        {
            let mut list = self.wait_list.lock();
            sched::task_set_wait_obj(WaitObj::KCond(self.id), Some(&mut list));
        }

        if timeout_ticks != KCOND_WAIT_FOREVER {
            sched::set_wakeup_timer(me, timeout_ticks);
        }

        if let Some(m) = m {
            m.unlock();
        }
        sched::enable_preemption();

        sched::enter_sleep_wait_state();

        // Signal resets the wobj before waking us; a timer wake leaves it.
        let signalled = sched::wobj_reset_current().is_none();

        if let Some(m) = m {
            m.lock();
        }

        signalled
    }

    fn signal_first_valid(&self, list: &mut VecDeque<Tid>) {
        while let Some(tid) = list.pop_front() {
            let woken = sched::with_task(tid, |t| {
                t.state == TaskState::Sleeping && t.wobj.waits_on(self.id)
            })
            .unwrap_or(false);

            if woken {
                sched::cancel_wakeup_timer(tid);
                sched::task_reset_wait_obj(tid);
                return;
            }
            // Stale entry (timed out or already woken): skip it.
        }
    }

    /// Wake the head waiter, if any. Lost if nobody waits.
    pub fn signal_one(&self) {
        let _g = sched::PreemptGuard::new();
        let mut list = self.wait_list.lock();
        self.signal_first_valid(&mut list);
    }

    /// Wake every waiter.
    pub fn signal_all(&self) {
        let _g = sched::PreemptGuard::new();
        let mut list = self.wait_list.lock();
        while !list.is_empty() {
            self.signal_first_valid(&mut list);
        }
    }
}

impl Default for KCond {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the wait list is behind a spin lock; task state behind the
// scheduler lock.
unsafe impl Send for KCond {}
unsafe impl Sync for KCond {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::test_support::{sched_test_init, spawn_bare};

    fn block_on_cond(c: &KCond, tid: Tid) {
        sched::with_task(tid, |t| {
            t.state = TaskState::Sleeping;
            t.wobj = WaitObj::KCond(c.channel());
        });
        c.wait_list.lock().push_back(tid);
    }

    #[test]
    fn test_signal_one_wakes_head_only() {
        sched_test_init();
        let c = KCond::new();
        let w1 = spawn_bare(TaskState::Runnable);
        let w2 = spawn_bare(TaskState::Runnable);
        block_on_cond(&c, w1);
        block_on_cond(&c, w2);
        assert!(c.is_anyone_waiting());

        c.signal_one();
        assert_eq!(sched::get_task_state(w1), Some(TaskState::Runnable));
        assert_eq!(sched::get_task_state(w2), Some(TaskState::Sleeping));

        // The signalled task's wobj was cleared by the waker.
        sched::with_task(w1, |t| assert!(t.wobj.is_none()));

        c.signal_all();
        assert_eq!(sched::get_task_state(w2), Some(TaskState::Runnable));
        assert!(!c.is_anyone_waiting());

        for w in [w1, w2] {
            sched::with_task(w, |t| t.state = TaskState::Zombie);
            sched::remove_task(w);
        }
    }

    #[test]
    fn test_signal_lost_without_waiters() {
        sched_test_init();
        let c = KCond::new();
        // No waiter: nothing happens, nothing is queued for later.
        c.signal_one();
        c.signal_all();
        assert!(!c.is_anyone_waiting());
    }

    #[test]
    fn test_signal_cancels_wakeup_timer() {
        sched_test_init();
        let c = KCond::new();
        let w = spawn_bare(TaskState::Runnable);
        block_on_cond(&c, w);
        sched::set_wakeup_timer(w, 1000);

        c.signal_one();
        sched::with_task(w, |t| {
            assert_eq!(t.state, TaskState::Runnable);
            assert!(t.wakeup_timer.is_none());
            assert!(t.wobj.is_none());
        });

        sched::with_task(w, |t| t.state = TaskState::Zombie);
        sched::remove_task(w);
    }

    #[test]
    fn test_timeout_leaves_wobj_for_discrimination() {
        sched_test_init();
        let c = KCond::new();
        let w = spawn_bare(TaskState::Runnable);
        block_on_cond(&c, w);
        sched::with_task(w, |t| t.wakeup_timer = Some(0));

        // Timer fires: task runnable, wobj still set (timeout marker).
        // The tick path may skip a round when the scheduler lock is busy.
        for _ in 0..1000 {
            sched::sched_tick();
            if sched::get_task_state(w) == Some(TaskState::Runnable) {
                break;
            }
        }
        sched::with_task(w, |t| {
            assert_eq!(t.state, TaskState::Runnable);
            assert_eq!(t.wobj, WaitObj::KCond(c.channel()));
        });

        // A later signal must skip the stale queue entry.
        c.signal_one();
        assert!(!c.is_anyone_waiting());

        sched::with_task(w, |t| {
            t.wobj = WaitObj::None;
            t.state = TaskState::Zombie;
        });
        sched::remove_task(w);
    }
}
