//! Counting semaphore (used by the reader-preferring rwlock).

use alloc::collections::VecDeque;
use spin::Mutex as SpinMutex;

use super::wobj::{ChannelId, WaitObj};
use crate::sched::{self, TaskState, Tid};

struct KSemState {
    counter: i32,
    wait_list: VecDeque<Tid>,
}

pub struct KSem {
    st: SpinMutex<KSemState>,
    id: ChannelId,
}

impl KSem {
    /// A semaphore with `units` initially available.
    pub fn new(units: i32) -> Self {
        Self {
            st: SpinMutex::new(KSemState {
                counter: units,
                wait_list: VecDeque::new(),
            }),
            id: ChannelId::alloc(),
        }
    }

    pub fn units(&self) -> i32 {
        self.st.lock().counter
    }

    /// Take one unit, sleeping while none is available.
    pub fn wait(&self) {
        loop {
            sched::disable_preemption();
            let mut st = self.st.lock();

            if st.counter > 0 {
                st.counter -= 1;
                drop(st);
                sched::enable_preemption();
                return;
            }

            sched::task_set_wait_obj(WaitObj::KSem(self.id), Some(&mut st.wait_list));
            drop(st);
            sched::enable_preemption();
            sched::enter_sleep_wait_state();
            let _ = sched::wobj_reset_current();
        }
    }

    /// Take one unit without sleeping.
    pub fn trywait(&self) -> bool {
        let _g = sched::PreemptGuard::new();
        let mut st = self.st.lock();
        if st.counter > 0 {
            st.counter -= 1;
            true
        } else {
            false
        }
    }

    /// Release one unit and wake the first valid waiter.
    pub fn signal(&self) {
        let _g = sched::PreemptGuard::new();
        let mut st = self.st.lock();
        st.counter += 1;

        while let Some(tid) = st.wait_list.pop_front() {
            let valid = sched::with_task(tid, |t| {
                t.state == TaskState::Sleeping && t.wobj.waits_on(self.id)
            })
            .unwrap_or(false);

            if valid {
                sched::task_reset_wait_obj(tid);
                break;
            }
        }
    }
}

// SAFETY: all state is behind the inner spin lock.
unsafe impl Send for KSem {}
unsafe impl Sync for KSem {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::test_support::{sched_test_init, spawn_bare};

    #[test]
    fn test_units_accounting() {
        sched_test_init();
        let s = KSem::new(2);
        assert!(s.trywait());
        assert!(s.trywait());
        assert!(!s.trywait());
        s.signal();
        assert!(s.trywait());
        s.signal();
        s.signal();
        assert_eq!(s.units(), 2);
    }

    #[test]
    fn test_signal_wakes_blocked_waiter() {
        sched_test_init();
        let s = KSem::new(0);
        let w = spawn_bare(TaskState::Runnable);
        sched::with_task(w, |t| {
            t.state = TaskState::Sleeping;
            t.wobj = WaitObj::KSem(s.id);
        });
        s.st.lock().wait_list.push_back(w);

        s.signal();
        assert_eq!(sched::get_task_state(w), Some(TaskState::Runnable));
        assert_eq!(s.units(), 1);

        sched::with_task(w, |t| t.state = TaskState::Zombie);
        sched::remove_task(w);
    }
}
