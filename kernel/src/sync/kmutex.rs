//! Sleeping mutex with hand-off unlock.
//!
//! Unlock does not barge: if anyone is queued, ownership transfers directly
//! to the head waiter before it is woken, so the lock is never observably
//! free while a waiter exists.

use alloc::collections::VecDeque;
use spin::Mutex as SpinMutex;

use super::wobj::{ChannelId, WaitObj};
use crate::sched::{self, TaskState, Tid};

struct KMutexState {
    owner: Option<Tid>,
    /// Nesting depth; meaningful only for recursive mutexes.
    lock_count: u32,
    wait_list: VecDeque<Tid>,
}

pub struct KMutex {
    st: SpinMutex<KMutexState>,
    id: ChannelId,
    recursive: bool,
}

impl KMutex {
    pub fn new(recursive: bool) -> Self {
        Self {
            st: SpinMutex::new(KMutexState {
                owner: None,
                lock_count: 0,
                wait_list: VecDeque::new(),
            }),
            id: ChannelId::alloc(),
            recursive,
        }
    }

    pub fn is_curr_task_holding_lock(&self) -> bool {
        self.st.lock().owner == Some(sched::current_tid())
    }

    /// Acquire, sleeping if contended.
    pub fn lock(&self) {
        sched::disable_preemption();
        let me = sched::current_tid();
        let mut st = self.st.lock();

        if st.owner.is_none() {
            st.owner = Some(me);
            if self.recursive {
                debug_assert_eq!(st.lock_count, 0);
                st.lock_count = 1;
            }
            drop(st);
            sched::enable_preemption();
            return;
        }

        if self.recursive && st.owner == Some(me) {
            st.lock_count += 1;
            drop(st);
            sched::enable_preemption();
            return;
        }

        debug_assert_ne!(st.owner, Some(me), "relock of a non-recursive mutex");

        sched::task_set_wait_obj(WaitObj::KMutex(self.id), Some(&mut st.wait_list));
        drop(st);
        sched::enable_preemption();
        sched::enter_sleep_wait_state();

        // Woken by the hand-off: the previous owner made us the owner.
        debug_assert!(self.is_curr_task_holding_lock());
        if self.recursive {
            debug_assert_eq!(self.st.lock().lock_count, 1);
        }
    }

    /// Acquire without sleeping; returns whether the lock was taken.
    pub fn trylock(&self) -> bool {
        let _g = sched::PreemptGuard::new();
        let me = sched::current_tid();
        let mut st = self.st.lock();

        if st.owner.is_none() {
            st.owner = Some(me);
            if self.recursive {
                st.lock_count = 1;
            }
            return true;
        }

        if self.recursive && st.owner == Some(me) {
            st.lock_count += 1;
            return true;
        }

        false
    }

    /// Release. Must be called by the owner. If waiters are queued, the
    /// head waiter becomes the owner and is woken.
    pub fn unlock(&self) {
        let _g = sched::PreemptGuard::new();
        let me = sched::current_tid();
        let mut st = self.st.lock();

        assert_eq!(st.owner, Some(me), "unlock by non-owner");

        if self.recursive {
            debug_assert!(st.lock_count > 0);
            st.lock_count -= 1;
            if st.lock_count > 0 {
                return;
            }
        }

        st.owner = None;

        // Hand off to the first still-valid waiter (lazy unlink: stale
        // entries of timed-out or already-woken tasks are skipped).
        while let Some(tid) = st.wait_list.pop_front() {
            let valid = sched::with_task(tid, |t| {
                t.state == TaskState::Sleeping && t.wobj.waits_on(self.id)
            })
            .unwrap_or(false);

            if valid {
                st.owner = Some(tid);
                if self.recursive {
                    st.lock_count = 1;
                }
                sched::task_reset_wait_obj(tid);
                break;
            }
        }
    }
}

// SAFETY: all state transitions go through the inner spin lock.
unsafe impl Send for KMutex {}
unsafe impl Sync for KMutex {}
