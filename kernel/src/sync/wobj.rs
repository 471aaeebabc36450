//! Wait objects: the handle a sleeping task holds to whatever it waits on.
//!
//! Primitives own their wait queues as `VecDeque<Tid>`; the task side holds
//! a tagged [`WaitObj`] naming the channel it blocks on. Queue entries are
//! *lazily unlinked*: a waker pops tids and revalidates them against the
//! task's current wobj, so a task that was woken by timeout (and left a
//! stale queue entry behind) is simply skipped.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

/// `waitpid(-1)`: wait on any child.
pub const ANY_CHILD: i32 = -1;

/// Identity of one waitable channel (a mutex, condvar, semaphore, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChannelId(u64);

static NEXT_CHANNEL: AtomicU64 = AtomicU64::new(1);

impl ChannelId {
    /// Allocate a fresh, never-reused channel identity.
    pub fn alloc() -> Self {
        Self(NEXT_CHANNEL.fetch_add(1, Ordering::Relaxed))
    }
}

/// What a sleeping task is blocked on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WaitObj {
    #[default]
    None,
    KMutex(ChannelId),
    KCond(ChannelId),
    KSem(ChannelId),
    /// Blocked in `waitpid`-style matching; the payload is the pid
    /// argument (`> 0`, `0`, [`ANY_CHILD`], `< -1`).
    Task(i32),
    /// Pure timer sleep (`kernel_sleep`).
    Timer,
    /// Blocked until *any* of these channels fires (poll).
    MultiObj(Vec<ChannelId>),
}

impl WaitObj {
    pub fn is_none(&self) -> bool {
        matches!(self, WaitObj::None)
    }

    /// Whether a signal on `ch` is meant for this wobj.
    pub fn waits_on(&self, ch: ChannelId) -> bool {
        match self {
            WaitObj::KMutex(c) | WaitObj::KCond(c) | WaitObj::KSem(c) => *c == ch,
            WaitObj::MultiObj(list) => list.contains(&ch),
            _ => false,
        }
    }
}
