//! Read/write locks, in the only two shapes the kernel exposes.
//!
//! - [`RwLockRp`]: reader-preferring. An inner mutex plus a readers count;
//!   the first reader takes the writers semaphore, the last one returns it.
//!   Readers arriving while a writer waits may still get in.
//! - [`RwLockWp`]: writer-preferring. New readers block while any writer is
//!   waiting; the writer then waits for the reader count to drain. The
//!   writer side can optionally be recursive.

use core::sync::atomic::{AtomicU32, Ordering};

use super::kcond::{KCond, KCOND_WAIT_FOREVER};
use super::kmutex::KMutex;
use super::ksem::KSem;
use crate::sched::{self, Tid};

// ---------------------------------------------------------------------------
// Reader-preferring
// ---------------------------------------------------------------------------

pub struct RwLockRp {
    readers_lock: KMutex,
    writers_sem: KSem,
    readers_count: AtomicU32,
}

impl RwLockRp {
    pub fn new() -> Self {
        Self {
            readers_lock: KMutex::new(false),
            writers_sem: KSem::new(1),
            readers_count: AtomicU32::new(0),
        }
    }

    pub fn shlock(&self) {
        self.readers_lock.lock();
        if self.readers_count.fetch_add(1, Ordering::Relaxed) == 0 {
            self.writers_sem.wait();
        }
        self.readers_lock.unlock();
    }

    pub fn shunlock(&self) {
        self.readers_lock.lock();
        if self.readers_count.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.writers_sem.signal();
        }
        self.readers_lock.unlock();
    }

    pub fn exlock(&self) {
        self.writers_sem.wait();
    }

    pub fn exunlock(&self) {
        self.writers_sem.signal();
    }

    pub fn readers(&self) -> u32 {
        self.readers_count.load(Ordering::Relaxed)
    }
}

impl Default for RwLockRp {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Writer-preferring
// ---------------------------------------------------------------------------

struct WpState {
    readers: u32,
    writer_active: bool,
    ex_owner: Option<Tid>,
    rec_count: u32,
}

pub struct RwLockWp {
    m: KMutex,
    c: KCond,
    st: spin::Mutex<WpState>,
    recursive: bool,
}

impl RwLockWp {
    pub fn new(recursive: bool) -> Self {
        Self {
            m: KMutex::new(false),
            c: KCond::new(),
            st: spin::Mutex::new(WpState {
                readers: 0,
                writer_active: false,
                ex_owner: None,
                rec_count: 0,
            }),
            recursive,
        }
    }

    pub fn shlock(&self) {
        self.m.lock();
        // Writers have priority: hold back while one is in or waiting.
        loop {
            {
                let mut st = self.st.lock();
                if !st.writer_active {
                    st.readers += 1;
                    break;
                }
            }
            self.c.wait(Some(&self.m), KCOND_WAIT_FOREVER);
        }
        self.m.unlock();
    }

    pub fn shunlock(&self) {
        self.m.lock();
        let last = {
            let mut st = self.st.lock();
            st.readers -= 1;
            st.readers == 0
        };
        if last {
            self.c.signal_one();
        }
        self.m.unlock();
    }

    pub fn exlock(&self) {
        self.m.lock();

        if self.recursive {
            let mut st = self.st.lock();
            if st.ex_owner == Some(sched::current_tid()) {
                debug_assert!(st.writer_active);
                st.rec_count += 1;
                drop(st);
                self.m.unlock();
                return;
            }
        }

        // Wait our turn behind other writers.
        loop {
            {
                let st = self.st.lock();
                if !st.writer_active {
                    break;
                }
            }
            self.c.wait(Some(&self.m), KCOND_WAIT_FOREVER);
        }

        self.st.lock().writer_active = true;

        // Now wait for the readers to drain.
        loop {
            {
                let st = self.st.lock();
                if st.readers == 0 {
                    break;
                }
            }
            self.c.wait(Some(&self.m), KCOND_WAIT_FOREVER);
        }

        {
            let mut st = self.st.lock();
            debug_assert!(st.ex_owner.is_none());
            st.ex_owner = Some(sched::current_tid());
            if self.recursive {
                debug_assert_eq!(st.rec_count, 0);
                st.rec_count = 1;
            }
        }

        self.m.unlock();
    }

    pub fn exunlock(&self) {
        self.m.lock();
        {
            let mut st = self.st.lock();
            assert_eq!(st.ex_owner, Some(sched::current_tid()));

            if self.recursive {
                debug_assert!(st.rec_count > 0);
                st.rec_count -= 1;
                if st.rec_count > 0 {
                    self.m.unlock();
                    return;
                }
            }

            st.ex_owner = None;
            debug_assert!(st.writer_active);
            st.writer_active = false;
        }

        // Wake everyone potentially waiting on the state change.
        self.c.signal_all();
        self.m.unlock();
    }

    pub fn readers(&self) -> u32 {
        self.st.lock().readers
    }

    pub fn has_writer(&self) -> bool {
        self.st.lock().writer_active
    }
}

impl Default for RwLockWp {
    fn default() -> Self {
        Self::new(false)
    }
}
