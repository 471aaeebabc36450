//! Synchronization primitives: wait objects, sleeping mutexes, condition
//! variables, semaphores, rwlocks and the IRQ-safe ring buffer.

pub mod kcond;
pub mod kmutex;
pub mod ksem;
pub mod rwlock;
pub mod safe_ringbuf;
pub mod wobj;

pub use kcond::{KCond, KCOND_WAIT_FOREVER};
pub use kmutex::KMutex;
pub use ksem::KSem;
pub use rwlock::{RwLockRp, RwLockWp};
pub use safe_ringbuf::SafeRingbuf;
pub use wobj::{ChannelId, WaitObj, ANY_CHILD};
