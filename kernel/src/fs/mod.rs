//! File abstractions the core kernel needs.
//!
//! The on-disk filesystems themselves live outside the core; what the
//! process and syscall layers depend on is the capability trait below
//! (the fops surface), handles, pipes, the subsystem file locks and poll.

pub mod flock;
pub mod pipe;
pub mod poll;

use alloc::sync::Arc;
use bitflags::bitflags;

use crate::error::{KernelError, KernelResult};
use crate::sync::kcond::KCond;

bitflags! {
    /// Poll readiness bits (POSIX subset the kernel produces).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollMask: u16 {
        const IN  = 0x0001;
        const OUT = 0x0004;
        const ERR = 0x0008;
        const HUP = 0x0010;
    }
}

/// Seek origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// Minimal stat payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stat {
    pub inode: u64,
    pub size: u64,
    pub mode: u32,
}

/// The capability surface of an open file. Implementations provide what
/// they support; the defaults return the canonical errors.
pub trait FileOps: Send + Sync {
    fn read(&self, _buf: &mut [u8], _nonblock: bool) -> KernelResult<usize> {
        Err(KernelError::InvalidArgument { name: "read" })
    }

    fn write(&self, _buf: &[u8], _nonblock: bool) -> KernelResult<usize> {
        Err(KernelError::InvalidArgument { name: "write" })
    }

    fn seek(&self, _off: i64, _whence: Whence) -> KernelResult<u64> {
        Err(KernelError::IllegalSeek)
    }

    fn ioctl(&self, _req: u32, _arg: u64) -> KernelResult<u64> {
        Err(KernelError::NotATty)
    }

    fn stat(&self) -> KernelResult<Stat> {
        Ok(Stat::default())
    }

    fn getdents(&self) -> KernelResult<usize> {
        Err(KernelError::NotADirectory)
    }

    /// Current readiness, for poll.
    fn poll_mask(&self) -> PollMask {
        PollMask::IN | PollMask::OUT
    }

    /// Condition a poller may park on; `None` means always-ready.
    fn poll_cond(&self) -> Option<&KCond> {
        None
    }
}

/// One open-file slot of a process handle table.
#[derive(Clone)]
pub struct Handle {
    pub ops: Arc<dyn FileOps>,
    /// Close this handle across execve.
    pub cloexec: bool,
    /// O_NONBLOCK.
    pub nonblock: bool,
}

impl Handle {
    pub fn new(ops: Arc<dyn FileOps>) -> Self {
        Self {
            ops,
            cloexec: false,
            nonblock: false,
        }
    }

    /// The handle duplicate fork makes: same open file, same flags.
    pub fn dup(&self) -> Self {
        self.clone()
    }
}
