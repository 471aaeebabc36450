//! Kernel error types.
//!
//! Internal APIs return [`KernelError`] (or a smaller subsystem enum that
//! converts into it); syscall handlers translate to a negative [`Errno`]
//! value at the outermost boundary, and nowhere else.

use core::fmt;

/// POSIX errno values used by the syscall layer.
///
/// Only the subset the kernel can actually produce is defined. The numeric
/// values match Linux/i386 so static user binaries see what they expect.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    Perm = 1,
    Noent = 2,
    Intr = 4,
    Io = 5,
    Badf = 9,
    Child = 10,
    Again = 11,
    Nomem = 12,
    Acces = 13,
    Fault = 14,
    Busy = 16,
    Exist = 17,
    Nodev = 19,
    Notdir = 20,
    Isdir = 21,
    Inval = 22,
    Nfile = 23,
    Mfile = 24,
    Notty = 25,
    Txtbsy = 26,
    Nospc = 28,
    Spipe = 29,
    Pipe = 32,
    Range = 34,
    Nametoolong = 36,
    Nolck = 37,
    Nosys = 38,
}

impl Errno {
    /// The value a syscall returns for this error: `-errno`.
    #[inline]
    pub const fn as_neg(self) -> isize {
        -(self as i32 as isize)
    }
}

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Out of physical frames, heap blocks or virtual space.
    OutOfMemory,
    /// Could not allocate a pid (table exhausted).
    PidExhausted,
    /// Per-process handle table is full.
    TooManyHandles,
    /// The virtual address is already mapped.
    AlreadyMapped { vaddr: u64 },
    /// The virtual address is not mapped.
    NotMapped { vaddr: u64 },
    /// A user pointer referenced unmapped memory.
    BadUserPointer { vaddr: u64 },
    /// An argument failed validation.
    InvalidArgument { name: &'static str },
    /// Value outside the supported range.
    OutOfRange,
    /// No such task.
    TaskNotFound { tid: u32 },
    /// No such process.
    ProcessNotFound { pid: u32 },
    /// No waitable children.
    NoChildren,
    /// A blocking operation was interrupted by a signal.
    Interrupted,
    /// Operation would block and the caller asked not to.
    WouldBlock,
    /// Invalid or closed handle.
    BadHandle,
    /// Resource busy.
    Busy,
    /// An exclusive file lock is held by another subsystem.
    FileLocked,
    /// No lock support at the filesystem level.
    NoLock,
    /// Broken pipe: all readers are gone.
    BrokenPipe,
    /// Not a terminal / ioctl not supported by this file.
    NotATty,
    /// Seek on a non-seekable file.
    IllegalSeek,
    /// No such file or directory.
    NoEntry,
    /// Path component is not a directory.
    NotADirectory,
    /// Target is a directory.
    IsADirectory,
    /// Already exists.
    AlreadyExists,
    /// Permission denied.
    PermissionDenied,
    /// Not a valid executable image.
    BadExecutable,
    /// Operation not implemented (e.g. stubbed arch seam).
    NotImplemented { what: &'static str },
    /// Unknown syscall number.
    NoSuchSyscall { nr: usize },
    /// Subsystem used before its `init()`.
    NotInitialized { subsystem: &'static str },
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// Map this error to the errno a syscall handler must return.
    pub fn errno(self) -> Errno {
        match self {
            Self::OutOfMemory => Errno::Nomem,
            Self::PidExhausted => Errno::Again,
            Self::TooManyHandles => Errno::Mfile,
            Self::AlreadyMapped { .. } => Errno::Exist,
            Self::NotMapped { .. } => Errno::Fault,
            Self::BadUserPointer { .. } => Errno::Fault,
            Self::InvalidArgument { .. } => Errno::Inval,
            Self::OutOfRange => Errno::Range,
            Self::TaskNotFound { .. } => Errno::Child,
            Self::ProcessNotFound { .. } => Errno::Child,
            Self::NoChildren => Errno::Child,
            Self::Interrupted => Errno::Intr,
            Self::WouldBlock => Errno::Again,
            Self::BadHandle => Errno::Badf,
            Self::Busy => Errno::Busy,
            Self::FileLocked => Errno::Txtbsy,
            Self::NoLock => Errno::Nolck,
            Self::BrokenPipe => Errno::Pipe,
            Self::NotATty => Errno::Notty,
            Self::IllegalSeek => Errno::Spipe,
            Self::NoEntry => Errno::Noent,
            Self::NotADirectory => Errno::Notdir,
            Self::IsADirectory => Errno::Isdir,
            Self::AlreadyExists => Errno::Exist,
            Self::PermissionDenied => Errno::Acces,
            Self::BadExecutable => Errno::Inval,
            Self::NotImplemented { .. } => Errno::Nosys,
            Self::NoSuchSyscall { .. } => Errno::Nosys,
            Self::NotInitialized { .. } => Errno::Inval,
        }
    }

    /// The value the syscall layer hands back to userspace.
    #[inline]
    pub fn as_syscall_ret(self) -> isize {
        self.errno().as_neg()
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::PidExhausted => write!(f, "pid space exhausted"),
            Self::TooManyHandles => write!(f, "handle table full"),
            Self::AlreadyMapped { vaddr } => write!(f, "0x{:x} already mapped", vaddr),
            Self::NotMapped { vaddr } => write!(f, "0x{:x} not mapped", vaddr),
            Self::BadUserPointer { vaddr } => write!(f, "bad user pointer 0x{:x}", vaddr),
            Self::InvalidArgument { name } => write!(f, "invalid argument '{}'", name),
            Self::OutOfRange => write!(f, "value out of range"),
            Self::TaskNotFound { tid } => write!(f, "task {} not found", tid),
            Self::ProcessNotFound { pid } => write!(f, "process {} not found", pid),
            Self::NoChildren => write!(f, "no waitable children"),
            Self::Interrupted => write!(f, "interrupted by signal"),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::BadHandle => write!(f, "bad handle"),
            Self::Busy => write!(f, "resource busy"),
            Self::FileLocked => write!(f, "file locked by another subsystem"),
            Self::NoLock => write!(f, "no fs-level lock support"),
            Self::BrokenPipe => write!(f, "broken pipe"),
            Self::NotATty => write!(f, "not a tty"),
            Self::IllegalSeek => write!(f, "illegal seek"),
            Self::NoEntry => write!(f, "no such file or directory"),
            Self::NotADirectory => write!(f, "not a directory"),
            Self::IsADirectory => write!(f, "is a directory"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::BadExecutable => write!(f, "bad executable image"),
            Self::NotImplemented { what } => write!(f, "not implemented: {}", what),
            Self::NoSuchSyscall { nr } => write!(f, "unknown syscall {}", nr),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
        }
    }
}
