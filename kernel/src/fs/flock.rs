//! Subsystem-wide exclusive file locks.
//!
//! Whole kernel subsystems (not tasks) claim exclusive use of an inode:
//! mapping an executable, or exec-ing it. A nested acquire by the same
//! subsystem retains the existing lock; an acquire while another subsystem
//! holds it fails with the text-busy error. The lock object dies with its
//! last release.

use alloc::collections::BTreeMap;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// The subsystems that may hold per-file exclusive locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    /// Process memory mapping (file-backed mmap).
    Mmap,
    /// execve loading an image.
    Exec,
}

/// Identity of a locked file: filesystem instance + inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileId {
    pub fs: u32,
    pub inode: u64,
}

struct LockedFile {
    owner: Subsystem,
    refcount: u32,
}

static LOCKS: Mutex<BTreeMap<FileId, LockedFile>> = Mutex::new(BTreeMap::new());

/// Opaque reference to a held lock; release it with [`release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRef(FileId);

/// Acquire (or re-acquire) the exclusive lock on `file` for `subsys`.
pub fn acquire(file: FileId, subsys: Subsystem) -> KernelResult<LockRef> {
    let mut locks = LOCKS.lock();

    if let Some(lf) = locks.get_mut(&file) {
        if lf.owner == subsys {
            lf.refcount += 1;
            return Ok(LockRef(file));
        }
        return Err(KernelError::FileLocked);
    }

    locks.insert(
        file,
        LockedFile {
            owner: subsys,
            refcount: 1,
        },
    );
    Ok(LockRef(file))
}

/// Take one more reference on an already-held lock.
pub fn retain(lock: LockRef) {
    let mut locks = LOCKS.lock();
    let lf = locks.get_mut(&lock.0).expect("retain of a dead file lock");
    lf.refcount += 1;
}

/// Drop one reference; the last one destroys the lock object.
pub fn release(lock: LockRef) {
    let mut locks = LOCKS.lock();
    let lf = locks.get_mut(&lock.0).expect("release of a dead file lock");
    lf.refcount -= 1;
    if lf.refcount == 0 {
        locks.remove(&lock.0);
    }
}

/// Which subsystem holds `file`, if any.
pub fn holder(file: FileId) -> Option<Subsystem> {
    LOCKS.lock().get(&file).map(|lf| lf.owner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fid(inode: u64) -> FileId {
        FileId { fs: 1, inode }
    }

    #[test]
    fn test_same_subsystem_retains() {
        let f = fid(100);
        let l1 = acquire(f, Subsystem::Mmap).unwrap();
        let l2 = acquire(f, Subsystem::Mmap).unwrap();
        assert_eq!(holder(f), Some(Subsystem::Mmap));

        release(l1);
        // Still held by the second reference.
        assert_eq!(holder(f), Some(Subsystem::Mmap));
        release(l2);
        assert_eq!(holder(f), None);
    }

    #[test]
    fn test_foreign_subsystem_gets_txtbsy() {
        let f = fid(101);
        let l = acquire(f, Subsystem::Exec).unwrap();

        let e = acquire(f, Subsystem::Mmap).unwrap_err();
        assert_eq!(e, KernelError::FileLocked);
        assert_eq!(e.errno(), crate::error::Errno::Txtbsy);

        release(l);
        // Free again: the other subsystem may now take it.
        let l2 = acquire(f, Subsystem::Mmap).unwrap();
        release(l2);
    }

    #[test]
    fn test_retain_extends_lifetime() {
        let f = fid(102);
        let l = acquire(f, Subsystem::Mmap).unwrap();
        retain(l);
        release(l);
        assert_eq!(holder(f), Some(Subsystem::Mmap));
        release(l);
        assert_eq!(holder(f), None);
    }

    #[test]
    fn test_independent_inodes_do_not_conflict() {
        let a = acquire(fid(103), Subsystem::Exec).unwrap();
        let b = acquire(fid(104), Subsystem::Mmap).unwrap();
        release(a);
        release(b);
    }
}
