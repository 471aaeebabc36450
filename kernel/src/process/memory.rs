//! Per-process memory: brk and anonymous mmap.
//!
//! Both are backed by zero-page sharing until first write; the COW fault
//! path substitutes private frames. The mmap window is carved by a
//! metadata-only heap owned by the process, so placement policy is just
//! the buddy allocator again.

use crate::config::{MAX_BRK, PAGE_SIZE, USER_MMAP_BASE, USER_MMAP_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::mm::kmalloc::{per_heap_kfree_multi_step, per_heap_kmalloc_multi_step};
use crate::mm::{paging, VirtAddr};

use super::Process;

/// `brk(new_brk)`. Returns the resulting program break; on any invalid
/// request the break is unchanged and its current value returned (the
/// Linux calling convention).
pub fn sys_brk(new_brk: u64) -> u64 {
    let Some(proc) = super::current_process() else {
        return 0;
    };

    proc.fs_lock.lock();
    let result = do_brk(&proc, new_brk);
    proc.fs_lock.unlock();
    result
}

fn do_brk(proc: &Process, new_brk: u64) -> u64 {
    let mut mu = proc.mu.lock();
    let cur = mu.brk;

    if new_brk == 0
        || new_brk % PAGE_SIZE as u64 != 0
        || new_brk < mu.initial_brk
        || new_brk >= MAX_BRK
    {
        return cur;
    }

    if new_brk > cur {
        let pages = ((new_brk - cur) / PAGE_SIZE as u64) as usize;
        let mapped = paging::map_zero_pages(&mut mu.pdir, VirtAddr::new(cur), pages);
        if mapped != pages {
            // Roll the partial growth back.
            paging::unmap_pages_permissive(&mut mu.pdir, VirtAddr::new(cur), mapped, true);
            return cur;
        }
    } else if new_brk < cur {
        let pages = ((cur - new_brk) / PAGE_SIZE as u64) as usize;
        paging::unmap_pages_permissive(&mut mu.pdir, VirtAddr::new(new_brk), pages, true);
    }

    mu.brk = new_brk;
    new_brk
}

/// Anonymous private mmap. Returns the mapped address.
pub fn sys_mmap_anon(len: usize) -> KernelResult<u64> {
    if len == 0 {
        return Err(KernelError::InvalidArgument { name: "len" });
    }
    let proc = super::current_process().ok_or(KernelError::NotInitialized {
        subsystem: "current process",
    })?;

    proc.fs_lock.lock();
    let res = do_mmap(&proc, len);
    proc.fs_lock.unlock();
    res
}

fn do_mmap(proc: &Process, len: usize) -> KernelResult<u64> {
    let mut mu = proc.mu.lock();
    Process::ensure_mmap_heap(&mut mu)?;

    let mut size = len;
    let heap = mu.mmap_heap.as_mut().expect("just ensured");
    let va = per_heap_kmalloc_multi_step(heap, &mut size, PAGE_SIZE)
        .ok_or(KernelError::OutOfMemory)?;
    let pages = size / PAGE_SIZE;

    let mapped = paging::map_zero_pages(&mut mu.pdir, VirtAddr::new(va), pages);
    if mapped != pages {
        paging::unmap_pages_permissive(&mut mu.pdir, VirtAddr::new(va), mapped, true);
        let heap = mu.mmap_heap.as_mut().expect("still there");
        per_heap_kfree_multi_step(heap, va, size, PAGE_SIZE);
        return Err(KernelError::OutOfMemory);
    }

    Ok(va)
}

/// Unmap an anonymous mapping made by [`sys_mmap_anon`].
pub fn sys_munmap(va: u64, len: usize) -> KernelResult<()> {
    if va % PAGE_SIZE as u64 != 0 || len == 0 {
        return Err(KernelError::InvalidArgument { name: "addr" });
    }
    if va < USER_MMAP_BASE || va + len as u64 > USER_MMAP_BASE + USER_MMAP_SIZE {
        return Err(KernelError::InvalidArgument { name: "addr" });
    }
    let proc = super::current_process().ok_or(KernelError::NotInitialized {
        subsystem: "current process",
    })?;

    proc.fs_lock.lock();
    let res = do_munmap(&proc, va, len);
    proc.fs_lock.unlock();
    res
}

fn do_munmap(proc: &Process, va: u64, len: usize) -> KernelResult<()> {
    let mut mu = proc.mu.lock();
    let size = len.div_ceil(PAGE_SIZE) * PAGE_SIZE;

    let heap = mu
        .mmap_heap
        .as_mut()
        .ok_or(KernelError::InvalidArgument { name: "addr" })?;
    per_heap_kfree_multi_step(heap, va, size, PAGE_SIZE);

    let pages = size / PAGE_SIZE;
    paging::unmap_pages_permissive(&mut mu.pdir, VirtAddr::new(va), pages, true);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::test_support::{scrap_process, spawn_process};
    use crate::process::get_process;
    use crate::sched::test_support::set_current;
    use crate::sched::{self, TaskState};

    fn with_proc<R>(f: impl FnOnce() -> R) -> (R, crate::sched::Pid) {
        let pid = spawn_process(0, TaskState::Runnable);
        {
            let p = get_process(pid).unwrap();
            let mut mu = p.mu.lock();
            mu.initial_brk = 0x50_0000;
            mu.brk = 0x50_0000;
        }
        let prev = sched::current_tid();
        set_current(pid);
        let r = f();
        set_current(prev);
        (r, pid)
    }

    fn destroy(pid: crate::sched::Pid) {
        let p = get_process(pid).unwrap();
        let mut mu = p.mu.lock();
        crate::mm::paging::pdir_destroy(&mut mu.pdir);
        drop(mu);
        scrap_process(pid);
    }

    #[test]
    fn test_brk_grow_and_shrink() {
        let ((), pid) = with_proc(|| {
            let base = 0x50_0000u64;
            // Grow by 4 pages.
            assert_eq!(sys_brk(base + 0x4000), base + 0x4000);

            let p = crate::process::current_process().unwrap();
            {
                let mu = p.mu.lock();
                assert!(paging::is_mapped(&mu.pdir, VirtAddr::new(base)));
                assert!(paging::is_mapped(&mu.pdir, VirtAddr::new(base + 0x3000)));
                // Fresh brk pages read as zeros (zero-page backed).
                let mut b = [1u8; 8];
                paging::virtual_read(&mu.pdir, VirtAddr::new(base + 0x1000), &mut b).unwrap();
                assert_eq!(b, [0u8; 8]);
            }

            // Shrink back by 2 pages.
            assert_eq!(sys_brk(base + 0x2000), base + 0x2000);
            {
                let mu = p.mu.lock();
                assert!(paging::is_mapped(&mu.pdir, VirtAddr::new(base + 0x1000)));
                assert!(!paging::is_mapped(&mu.pdir, VirtAddr::new(base + 0x2000)));
            }
        });
        destroy(pid);
    }

    #[test]
    fn test_brk_rejects_bad_values() {
        let ((), pid) = with_proc(|| {
            let base = 0x50_0000u64;
            // Unaligned, below initial, above the cap: all leave brk alone.
            assert_eq!(sys_brk(base + 123), base);
            assert_eq!(sys_brk(base - 0x1000), base);
            assert_eq!(sys_brk(MAX_BRK), base);
            assert_eq!(sys_brk(0), base);
        });
        destroy(pid);
    }

    #[test]
    fn test_mmap_and_munmap_roundtrip() {
        let ((), pid) = with_proc(|| {
            let va = sys_mmap_anon(3 * PAGE_SIZE).unwrap();
            assert_eq!(va % PAGE_SIZE as u64, 0);
            assert!(va >= USER_MMAP_BASE);

            let p = crate::process::current_process().unwrap();
            {
                let mu = p.mu.lock();
                // Zero-backed until written.
                let mut b = [7u8; 16];
                paging::virtual_read(&mu.pdir, VirtAddr::new(va), &mut b).unwrap();
                assert_eq!(b, [0u8; 16]);
            }

            // Write through the COW path gives a private frame.
            {
                let mut mu = p.mu.lock();
                assert!(paging::handle_potential_cow(&mut mu.pdir, VirtAddr::new(va)));
                paging::virtual_write(&mu.pdir, VirtAddr::new(va), &[9u8; 4]).unwrap();
            }

            sys_munmap(va, 3 * PAGE_SIZE).unwrap();
            {
                let mu = p.mu.lock();
                assert!(!paging::is_mapped(&mu.pdir, VirtAddr::new(va)));
            }
        });
        destroy(pid);
    }

    #[test]
    fn test_munmap_validates_range() {
        let ((), pid) = with_proc(|| {
            assert!(sys_munmap(0x1000, PAGE_SIZE).is_err());
            assert!(sys_munmap(USER_MMAP_BASE + 1, PAGE_SIZE).is_err());
        });
        destroy(pid);
    }
}
