//! Probe-and-copy access to user memory.
//!
//! Every transfer runs under a fault-resumable frame and walks the calling
//! process's directory explicitly; an unmapped page surfaces as the
//! user-pointer error, never as a kernel fault. Writes resolve COW first,
//! exactly as a user-mode store would.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;

use crate::config::{PAGE_SIZE, USER_VMEM_END};
use crate::error::{KernelError, KernelResult};
use crate::fault::{fault_resumable_call, FAULT_PAGE};
use crate::mm::paging::{self, PteFlags};
use crate::mm::VirtAddr;
use crate::process::Process;

fn current_proc() -> KernelResult<Arc<Process>> {
    crate::process::current_process().ok_or(KernelError::NotInitialized {
        subsystem: "current process",
    })
}

fn check_user_range(va: u64, len: usize) -> KernelResult<()> {
    let end = va.checked_add(len as u64).ok_or(KernelError::BadUserPointer { vaddr: va })?;
    if end > USER_VMEM_END {
        return Err(KernelError::BadUserPointer { vaddr: va });
    }
    Ok(())
}

/// Copy `dst.len()` bytes from user space.
pub fn copy_from_user(dst: &mut [u8], user_va: u64) -> KernelResult<()> {
    check_user_range(user_va, dst.len())?;
    let proc = current_proc()?;

    let faults = fault_resumable_call(1 << FAULT_PAGE, || {
        let mu = proc.mu.lock();
        paging::virtual_read(&mu.pdir, VirtAddr::new(user_va), dst).map_err(|_| FAULT_PAGE)
    });

    if faults == 0 {
        Ok(())
    } else {
        Err(KernelError::BadUserPointer { vaddr: user_va })
    }
}

/// Copy `src` into user space, resolving COW along the way.
pub fn copy_to_user(user_va: u64, src: &[u8]) -> KernelResult<()> {
    check_user_range(user_va, src.len())?;
    let proc = current_proc()?;

    let faults = fault_resumable_call(1 << FAULT_PAGE, || {
        let mut mu = proc.mu.lock();

        // Make every touched page privately writable first, the way the
        // MMU would on a user store.
        let first = user_va & !(PAGE_SIZE as u64 - 1);
        let last = (user_va + src.len() as u64 - 1) & !(PAGE_SIZE as u64 - 1);
        let mut page = first;
        while page <= last {
            match paging::translate(&mu.pdir, VirtAddr::new(page)) {
                Some((_, flags)) if flags.contains(PteFlags::RW) => {}
                Some(_) => {
                    if !paging::handle_potential_cow(&mut mu.pdir, VirtAddr::new(page)) {
                        return Err(FAULT_PAGE);
                    }
                }
                None => return Err(FAULT_PAGE),
            }
            page += PAGE_SIZE as u64;
        }

        paging::virtual_write(&mu.pdir, VirtAddr::new(user_va), src).map_err(|_| FAULT_PAGE)
    });

    if faults == 0 {
        Ok(())
    } else {
        Err(KernelError::BadUserPointer { vaddr: user_va })
    }
}

/// Copy a NUL-terminated string from user space, up to `max` bytes.
pub fn copy_str_from_user(user_va: u64, max: usize) -> KernelResult<String> {
    let mut out: alloc::vec::Vec<u8> = alloc::vec::Vec::new();
    let mut va = user_va;

    loop {
        // Read chunk-wise up to the next page boundary.
        let page_rest = PAGE_SIZE - (va as usize & (PAGE_SIZE - 1));
        let chunk = page_rest.min(max + 1 - out.len());
        let mut buf = vec![0u8; chunk];
        copy_from_user(&mut buf, va)?;

        if let Some(nul) = buf.iter().position(|&b| b == 0) {
            out.extend_from_slice(&buf[..nul]);
            return String::from_utf8(out).map_err(|_| KernelError::InvalidArgument { name: "str" });
        }

        out.extend_from_slice(&buf);
        if out.len() > max {
            return Err(KernelError::InvalidArgument { name: "path too long" });
        }
        va += chunk as u64;
    }
}

/// Copy a `u64` value to a user pointer.
pub fn put_user_u64(user_va: u64, val: u64) -> KernelResult<()> {
    copy_to_user(user_va, &val.to_le_bytes())
}

/// Copy a `i32` value to a user pointer.
pub fn put_user_i32(user_va: u64, val: i32) -> KernelResult<()> {
    copy_to_user(user_va, &val.to_le_bytes())
}

/// Read a `u64` from a user pointer.
pub fn get_user_u64(user_va: u64) -> KernelResult<u64> {
    let mut b = [0u8; 8];
    copy_from_user(&mut b, user_va)?;
    Ok(u64::from_le_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame::FRAME_ALLOCATOR;
    use crate::process::test_support::{scrap_process, spawn_process};
    use crate::process::get_process;
    use crate::sched::test_support::set_current;
    use crate::sched::{self, TaskState};

    fn with_mapped_proc<R>(f: impl FnOnce(u64) -> R) -> R {
        let pid = spawn_process(0, TaskState::Runnable);
        let va = 0x60_0000u64;
        {
            let p = get_process(pid).unwrap();
            let mut mu = p.mu.lock();
            let pa = FRAME_ALLOCATOR.lock().alloc_page().unwrap();
            crate::mm::physmem::zero_frame(pa.frame());
            paging::map_page(&mut mu.pdir, VirtAddr::new(va), pa, PteFlags::RW | PteFlags::USER)
                .unwrap();
        }
        let prev = sched::current_tid();
        set_current(pid);
        let r = f(va);
        set_current(prev);
        {
            let p = get_process(pid).unwrap();
            let mut mu = p.mu.lock();
            paging::pdir_destroy(&mut mu.pdir);
        }
        scrap_process(pid);
        r
    }

    #[test]
    fn test_copy_roundtrip() {
        with_mapped_proc(|va| {
            copy_to_user(va + 10, b"payload").unwrap();
            let mut buf = [0u8; 7];
            copy_from_user(&mut buf, va + 10).unwrap();
            assert_eq!(&buf, b"payload");
        });
    }

    #[test]
    fn test_unmapped_pointer_faults_cleanly() {
        with_mapped_proc(|_va| {
            let before = sched::disable_preemption_count();

            let mut buf = [0u8; 4];
            let e = copy_from_user(&mut buf, 0x7000_0000).unwrap_err();
            assert!(matches!(e, KernelError::BadUserPointer { .. }));
            assert_eq!(e.errno(), crate::error::Errno::Fault);

            // The catch frame restored the preemption depth.
            assert_eq!(sched::disable_preemption_count(), before);
        });
    }

    #[test]
    fn test_copy_to_user_resolves_cow() {
        let pid = spawn_process(0, TaskState::Runnable);
        let va = 0x61_0000u64;
        {
            let p = get_process(pid).unwrap();
            let mut mu = p.mu.lock();
            paging::map_zero_page(&mut mu.pdir, VirtAddr::new(va)).unwrap();
        }

        let prev = sched::current_tid();
        set_current(pid);
        copy_to_user(va, b"Z").unwrap();
        let mut b = [0u8; 1];
        copy_from_user(&mut b, va).unwrap();
        assert_eq!(&b, b"Z");
        set_current(prev);

        // The shared zero page itself must still be all zeroes.
        {
            let p = get_process(pid).unwrap();
            let mut mu = p.mu.lock();
            let other = 0x62_0000u64;
            paging::map_zero_page(&mut mu.pdir, VirtAddr::new(other)).unwrap();
            let mut z = [9u8; 4];
            paging::virtual_read(&mu.pdir, VirtAddr::new(other), &mut z).unwrap();
            assert_eq!(z, [0u8; 4]);
            paging::pdir_destroy(&mut mu.pdir);
        }
        scrap_process(pid);
    }

    #[test]
    fn test_copy_str_from_user() {
        with_mapped_proc(|va| {
            copy_to_user(va, b"hello\0world").unwrap();
            let s = copy_str_from_user(va, 64).unwrap();
            assert_eq!(s, "hello");

            // Unterminated within the limit: error.
            copy_to_user(va + 100, &[b'x'; 32]).unwrap();
            assert!(copy_str_from_user(va + 100, 8).is_err());
        });
    }

    #[test]
    fn test_kernel_range_rejected() {
        with_mapped_proc(|_| {
            let mut b = [0u8; 8];
            let e = copy_from_user(&mut b, crate::config::KERNEL_BASE_VA).unwrap_err();
            assert!(matches!(e, KernelError::BadUserPointer { .. }));
        });
    }
}
