//! execve.
//!
//! The incoming image is validated completely before the old user half is
//! torn down, so every failure up to that point leaves the caller's image
//! intact and simply returns the error.

use alloc::vec::Vec;

use crate::config::{PAGE_SIZE, USER_STACK_PAGES, USER_STACK_TOP};
use crate::elf;
use crate::error::{KernelError, KernelResult};
use crate::mm::frame::FRAME_ALLOCATOR;
use crate::mm::paging::{self, PteFlags};
use crate::mm::{physmem, VirtAddr};
use crate::sched;

use super::signal::SigAction;

/// Build the initial user stack: strings, argv/envp pointer arrays, argc,
/// and an empty auxv. Returns the initial stack pointer.
fn build_user_stack(
    pdir: &paging::PageDirectory,
    argv: &[&str],
    envp: &[&str],
) -> KernelResult<u64> {
    // Strings live at the very top, pointer arrays right below.
    let strings_len: usize = argv.iter().chain(envp).map(|s| s.len() + 1).sum();
    let strings_base = (USER_STACK_TOP - strings_len as u64) & !0x7;

    let mut ptrs: Vec<u64> = Vec::new();
    ptrs.push(argv.len() as u64); // argc

    let mut cursor = strings_base;
    let mut string_block: Vec<u8> = Vec::with_capacity(strings_len);
    let mut push_strings = |items: &[&str], ptrs: &mut Vec<u64>, cursor: &mut u64| {
        for s in items {
            ptrs.push(*cursor);
            string_block.extend_from_slice(s.as_bytes());
            string_block.push(0);
            *cursor += s.len() as u64 + 1;
        }
        ptrs.push(0); // terminator
    };
    push_strings(argv, &mut ptrs, &mut cursor);
    push_strings(envp, &mut ptrs, &mut cursor);
    ptrs.push(0); // AT_NULL
    ptrs.push(0);

    let ptr_bytes: Vec<u8> = ptrs.iter().flat_map(|p| p.to_le_bytes()).collect();
    let sp = (strings_base - ptr_bytes.len() as u64) & !0xF;

    paging::virtual_write(pdir, VirtAddr::new(sp), &ptr_bytes)?;
    paging::virtual_write(pdir, VirtAddr::new(strings_base), &string_block)?;
    Ok(sp)
}

/// Map a fresh user stack (private zeroed frames: the top pages receive
/// the argument block immediately, so zero-page sharing buys nothing).
fn map_user_stack(pdir: &mut paging::PageDirectory) -> KernelResult<()> {
    let base = USER_STACK_TOP - (USER_STACK_PAGES * PAGE_SIZE) as u64;
    for i in 0..USER_STACK_PAGES {
        let va = VirtAddr::new(base + (i * PAGE_SIZE) as u64);
        let pa = FRAME_ALLOCATOR
            .lock()
            .alloc_page()
            .ok_or(KernelError::OutOfMemory)?;
        physmem::zero_frame(pa.frame());
        paging::map_page(pdir, va, pa, PteFlags::RW | PteFlags::USER)?;
    }
    Ok(())
}

/// Kernel-side entry of a task that starts (or restarts) life in user
/// mode: load the saved frame and drop to ring 3.
pub(crate) extern "C" fn user_mode_entry(pid: usize) -> ! {
    let regs = sched::with_task(pid as u32, |t| t.user_regs)
        .flatten()
        .expect("user task has a register frame");
    crate::arch::enter_user_mode(&regs);
}

/// Create a fresh usermode process from an ELF image: new pid, new pdir,
/// loaded segments, argv/env stack, ready to run. The caller's process (if
/// any) becomes the parent.
pub fn setup_process(image: &[u8], argv: &[&str], envp: &[&str]) -> KernelResult<crate::sched::Pid> {
    use crate::sched::{task::KernelStack, Task, TaskState};

    let elf_image = elf::parse(image)?;
    let pid = sched::with_scheduler(|s| crate::sched::task::alloc_pid(s.tasks()))?;

    let parent = super::current_process();
    let (ppid, pgid) = match &parent {
        Some(p) => (p.pid, p.pgid()),
        None => (0, pid),
    };

    let proc = alloc::sync::Arc::new(super::Process::new(pid, ppid, pgid));
    let (loaded, sp) = {
        let mut mu = proc.mu.lock();
        let loaded = match elf::load(&elf_image, &mut mu.pdir)
            .and_then(|l| map_user_stack(&mut mu.pdir).map(|()| l))
        {
            Ok(l) => l,
            Err(e) => {
                paging::pdir_destroy(&mut mu.pdir);
                return Err(e);
            }
        };
        let sp = match build_user_stack(&mu.pdir, argv, envp) {
            Ok(sp) => sp,
            Err(e) => {
                paging::pdir_destroy(&mut mu.pdir);
                return Err(e);
            }
        };
        mu.brk = loaded.brk_start;
        mu.initial_brk = loaded.brk_start;
        (loaded, sp)
    };

    let stack = KernelStack::alloc()?;
    let mut task = Task::new(pid);
    task.process = Some(pid);
    task.user_regs = Some(crate::arch::UserRegs {
        pc: loaded.entry,
        sp,
        ret: 0,
        args: [0; 3],
        flags: 0,
    });
    task.context = crate::arch::Context::new_kthread(user_mode_entry, pid as usize, stack.top());
    task.kernel_stack = Some(stack);
    task.state = TaskState::Runnable;

    if let Some(p) = &parent {
        p.mu.lock().children.push(pid);
    }
    super::add_process(proc);
    sched::add_task(task);
    Ok(pid)
}

/// Replace the current process image. On success the task's saved user
/// frame points at the new entry; the syscall return path lands there.
pub fn do_execve(image: &[u8], argv: &[&str], envp: &[&str]) -> KernelResult<()> {
    let me = sched::current_tid();
    let proc = super::current_process().ok_or(KernelError::NotInitialized {
        subsystem: "current process",
    })?;

    // Everything fallible about the *image* happens before teardown.
    let elf_image = elf::parse(image)?;

    let _g = sched::PreemptGuard::new();
    let mut mu = proc.mu.lock();

    // Point of no return: drop the old user half.
    paging::pdir_destroy(&mut mu.pdir);
    mu.mmap_heap = None;

    let loaded = match elf::load(&elf_image, &mut mu.pdir)
        .and_then(|l| map_user_stack(&mut mu.pdir).map(|()| l))
    {
        Ok(l) => l,
        Err(e) => {
            // The old image is already gone; this process cannot continue.
            drop(mu);
            super::exit::terminate(me, super::signal::encode_signaled(super::signal::SIGKILL));
            return Err(e);
        }
    };

    let sp = match build_user_stack(&mu.pdir, argv, envp) {
        Ok(sp) => sp,
        Err(e) => {
            drop(mu);
            super::exit::terminate(me, super::signal::encode_signaled(super::signal::SIGKILL));
            return Err(e);
        }
    };

    mu.brk = loaded.brk_start;
    mu.initial_brk = loaded.brk_start;
    mu.did_exec = true;

    // Close-on-exec handles go; caught signals fall back to default
    // (ignored dispositions survive, per POSIX).
    for slot in mu.handles.iter_mut() {
        if slot.as_ref().map(|h| h.cloexec).unwrap_or(false) {
            *slot = None;
        }
    }
    for h in mu.sig_handlers.iter_mut() {
        if matches!(h, SigAction::Handler(_)) {
            *h = SigAction::Default;
        }
    }

    // vfork resolution: the parent resumes now.
    let was_vforked = core::mem::take(&mut mu.vforked);
    drop(mu);

    if was_vforked {
        let ppid = proc.ppid();
        sched::with_task(ppid, |t| t.vfork_stopped = false);
    }

    sched::with_task(me, |t| {
        t.user_regs = Some(crate::arch::UserRegs {
            pc: loaded.entry,
            sp,
            ret: 0,
            args: [0; 3],
            flags: 0,
        });
    });

    crate::arch::tlb_flush_all();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::test_support::synth_elf;
    use crate::fs::pipe::create_pipe;
    use crate::process::test_support::{scrap_process, spawn_process};
    use crate::process::{get_process, Process};
    use crate::sched::test_support::set_current;
    use crate::sched::TaskState;

    #[test]
    fn test_execve_replaces_image_and_builds_stack() {
        let pid = spawn_process(0, TaskState::Runnable);
        let p = get_process(pid).unwrap();

        // Old image: one page mapped; plus one cloexec and one plain
        // handle, and a caught signal.
        {
            let mut mu = p.mu.lock();
            let pa = FRAME_ALLOCATOR.lock().alloc_page().unwrap();
            paging::map_page(
                &mut mu.pdir,
                VirtAddr::new(0x70_0000),
                pa,
                PteFlags::RW | PteFlags::USER,
            )
            .unwrap();

            let (r, w) = create_pipe();
            let mut rh = r;
            rh.cloexec = true;
            Process::install_handle(&mut mu, rh).unwrap();
            Process::install_handle(&mut mu, w).unwrap();
            mu.sig_handlers[crate::process::signal::SIGTERM] = SigAction::Handler(0x1234);
            mu.sig_handlers[crate::process::signal::SIGHUP] = SigAction::Ignore;
        }

        let img = synth_elf(0x40_0000, b"\x90\x90\x90", 0x1000);

        let prev = sched::current_tid();
        set_current(pid);
        do_execve(&img, &["prog", "arg1"], &["PATH=/bin"]).unwrap();
        set_current(prev);

        let mu = p.mu.lock();
        // Old mapping is gone; the new image and stack are in.
        assert!(!paging::is_mapped(&mu.pdir, VirtAddr::new(0x70_0000)));
        assert!(paging::is_mapped(&mu.pdir, VirtAddr::new(0x40_0000)));
        assert_eq!(mu.initial_brk, 0x40_2000);
        assert!(mu.did_exec);

        // cloexec handle closed, the other kept.
        assert!(mu.handles[0].is_none());
        assert!(mu.handles[1].is_some());

        // Caught handler reset, ignored one preserved.
        assert_eq!(
            mu.sig_handlers[crate::process::signal::SIGTERM],
            SigAction::Default
        );
        assert_eq!(
            mu.sig_handlers[crate::process::signal::SIGHUP],
            SigAction::Ignore
        );

        // Entry registers and a well-formed argument block.
        let regs = sched::with_task(pid, |t| t.user_regs.unwrap()).unwrap();
        assert_eq!(regs.pc, 0x40_0000);
        assert_eq!(regs.sp % 16, 0);

        let mut argc = [0u8; 8];
        paging::virtual_read(&mu.pdir, VirtAddr::new(regs.sp), &mut argc).unwrap();
        assert_eq!(u64::from_le_bytes(argc), 2);

        // argv[0] points at "prog".
        let mut pptr = [0u8; 8];
        paging::virtual_read(&mu.pdir, VirtAddr::new(regs.sp + 8), &mut pptr).unwrap();
        let argv0 = u64::from_le_bytes(pptr);
        let mut s = [0u8; 5];
        paging::virtual_read(&mu.pdir, VirtAddr::new(argv0), &mut s).unwrap();
        assert_eq!(&s, b"prog\0");

        drop(mu);
        {
            let mut mu = p.mu.lock();
            paging::pdir_destroy(&mut mu.pdir);
        }
        scrap_process(pid);
    }

    #[test]
    fn test_execve_bad_image_keeps_old_state() {
        let pid = spawn_process(0, TaskState::Runnable);
        let p = get_process(pid).unwrap();
        {
            let mut mu = p.mu.lock();
            let pa = FRAME_ALLOCATOR.lock().alloc_page().unwrap();
            paging::map_page(
                &mut mu.pdir,
                VirtAddr::new(0x70_0000),
                pa,
                PteFlags::RW | PteFlags::USER,
            )
            .unwrap();
        }

        let prev = sched::current_tid();
        set_current(pid);
        let e = do_execve(b"garbage", &[], &[]).unwrap_err();
        set_current(prev);
        assert_eq!(e, KernelError::BadExecutable);

        // Old mapping survives a pre-teardown failure.
        let mu = p.mu.lock();
        assert!(paging::is_mapped(&mu.pdir, VirtAddr::new(0x70_0000)));
        drop(mu);
        {
            let mut mu = p.mu.lock();
            paging::pdir_destroy(&mut mu.pdir);
        }
        scrap_process(pid);
    }
}
