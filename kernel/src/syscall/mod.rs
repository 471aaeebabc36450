//! The syscall surface: a fixed numeric table with Linux/i386-compatible
//! numbers for the implemented subset.
//!
//! Handlers translate internal errors to a negative errno at this boundary
//! and nowhere else. Unknown numbers return `-ENOSYS`.

pub mod user;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::config::TIMER_HZ;
use crate::error::{Errno, KernelError, KernelResult};
use crate::fs::poll::PollEntry;
use crate::fs::{Handle, PollMask};
use crate::process::wait::WaitOptions;
use crate::process::{self, signal, Process};
use crate::sched;

pub const SYS_EXIT: usize = 1;
pub const SYS_FORK: usize = 2;
pub const SYS_READ: usize = 3;
pub const SYS_WRITE: usize = 4;
pub const SYS_OPEN: usize = 5;
pub const SYS_CLOSE: usize = 6;
pub const SYS_WAITPID: usize = 7;
pub const SYS_EXECVE: usize = 11;
pub const SYS_CHDIR: usize = 12;
pub const SYS_GETPID: usize = 20;
pub const SYS_BRK: usize = 45;
pub const SYS_IOCTL: usize = 54;
pub const SYS_GETPPID: usize = 64;
pub const SYS_NANOSLEEP: usize = 162;
pub const SYS_POLL: usize = 168;
pub const SYS_VFORK: usize = 190;
pub const SYS_MMAP_PGOFF: usize = 192;
pub const SYS_EXIT_GROUP: usize = 252;
pub const SYS_SET_TID_ADDRESS: usize = 258;

const PATH_MAX: usize = 255;
const ARG_MAX_ITEMS: usize = 64;
/// Per-transfer cap for read/write kernel bounce buffers.
const IO_CHUNK: usize = 64 * 1024;

/// How execve turns a path into image bytes. The VFS lives outside the
/// core; whoever owns it (or a test harness with embedded images)
/// registers the resolver here.
pub type ImageResolver = fn(&str) -> Option<&'static [u8]>;

static IMAGE_RESOLVER: Mutex<Option<ImageResolver>> = Mutex::new(None);

pub fn set_image_resolver(f: ImageResolver) {
    *IMAGE_RESOLVER.lock() = Some(f);
}

fn ok_or_errno(r: KernelResult<isize>) -> isize {
    match r {
        Ok(v) => v,
        Err(e) => e.as_syscall_ret(),
    }
}

fn current_proc() -> KernelResult<Arc<Process>> {
    process::current_process().ok_or(KernelError::NotInitialized {
        subsystem: "current process",
    })
}

fn get_handle(fd: u64) -> KernelResult<Handle> {
    let proc = current_proc()?;
    let mu = proc.mu.lock();
    mu.handles
        .get(fd as usize)
        .and_then(|h| h.clone())
        .ok_or(KernelError::BadHandle)
}

// ---------------------------------------------------------------------------
// Individual handlers
// ---------------------------------------------------------------------------

fn sys_read(fd: u64, buf: u64, count: u64) -> KernelResult<isize> {
    let h = get_handle(fd)?;
    let n = (count as usize).min(IO_CHUNK);
    let mut kbuf = vec![0u8; n];

    let got = h.ops.read(&mut kbuf, h.nonblock)?;
    user::copy_to_user(buf, &kbuf[..got])?;
    Ok(got as isize)
}

fn sys_write(fd: u64, buf: u64, count: u64) -> KernelResult<isize> {
    let h = get_handle(fd)?;
    let n = (count as usize).min(IO_CHUNK);
    let mut kbuf = vec![0u8; n];
    user::copy_from_user(&mut kbuf, buf)?;

    match h.ops.write(&kbuf, h.nonblock) {
        Ok(done) => Ok(done as isize),
        Err(KernelError::BrokenPipe) => {
            // EPIPE comes with SIGPIPE to self.
            let _ = signal::send_signal(sched::current_tid(), signal::SIGPIPE);
            Err(KernelError::BrokenPipe)
        }
        Err(e) => Err(e),
    }
}

fn sys_open(path_ptr: u64, _flags: u64, _mode: u64) -> KernelResult<isize> {
    let _path = user::copy_str_from_user(path_ptr, PATH_MAX)?;
    // No filesystem is mounted by the core; the VFS is an external
    // collaborator reached through its own registration, like the image
    // resolver. Until one is wired up, every lookup misses.
    Err(KernelError::NoEntry)
}

fn sys_close(fd: u64) -> KernelResult<isize> {
    let proc = current_proc()?;
    let mut mu = proc.mu.lock();
    let slot = mu
        .handles
        .get_mut(fd as usize)
        .ok_or(KernelError::BadHandle)?;
    if slot.take().is_none() {
        return Err(KernelError::BadHandle);
    }
    Ok(0)
}

fn sys_waitpid(pid: u64, wstatus_ptr: u64, options: u64) -> KernelResult<isize> {
    let opts = WaitOptions::from_bits_truncate(options as u32);
    match process::wait::sys_waitpid(pid as i64 as i32, opts)? {
        Some((child, wstatus)) => {
            if wstatus_ptr != 0 {
                user::put_user_i32(wstatus_ptr, wstatus)?;
            }
            Ok(child as isize)
        }
        None => Ok(0),
    }
}

fn read_user_str_array(ptr: u64) -> KernelResult<Vec<String>> {
    let mut out = Vec::new();
    if ptr == 0 {
        return Ok(out);
    }
    for i in 0..ARG_MAX_ITEMS {
        let slot = user::get_user_u64(ptr + (i * 8) as u64)?;
        if slot == 0 {
            return Ok(out);
        }
        out.push(user::copy_str_from_user(slot, PATH_MAX)?);
    }
    Err(KernelError::InvalidArgument { name: "argv" })
}

fn sys_execve(path_ptr: u64, argv_ptr: u64, envp_ptr: u64) -> KernelResult<isize> {
    let path = user::copy_str_from_user(path_ptr, PATH_MAX)?;
    let argv = read_user_str_array(argv_ptr)?;
    let envp = read_user_str_array(envp_ptr)?;

    let resolver = IMAGE_RESOLVER.lock().ok_or(KernelError::NoEntry)?;
    let image = resolver(&path).ok_or(KernelError::NoEntry)?;

    let argv_refs: Vec<&str> = argv.iter().map(|s| s.as_str()).collect();
    let envp_refs: Vec<&str> = envp.iter().map(|s| s.as_str()).collect();
    process::exec::do_execve(image, &argv_refs, &envp_refs)?;
    Ok(0)
}

/// Purely textual normalization; the path resolution against a real tree
/// belongs to the external VFS.
pub fn normalize_path(cwd: &str, path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let abs = path.starts_with('/');
    let base = if abs { "" } else { cwd };

    for comp in base.split('/').chain(path.split('/')) {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c => parts.push(c),
        }
    }

    let mut out = String::from("/");
    out.push_str(&parts.join("/"));
    out
}

fn sys_chdir(path_ptr: u64) -> KernelResult<isize> {
    let path = user::copy_str_from_user(path_ptr, PATH_MAX)?;
    let proc = current_proc()?;

    proc.fs_lock.lock();
    {
        let mut mu = proc.mu.lock();
        let cwd = mu.cwd.clone();
        mu.cwd = normalize_path(&cwd, &path);
    }
    proc.fs_lock.unlock();
    Ok(0)
}

fn sys_getpid() -> KernelResult<isize> {
    Ok(current_proc()?.pid as isize)
}

fn sys_getppid() -> KernelResult<isize> {
    Ok(current_proc()?.ppid() as isize)
}

fn sys_ioctl(fd: u64, req: u64, argp: u64) -> KernelResult<isize> {
    let h = get_handle(fd)?;
    let r = h.ops.ioctl(req as u32, argp)?;
    Ok(r as isize)
}

fn sys_nanosleep(req_ptr: u64, _rem_ptr: u64) -> KernelResult<isize> {
    let sec = user::get_user_u64(req_ptr)? as i64;
    let nsec = user::get_user_u64(req_ptr + 8)? as i64;
    if sec < 0 || !(0..1_000_000_000).contains(&nsec) {
        return Err(KernelError::InvalidArgument { name: "timespec" });
    }

    let ticks = sec as u64 * TIMER_HZ as u64
        + (nsec as u64 * TIMER_HZ as u64).div_ceil(1_000_000_000);
    sched::kernel_sleep(ticks.max(1));
    Ok(0)
}

fn sys_poll(fds_ptr: u64, nfds: u64, timeout_ms: i64) -> KernelResult<isize> {
    const POLLFD_SIZE: usize = 8; // { i32 fd, i16 events, i16 revents }
    let nfds = nfds as usize;
    if nfds > crate::config::MAX_HANDLES {
        return Err(KernelError::InvalidArgument { name: "nfds" });
    }

    let mut raw = vec![0u8; nfds * POLLFD_SIZE];
    user::copy_from_user(&mut raw, fds_ptr)?;

    let mut entries = Vec::with_capacity(nfds);
    for i in 0..nfds {
        let off = i * POLLFD_SIZE;
        let fd = i32::from_le_bytes(raw[off..off + 4].try_into().expect("4 bytes"));
        let events = u16::from_le_bytes(raw[off + 4..off + 6].try_into().expect("2 bytes"));
        let h = get_handle(fd as u64)?;
        entries.push(PollEntry::new(h.ops, PollMask::from_bits_truncate(events)));
    }

    let timeout_ticks = match timeout_ms {
        t if t < 0 => None,
        0 => Some(0),
        t => Some((t as u64 * TIMER_HZ as u64).div_ceil(1000).max(1)),
    };

    let ready = crate::fs::poll::poll(&mut entries, timeout_ticks);

    for (i, e) in entries.iter().enumerate() {
        let off = i * POLLFD_SIZE + 6;
        raw[off..off + 2].copy_from_slice(&e.revents.bits().to_le_bytes());
    }
    user::copy_to_user(fds_ptr, &raw)?;
    Ok(ready as isize)
}

fn sys_mmap_pgoff(_addr: u64, len: u64, _prot: u64, flags: u64, fd: u64, _pgoff: u64) -> KernelResult<isize> {
    const MAP_PRIVATE: u64 = 0x02;
    const MAP_ANONYMOUS: u64 = 0x20;

    // Anonymous private mappings only, in scope.
    if flags & MAP_ANONYMOUS == 0 || flags & MAP_PRIVATE == 0 || fd as i64 != -1 {
        return Err(KernelError::InvalidArgument { name: "flags" });
    }

    let va = process::memory::sys_mmap_anon(len as usize)?;
    Ok(va as isize)
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Entry from the trap layer: syscall number plus up to six arguments.
pub fn dispatch(nr: usize, args: [u64; 6]) -> isize {
    let [a0, a1, a2, a3, a4, a5] = args;

    match nr {
        SYS_EXIT | SYS_EXIT_GROUP => process::exit::do_exit(a0 as i32),
        SYS_FORK => ok_or_errno(process::fork::do_fork(false).map(|pid| pid as isize)),
        SYS_VFORK => ok_or_errno(process::fork::do_fork(true).map(|pid| pid as isize)),
        SYS_READ => ok_or_errno(sys_read(a0, a1, a2)),
        SYS_WRITE => ok_or_errno(sys_write(a0, a1, a2)),
        SYS_OPEN => ok_or_errno(sys_open(a0, a1, a2)),
        SYS_CLOSE => ok_or_errno(sys_close(a0)),
        SYS_WAITPID => ok_or_errno(sys_waitpid(a0, a1, a2)),
        SYS_EXECVE => ok_or_errno(sys_execve(a0, a1, a2)),
        SYS_CHDIR => ok_or_errno(sys_chdir(a0)),
        SYS_GETPID => ok_or_errno(sys_getpid()),
        SYS_GETPPID => ok_or_errno(sys_getppid()),
        SYS_BRK => process::memory::sys_brk(a0) as isize,
        SYS_IOCTL => ok_or_errno(sys_ioctl(a0, a1, a2)),
        SYS_NANOSLEEP => ok_or_errno(sys_nanosleep(a0, a1)),
        SYS_POLL => ok_or_errno(sys_poll(a0, a1, a2 as i64)),
        SYS_MMAP_PGOFF => ok_or_errno(sys_mmap_pgoff(a0, a1, a2, a3, a4, a5)),
        SYS_SET_TID_ADDRESS => sched::current_tid() as isize,
        _ => Errno::Nosys.as_neg(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::pipe::create_pipe;
    use crate::mm::frame::FRAME_ALLOCATOR;
    use crate::mm::paging::{self, PteFlags};
    use crate::mm::VirtAddr;
    use crate::process::test_support::{scrap_process, spawn_process};
    use crate::process::get_process;
    use crate::sched::test_support::set_current;
    use crate::sched::TaskState;

    fn args(a: &[u64]) -> [u64; 6] {
        let mut out = [0u64; 6];
        out[..a.len()].copy_from_slice(a);
        out
    }

    /// Process with one RW page at 0x60_0000 for user buffers.
    fn setup_proc() -> (crate::sched::Pid, u64) {
        let pid = spawn_process(0, TaskState::Runnable);
        let va = 0x60_0000u64;
        let p = get_process(pid).unwrap();
        let mut mu = p.mu.lock();
        let pa = FRAME_ALLOCATOR.lock().alloc_page().unwrap();
        crate::mm::physmem::zero_frame(pa.frame());
        paging::map_page(&mut mu.pdir, VirtAddr::new(va), pa, PteFlags::RW | PteFlags::USER)
            .unwrap();
        drop(mu);
        (pid, va)
    }

    fn teardown_proc(pid: crate::sched::Pid) {
        let p = get_process(pid).unwrap();
        let mut mu = p.mu.lock();
        paging::pdir_destroy(&mut mu.pdir);
        drop(mu);
        scrap_process(pid);
    }

    #[test]
    fn test_unknown_syscall_is_enosys() {
        assert_eq!(dispatch(9999, args(&[])), -38);
    }

    #[test]
    fn test_getpid_and_set_tid_address() {
        let (pid, _) = setup_proc();
        let prev = sched::current_tid();
        set_current(pid);
        assert_eq!(dispatch(SYS_GETPID, args(&[])), pid as isize);
        assert_eq!(dispatch(SYS_SET_TID_ADDRESS, args(&[0])), pid as isize);
        set_current(prev);
        teardown_proc(pid);
    }

    #[test]
    fn test_read_write_through_pipe_handles() {
        let (pid, va) = setup_proc();
        let p = get_process(pid).unwrap();
        let (r, w) = create_pipe();
        {
            let mut mu = p.mu.lock();
            crate::process::Process::install_handle(&mut mu, r).unwrap(); // fd 0
            crate::process::Process::install_handle(&mut mu, w).unwrap(); // fd 1
        }

        let prev = sched::current_tid();
        set_current(pid);

        // Write "ping" from a user buffer through fd 1.
        user::copy_to_user(va, b"ping").unwrap();
        assert_eq!(dispatch(SYS_WRITE, args(&[1, va, 4])), 4);

        // Read it back into another user buffer through fd 0.
        assert_eq!(dispatch(SYS_READ, args(&[0, va + 64, 16])), 4);
        let mut back = [0u8; 4];
        user::copy_from_user(&mut back, va + 64).unwrap();
        assert_eq!(&back, b"ping");

        // Bad fd.
        assert_eq!(dispatch(SYS_READ, args(&[7, va, 1])), -(Errno::Badf as i32) as isize);

        // close() then EBADF on reuse.
        assert_eq!(dispatch(SYS_CLOSE, args(&[0])), 0);
        assert_eq!(dispatch(SYS_CLOSE, args(&[0])), -(Errno::Badf as i32) as isize);

        set_current(prev);
        teardown_proc(pid);
    }

    #[test]
    fn test_open_without_vfs_is_enoent() {
        let (pid, va) = setup_proc();
        let prev = sched::current_tid();
        set_current(pid);
        user::copy_to_user(va, b"/bin/sh\0").unwrap();
        assert_eq!(dispatch(SYS_OPEN, args(&[va, 0, 0])), -(Errno::Noent as i32) as isize);
        set_current(prev);
        teardown_proc(pid);
    }

    #[test]
    fn test_bad_user_pointer_is_efault() {
        let (pid, _va) = setup_proc();
        let p = get_process(pid).unwrap();
        let (_r, w) = create_pipe();
        let fd = {
            let mut mu = p.mu.lock();
            crate::process::Process::install_handle(&mut mu, w).unwrap()
        };

        let prev = sched::current_tid();
        set_current(pid);
        let ret = dispatch(SYS_WRITE, args(&[fd as u64, 0x7000_0000, 8]));
        assert_eq!(ret, -(Errno::Fault as i32) as isize);
        set_current(prev);
        teardown_proc(pid);
    }

    #[test]
    fn test_chdir_normalizes() {
        let (pid, va) = setup_proc();
        let prev = sched::current_tid();
        set_current(pid);

        user::copy_to_user(va, b"/usr/share/../lib/./x\0").unwrap();
        assert_eq!(dispatch(SYS_CHDIR, args(&[va])), 0);
        let p = get_process(pid).unwrap();
        assert_eq!(p.mu.lock().cwd, "/usr/lib/x");

        // Relative path against the new cwd.
        user::copy_to_user(va + 128, b"..\0").unwrap();
        assert_eq!(dispatch(SYS_CHDIR, args(&[va + 128])), 0);
        assert_eq!(p.mu.lock().cwd, "/usr/lib");

        set_current(prev);
        teardown_proc(pid);
    }

    #[test]
    fn test_waitpid_via_dispatch_writes_status() {
        let (parent, va) = setup_proc();
        let child = spawn_process(parent, TaskState::Runnable);
        crate::process::exit::terminate(child, crate::process::exit::encode_exited(123));

        let prev = sched::current_tid();
        set_current(parent);
        let ret = dispatch(SYS_WAITPID, args(&[child as u64, va, 0]));
        assert_eq!(ret, child as isize);

        let mut st = [0u8; 4];
        user::copy_from_user(&mut st, va).unwrap();
        let wstatus = i32::from_le_bytes(st);
        assert_eq!((wstatus >> 8) & 0xFF, 123);
        set_current(prev);
        teardown_proc(parent);
    }

    #[test]
    fn test_mmap_requires_anonymous_private() {
        let (pid, _) = setup_proc();
        let prev = sched::current_tid();
        set_current(pid);

        // File-backed refused.
        let bad = dispatch(SYS_MMAP_PGOFF, args(&[0, 4096, 3, 0x02, 4, 0]));
        assert_eq!(bad, -(Errno::Inval as i32) as isize);

        // Anonymous private works.
        let va = dispatch(
            SYS_MMAP_PGOFF,
            args(&[0, 8192, 3, 0x22, (-1i64) as u64, 0]),
        );
        assert!(va > 0);

        set_current(prev);
        teardown_proc(pid);
    }

    #[test]
    fn test_normalize_path_rules() {
        assert_eq!(normalize_path("/", "a/b"), "/a/b");
        assert_eq!(normalize_path("/x", "/a//b/"), "/a/b");
        assert_eq!(normalize_path("/x/y", ".."), "/x");
        assert_eq!(normalize_path("/", "../.."), "/");
    }
}
