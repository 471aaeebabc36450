//! Anonymous pipes.
//!
//! A bounded byte queue with separate read/write ends. Reads on an empty
//! pipe block while writers exist and return 0 (EOF) once they are gone;
//! writes with no reader left fail with the broken-pipe error (the syscall
//! layer turns that into SIGPIPE). Poll reports `HUP` on the read end when
//! the last writer closes.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use spin::Mutex as SpinMutex;

use super::{FileOps, Handle, PollMask};
use crate::error::{KernelError, KernelResult};
use crate::sync::kcond::{KCond, KCOND_WAIT_FOREVER};

/// Pipe capacity, bytes.
pub const PIPE_BUF_SIZE: usize = 4096;

struct PipeInner {
    buf: VecDeque<u8>,
    readers: u32,
    writers: u32,
}

struct PipeShared {
    inner: SpinMutex<PipeInner>,
    /// Signalled whenever readability may have changed (data written or
    /// last writer gone).
    read_cond: KCond,
    /// Signalled whenever writability may have changed.
    write_cond: KCond,
}

impl PipeShared {
    fn poll_mask_read(&self) -> PollMask {
        let inner = self.inner.lock();
        let mut mask = PollMask::empty();
        if !inner.buf.is_empty() {
            mask |= PollMask::IN;
        }
        if inner.writers == 0 {
            mask |= PollMask::HUP;
        }
        mask
    }

    fn poll_mask_write(&self) -> PollMask {
        let inner = self.inner.lock();
        let mut mask = PollMask::empty();
        if inner.readers == 0 {
            mask |= PollMask::ERR;
        } else if inner.buf.len() < PIPE_BUF_SIZE {
            mask |= PollMask::OUT;
        }
        mask
    }
}

pub struct PipeReadEnd {
    shared: Arc<PipeShared>,
}

pub struct PipeWriteEnd {
    shared: Arc<PipeShared>,
}

impl FileOps for PipeReadEnd {
    fn read(&self, buf: &mut [u8], nonblock: bool) -> KernelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            {
                let mut inner = self.shared.inner.lock();

                if !inner.buf.is_empty() {
                    let n = buf.len().min(inner.buf.len());
                    for b in buf.iter_mut().take(n) {
                        *b = inner.buf.pop_front().expect("len checked");
                    }
                    drop(inner);
                    self.shared.write_cond.signal_all();
                    return Ok(n);
                }

                if inner.writers == 0 {
                    return Ok(0); // EOF
                }
            }

            if nonblock {
                return Err(KernelError::WouldBlock);
            }

            self.shared.read_cond.wait(None, KCOND_WAIT_FOREVER);
        }
    }

    fn poll_mask(&self) -> PollMask {
        self.shared.poll_mask_read()
    }

    fn poll_cond(&self) -> Option<&KCond> {
        Some(&self.shared.read_cond)
    }
}

impl FileOps for PipeWriteEnd {
    fn write(&self, buf: &[u8], nonblock: bool) -> KernelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        loop {
            {
                let mut inner = self.shared.inner.lock();

                if inner.readers == 0 {
                    return Err(KernelError::BrokenPipe);
                }

                let space = PIPE_BUF_SIZE - inner.buf.len();
                if space > 0 {
                    let n = space.min(buf.len() - written);
                    inner.buf.extend(buf[written..written + n].iter().copied());
                    written += n;
                    drop(inner);
                    self.shared.read_cond.signal_all();
                    if written == buf.len() {
                        return Ok(written);
                    }
                    continue;
                }
            }

            if nonblock {
                return if written > 0 {
                    Ok(written)
                } else {
                    Err(KernelError::WouldBlock)
                };
            }

            self.shared.write_cond.wait(None, KCOND_WAIT_FOREVER);
        }
    }

    fn poll_mask(&self) -> PollMask {
        self.shared.poll_mask_write()
    }

    fn poll_cond(&self) -> Option<&KCond> {
        Some(&self.shared.write_cond)
    }
}

impl Drop for PipeReadEnd {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        inner.readers -= 1;
        let gone = inner.readers == 0;
        drop(inner);
        if gone {
            // Writers must learn about EPIPE.
            self.shared.write_cond.signal_all();
        }
    }
}

impl Drop for PipeWriteEnd {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        inner.writers -= 1;
        let gone = inner.writers == 0;
        drop(inner);
        if gone {
            // Readers see EOF / POLLHUP now.
            self.shared.read_cond.signal_all();
        }
    }
}

/// Create a pipe; returns `(read_end, write_end)` handles.
pub fn create_pipe() -> (Handle, Handle) {
    let shared = Arc::new(PipeShared {
        inner: SpinMutex::new(PipeInner {
            buf: VecDeque::with_capacity(PIPE_BUF_SIZE),
            readers: 1,
            writers: 1,
        }),
        read_cond: KCond::new(),
        write_cond: KCond::new(),
    });

    let r = Handle::new(Arc::new(PipeReadEnd {
        shared: Arc::clone(&shared),
    }));
    let w = Handle::new(Arc::new(PipeWriteEnd { shared }));
    (r, w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::test_support::sched_test_init;

    #[test]
    fn test_write_then_read() {
        sched_test_init();
        let (r, w) = create_pipe();
        assert_eq!(w.ops.write(b"hello", false).unwrap(), 5);

        let mut buf = [0u8; 16];
        assert_eq!(r.ops.read(&mut buf, false).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn test_nonblock_read_on_empty() {
        sched_test_init();
        let (r, _w) = create_pipe();
        let mut buf = [0u8; 4];
        assert_eq!(r.ops.read(&mut buf, true), Err(KernelError::WouldBlock));
    }

    #[test]
    fn test_eof_after_last_writer_closes() {
        sched_test_init();
        let (r, w) = create_pipe();
        w.ops.write(b"x", false).unwrap();
        drop(w);

        let mut buf = [0u8; 4];
        // Buffered data still readable, then clean EOF.
        assert_eq!(r.ops.read(&mut buf, false).unwrap(), 1);
        assert_eq!(r.ops.read(&mut buf, false).unwrap(), 0);
    }

    #[test]
    fn test_epipe_after_last_reader_closes() {
        sched_test_init();
        let (r, w) = create_pipe();
        drop(r);
        assert_eq!(w.ops.write(b"x", false), Err(KernelError::BrokenPipe));
    }

    #[test]
    fn test_pollhup_on_writer_close() {
        sched_test_init();
        // S7's status logic: the read end reports HUP once writers are
        // gone, and a subsequent read returns 0.
        let (r, w) = create_pipe();
        assert!(!r.ops.poll_mask().contains(PollMask::HUP));
        drop(w);
        assert!(r.ops.poll_mask().contains(PollMask::HUP));
        let mut buf = [0u8; 4];
        assert_eq!(r.ops.read(&mut buf, false).unwrap(), 0);
    }

    #[test]
    fn test_capacity_nonblock_write() {
        sched_test_init();
        let (r, w) = create_pipe();
        let big = alloc::vec![0u8; PIPE_BUF_SIZE + 100];
        // Nonblocking write fills the buffer and reports the short count.
        assert_eq!(w.ops.write(&big, true).unwrap(), PIPE_BUF_SIZE);
        assert_eq!(w.ops.write(b"y", true), Err(KernelError::WouldBlock));
        assert!(w.ops.poll_mask().is_empty());
        assert!(r.ops.poll_mask().contains(PollMask::IN));
    }
}
