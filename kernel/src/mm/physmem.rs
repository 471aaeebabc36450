//! Access to the *contents* of physical frames.
//!
//! On bare metal every frame below `LINEAR_MAPPING_SIZE` is reachable
//! through the kernel linear mapping, so this is pointer arithmetic. On the
//! host test target there is no physical memory; frames are backed by a
//! lazily grown page arena so the paging and COW logic can be exercised by
//! ordinary tests.

use super::FrameNumber;
use crate::config::PAGE_SIZE;

#[cfg(target_os = "none")]
mod backing {
    use super::*;
    use crate::config::{KERNEL_BASE_VA, LINEAR_MAPPING_SIZE, PAGE_SHIFT};

    pub fn with_frame<R>(frame: FrameNumber, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
        let paddr = (frame.0 as u64) << PAGE_SHIFT;
        assert!(paddr < LINEAR_MAPPING_SIZE);
        let ptr = (KERNEL_BASE_VA + paddr) as *mut [u8; PAGE_SIZE];
        // SAFETY: the linear mapping covers this frame and the frame is
        // owned by the caller (allocated, not concurrently aliased: single
        // CPU, callers run with preemption disabled while mutating).
        f(unsafe { &mut *ptr })
    }
}

#[cfg(not(target_os = "none"))]
mod backing {
    use super::*;
    use alloc::boxed::Box;
    use alloc::collections::BTreeMap;
    use spin::Mutex;

    static ARENA: Mutex<BTreeMap<u32, Box<[u8; PAGE_SIZE]>>> = Mutex::new(BTreeMap::new());

    pub fn with_frame<R>(frame: FrameNumber, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
        let mut arena = ARENA.lock();
        let page = arena
            .entry(frame.0)
            .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
        f(page)
    }
}

/// Run `f` with mutable access to the frame's bytes.
pub fn with_frame<R>(frame: FrameNumber, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
    backing::with_frame(frame, f)
}

/// Zero a frame.
pub fn zero_frame(frame: FrameNumber) {
    with_frame(frame, |p| p.fill(0));
}

/// Copy a whole frame.
pub fn copy_frame(dst: FrameNumber, src: FrameNumber) {
    let mut tmp = [0u8; PAGE_SIZE];
    with_frame(src, |p| tmp.copy_from_slice(p));
    with_frame(dst, |p| p.copy_from_slice(&tmp));
}

/// Read part of a frame into `dst`.
pub fn read_bytes(frame: FrameNumber, offset: usize, dst: &mut [u8]) {
    assert!(offset + dst.len() <= PAGE_SIZE);
    with_frame(frame, |p| dst.copy_from_slice(&p[offset..offset + dst.len()]));
}

/// Write `src` into part of a frame.
pub fn write_bytes(frame: FrameNumber, offset: usize, src: &[u8]) {
    assert!(offset + src.len() <= PAGE_SIZE);
    with_frame(frame, |p| p[offset..offset + src.len()].copy_from_slice(src));
}
