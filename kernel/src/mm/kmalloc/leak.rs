//! Optional kmalloc leak detector.
//!
//! While tracking is on, every live allocation is recorded with its caller
//! location; a report at teardown lists what was never freed.

use alloc::collections::BTreeMap;
use core::panic::Location;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

static TRACKING: AtomicBool = AtomicBool::new(cfg!(feature = "kmalloc-leak-detector"));

struct LiveAlloc {
    size: usize,
    caller: &'static Location<'static>,
}

static LIVE: Mutex<BTreeMap<u64, LiveAlloc>> = Mutex::new(BTreeMap::new());

/// Start recording allocations.
pub fn start() {
    LIVE.lock().clear();
    TRACKING.store(true, Ordering::Release);
}

/// Stop recording; returns the number of still-live allocations and logs
/// each one.
pub fn stop_and_report() -> usize {
    TRACKING.store(false, Ordering::Release);
    let live = LIVE.lock();
    for (va, a) in live.iter() {
        log::warn!("kmalloc leak: {:#x} ({} bytes) from {}", va, a.size, a.caller);
    }
    live.len()
}

pub(super) fn record_alloc(va: u64, size: usize, caller: &'static Location<'static>) {
    if TRACKING.load(Ordering::Acquire) {
        LIVE.lock().insert(va, LiveAlloc { size, caller });
    }
}

pub(super) fn record_free(va: u64) {
    if TRACKING.load(Ordering::Acquire) {
        LIVE.lock().remove(&va);
    }
}
