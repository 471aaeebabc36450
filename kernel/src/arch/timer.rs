//! Generic tick counter fed by the per-arch timer interrupt.

use core::sync::atomic::{AtomicU64, Ordering};

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Ticks elapsed since boot.
#[inline]
pub fn get_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Record one timer tick. Called from the timer IRQ handler only.
#[inline]
pub fn record_tick() -> u64 {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

#[cfg(test)]
pub fn test_advance_ticks(n: u64) {
    TICKS.fetch_add(n, Ordering::Relaxed);
}
