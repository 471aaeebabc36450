//! System time: boot timestamp plus the tick counter.

pub mod datetime;

use core::sync::atomic::{AtomicI64, Ordering};

use crate::arch::timer;
use crate::config::TIMER_HZ;

/// UNIX timestamp captured at boot (the RTC read belongs to the platform
/// layer, which hands the value in here).
static BOOT_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

pub fn init(boot_timestamp: i64) {
    assert!(boot_timestamp >= 0, "invalid boot-time UNIX timestamp");
    BOOT_TIMESTAMP.store(boot_timestamp, Ordering::Relaxed);
}

/// Seconds since the epoch.
pub fn get_timestamp() -> i64 {
    BOOT_TIMESTAMP.load(Ordering::Relaxed) + (timer::get_ticks() / TIMER_HZ as u64) as i64
}

/// Nanoseconds since boot, at tick granularity.
pub fn get_sys_time_ns() -> u64 {
    timer::get_ticks() * (1_000_000_000 / TIMER_HZ as u64)
}

/// Split seconds/nanoseconds since the epoch (the timespec shape).
pub fn real_time_timespec() -> (i64, u32) {
    let ticks = timer::get_ticks();
    let sec = BOOT_TIMESTAMP.load(Ordering::Relaxed) + (ticks / TIMER_HZ as u64) as i64;
    let nsec = (ticks % TIMER_HZ as u64) as u32 * (1_000_000_000 / TIMER_HZ);
    (sec, nsec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_advances_with_ticks() {
        init(1_700_000_000);
        let t0 = get_timestamp();
        assert!(t0 >= 1_700_000_000);

        crate::arch::timer::test_advance_ticks(TIMER_HZ as u64 * 3);
        let t1 = get_timestamp();
        assert!(t1 >= t0 + 3);

        let (sec, nsec) = real_time_timespec();
        assert!(sec >= t1 - 1);
        assert!(nsec < 1_000_000_000);
    }
}
