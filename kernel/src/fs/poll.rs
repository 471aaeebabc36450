//! `poll` over the multi-object waiter.
//!
//! The caller sleeps until *any* of the polled files' conditions fires (or
//! the timeout does). Each pollable file exposes a condition via
//! [`FileOps::poll_cond`]; the sleeping task's wobj carries the whole
//! channel set, so a signal on any of them wakes it.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{FileOps, PollMask};
use crate::sched;
use crate::sync::wobj::WaitObj;

/// One polled file.
pub struct PollEntry {
    pub ops: Arc<dyn FileOps>,
    /// What the caller is interested in.
    pub events: PollMask,
    /// What is ready (output).
    pub revents: PollMask,
}

impl PollEntry {
    pub fn new(ops: Arc<dyn FileOps>, events: PollMask) -> Self {
        Self {
            ops,
            events,
            revents: PollMask::empty(),
        }
    }
}

fn collect_ready(entries: &mut [PollEntry]) -> usize {
    let mut ready = 0;
    for e in entries.iter_mut() {
        // ERR and HUP are always reported, whether asked for or not.
        e.revents = e.ops.poll_mask() & (e.events | PollMask::ERR | PollMask::HUP);
        if !e.revents.is_empty() {
            ready += 1;
        }
    }
    ready
}

/// Wait until at least one entry is ready. `timeout_ticks`:
/// `None` = forever, `Some(0)` = just poll, `Some(n)` = at most `n` ticks.
/// Returns the number of ready entries (0 on timeout).
pub fn poll(entries: &mut [PollEntry], timeout_ticks: Option<u64>) -> usize {
    loop {
        let ready = collect_ready(entries);
        if ready > 0 || timeout_ticks == Some(0) {
            return ready;
        }

        let me = sched::current_tid();
        sched::disable_preemption();

        // Register on every pollable condition, then sleep on the whole
        // channel set. Files without a condition are always-ready and were
        // caught above.
        let mut channels = Vec::new();
        for e in entries.iter() {
            if let Some(cond) = e.ops.poll_cond() {
                cond.add_poll_waiter(me);
                channels.push(cond.channel());
            }
        }

        // Re-check before committing to sleep: a state change between the
        // first scan and registration would otherwise be lost.
        if collect_ready(entries) > 0 {
            sched::enable_preemption();
            return collect_ready(entries);
        }

        sched::task_set_wait_obj(WaitObj::MultiObj(channels), None);
        if let Some(t) = timeout_ticks {
            sched::set_wakeup_timer(me, t);
        }
        sched::enable_preemption();
        sched::enter_sleep_wait_state();

        let timed_out = !sched::wobj_reset_current().is_none();
        if timed_out {
            return collect_ready(entries);
        }
        // Signalled: loop and re-scan.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::pipe::create_pipe;
    use crate::sched::test_support::sched_test_init;

    #[test]
    fn test_ready_pipe_reports_in() {
        sched_test_init();
        let (r, w) = create_pipe();
        w.ops.write(b"data", false).unwrap();

        let mut entries = [PollEntry::new(r.ops.clone(), PollMask::IN)];
        let n = poll(&mut entries, Some(0));
        assert_eq!(n, 1);
        assert!(entries[0].revents.contains(PollMask::IN));
    }

    #[test]
    fn test_zero_timeout_on_idle_pipe() {
        sched_test_init();
        let (r, _w) = create_pipe();
        let mut entries = [PollEntry::new(r.ops.clone(), PollMask::IN)];
        assert_eq!(poll(&mut entries, Some(0)), 0);
        assert!(entries[0].revents.is_empty());
    }

    #[test]
    fn test_hup_reported_even_if_not_requested() {
        sched_test_init();
        // S7's readiness logic: writer closes, poll returns HUP.
        let (r, w) = create_pipe();
        drop(w);

        let mut entries = [PollEntry::new(r.ops.clone(), PollMask::IN)];
        let n = poll(&mut entries, Some(0));
        assert_eq!(n, 1);
        assert!(entries[0].revents.contains(PollMask::HUP));
    }
}
