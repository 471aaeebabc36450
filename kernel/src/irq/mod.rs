//! IRQ dispatch.
//!
//! Handlers chain per line; dispatch walks the chain until one claims the
//! interrupt or asks for bottom-half deferral, which enqueues a job on the
//! worker thread through a safe ring buffer. The CPU-level controller only
//! gates; per-line masking goes through the line's domain ops.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use crate::config::MAX_IRQ_LINES;
use crate::error::{KernelError, KernelResult};
use crate::sync::SafeRingbuf;

/// Architecture-independent IRQ line number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IrqNumber(pub u32);

impl core::fmt::Display for IrqNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "IRQ#{}", self.0)
    }
}

/// What a chained handler reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqHandlerResult {
    /// Not ours; keep walking the chain.
    NotHandled,
    /// Fully serviced.
    Handled,
    /// Acknowledged; the heavy part runs as a bottom half.
    RequiresBh,
}

pub type IrqHandlerFn = fn(IrqNumber) -> IrqHandlerResult;

/// Per-line masking and translation, implemented by the controller driver
/// (PIC on the PC, the interrupt controller node on RISC-V).
pub trait IrqDomainOps: Send + Sync {
    fn set_mask(&self, line: IrqNumber);
    fn clear_mask(&self, line: IrqNumber);
    fn is_masked(&self, line: IrqNumber) -> bool;
    /// Translate a line number to the CPU vector it raises.
    fn xlate(&self, line: IrqNumber) -> u32;
}

/// A deferred bottom-half job.
#[derive(Clone, Copy)]
struct BhJob {
    irq: IrqNumber,
    handler: IrqHandlerFn,
}

struct IrqLine {
    handlers: Vec<IrqHandlerFn>,
}

struct IrqState {
    lines: BTreeMap<u32, IrqLine>,
    domain: Option<&'static dyn IrqDomainOps>,
}

static IRQ_STATE: Mutex<IrqState> = Mutex::new(IrqState {
    lines: BTreeMap::new(),
    domain: None,
});

static DISPATCH_COUNT: AtomicU64 = AtomicU64::new(0);
static SPURIOUS_COUNT: AtomicU64 = AtomicU64::new(0);

lazy_static::lazy_static! {
    /// IRQ context → worker handoff. Writers are interrupt handlers,
    /// the single reader is the bottom-half thread.
    static ref BH_QUEUE: SafeRingbuf<BhJob> = SafeRingbuf::new(64);
}

/// Set by dispatch when a bottom half was queued; the tick path kicks the
/// worker (waking from IRQ context directly would need the scheduler lock).
static BH_PENDING: AtomicBool = AtomicBool::new(false);

/// Install the controller ops for per-line masking.
pub fn set_domain(ops: &'static dyn IrqDomainOps) {
    IRQ_STATE.lock().domain = Some(ops);
}

/// Append a handler to a line's chain.
pub fn register_handler(irq: IrqNumber, handler: IrqHandlerFn) -> KernelResult<()> {
    if irq.0 as usize >= MAX_IRQ_LINES {
        return Err(KernelError::InvalidArgument { name: "irq" });
    }
    let mut st = IRQ_STATE.lock();
    st.lines
        .entry(irq.0)
        .or_insert_with(|| IrqLine { handlers: Vec::new() })
        .handlers
        .push(handler);
    Ok(())
}

/// Remove a handler from a line's chain.
pub fn unregister_handler(irq: IrqNumber, handler: IrqHandlerFn) -> KernelResult<()> {
    let mut st = IRQ_STATE.lock();
    let line = st.lines.get_mut(&irq.0).ok_or(KernelError::InvalidArgument { name: "irq" })?;
    let before = line.handlers.len();
    line.handlers.retain(|&h| h as usize != handler as usize);
    if line.handlers.len() == before {
        return Err(KernelError::InvalidArgument { name: "handler" });
    }
    Ok(())
}

/// Mask a line at its domain.
pub fn mask(irq: IrqNumber) {
    if let Some(d) = IRQ_STATE.lock().domain {
        d.set_mask(irq);
    }
}

/// Unmask a line at its domain.
pub fn unmask(irq: IrqNumber) {
    if let Some(d) = IRQ_STATE.lock().domain {
        d.clear_mask(irq);
    }
}

pub fn is_masked(irq: IrqNumber) -> bool {
    IRQ_STATE.lock().domain.map(|d| d.is_masked(irq)).unwrap_or(false)
}

/// Walk the line's chain. Called from the arch interrupt entry with
/// interrupts disabled.
pub fn dispatch(irq: IrqNumber) {
    DISPATCH_COUNT.fetch_add(1, Ordering::Relaxed);

    // Snapshot the chain so the handler calls run without the table lock.
    let handlers: Vec<IrqHandlerFn> = {
        let st = IRQ_STATE.lock();
        match st.lines.get(&irq.0) {
            Some(line) => line.handlers.clone(),
            None => {
                SPURIOUS_COUNT.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    };

    for h in handlers {
        match h(irq) {
            IrqHandlerResult::NotHandled => continue,
            IrqHandlerResult::Handled => return,
            IrqHandlerResult::RequiresBh => {
                if BH_QUEUE.write_elem(BhJob { irq, handler: h }).is_none() {
                    // Queue full: drop and count; the device will re-raise.
                    SPURIOUS_COUNT.fetch_add(1, Ordering::Relaxed);
                }
                BH_PENDING.store(true, Ordering::Release);
                return;
            }
        }
    }

    SPURIOUS_COUNT.fetch_add(1, Ordering::Relaxed);
}

pub fn dispatch_count() -> u64 {
    DISPATCH_COUNT.load(Ordering::Relaxed)
}

pub fn spurious_count() -> u64 {
    SPURIOUS_COUNT.load(Ordering::Relaxed)
}

/// Whether a queued bottom half is waiting for the worker.
pub fn bh_pending() -> bool {
    BH_PENDING.load(Ordering::Acquire)
}

/// Drain the bottom-half queue. Runs in the worker thread (preemptable
/// kernel context, which is what the ringbuf reader side requires).
pub fn run_bottom_halves() -> usize {
    let mut ran = 0;
    BH_PENDING.store(false, Ordering::Release);
    while let Some(job) = BH_QUEUE.read_elem() {
        (job.handler)(job.irq);
        ran += 1;
    }
    ran
}

/// Bottom-half worker loop: drain, then sleep a tick when idle.
extern "C" fn bh_worker(_arg: usize) -> ! {
    loop {
        if run_bottom_halves() == 0 {
            crate::sched::kernel_sleep(1);
        }
    }
}

/// Spawn the bottom-half worker thread.
pub fn init() -> KernelResult<()> {
    let tid = crate::sched::kthread_create(bh_worker, 0)?;
    log::info!("irq: bottom-half worker tid {}", tid);
    Ok(())
}
