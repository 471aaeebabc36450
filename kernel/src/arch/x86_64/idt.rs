//! Interrupt descriptor table and trap entry stubs.
//!
//! The timer interrupt drives the scheduler tick and takes the preemption
//! edge right here (EOI first, then switch). Page faults route through the
//! portable fault module. `int 0x80` is the syscall gate; its naked stub
//! saves the full register file on the kernel stack and hands a portable
//! view to the dispatcher.

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use super::pic;
use crate::arch::UserRegs;
use crate::fault::{self, PageFaultOutcome};
use crate::sched;

/// Remapped vector of the PIT line.
const TIMER_VECTOR: u8 = pic::PIC_1_OFFSET;
const SYSCALL_VECTOR: u8 = 0x80;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_handler);
        idt.double_fault.set_handler_fn(double_fault_handler);
        idt[TIMER_VECTOR].set_handler_fn(timer_handler);

        // SAFETY: the syscall stub is a naked function with a correct
        // interrupt-gate prologue/epilogue.
        unsafe {
            idt[SYSCALL_VECTOR]
                .set_handler_addr(x86_64::VirtAddr::new(syscall_entry as usize as u64))
                .set_privilege_level(x86_64::PrivilegeLevel::Ring3);
        }
        idt
    };
}

pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    log::warn!("breakpoint at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, _code: u64) -> ! {
    panic!("double fault at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn general_protection_handler(frame: InterruptStackFrame, code: u64) {
    let user = frame.code_segment.rpl() == x86_64::PrivilegeLevel::Ring3;
    if user {
        let _ = crate::process::signal::send_signal(
            sched::current_tid(),
            crate::process::signal::SIGSEGV,
        );
        return;
    }
    panic!("general protection fault, code {:#x}", code);
}

extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    code: PageFaultErrorCode,
) {
    let addr = x86_64::registers::control::Cr2::read_raw();
    let write = code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
    let user = code.contains(PageFaultErrorCode::USER_MODE);

    match fault::handle_page_fault(addr, write, user) {
        PageFaultOutcome::Resolved => {
            // Refresh the hardware shadow with the (new) translation and
            // retry the faulting access.
            if addr >= crate::config::KERNEL_BASE_VA {
                super::mmu::install_kernel(addr);
            } else {
                super::mmu::install_current(addr);
            }
        }
        PageFaultOutcome::SignalRaised => {}
        PageFaultOutcome::Resumable => {
            // The resumable-call protocol reports the fault through the
            // call's return path; reaching this arm means a probe touched
            // the page the hard way, which the portable copies never do.
            panic!("unexpected hardware fault inside a resumable frame");
        }
        PageFaultOutcome::Fatal => {
            panic!(
                "kernel page fault at {:#x} (ip {:#x}, code {:?})",
                addr,
                frame.instruction_pointer.as_u64(),
                code
            );
        }
    }
}

extern "x86-interrupt" fn timer_handler(_frame: InterruptStackFrame) {
    crate::arch::timer::record_tick();
    sched::sched_tick();
    pic::eoi(0);

    // Take the preemption edge before returning: EOI is already out, so
    // the next tick fires even if we switch away here.
    if sched::need_resched() && sched::is_preemption_enabled() {
        sched::schedule();
    }
}

/// Register file pushed by the syscall stub, low address first.
#[repr(C)]
struct SyscallFrame {
    // pushed by the stub (reverse push order)
    r11: u64,
    r10: u64,
    r9: u64,
    r8: u64,
    rbp: u64,
    rdi: u64,
    rsi: u64,
    rdx: u64,
    rcx: u64,
    rbx: u64,
    rax: u64,
    // pushed by the CPU
    rip: u64,
    cs: u64,
    rflags: u64,
    rsp: u64,
    ss: u64,
}

#[unsafe(naked)]
extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "mov rdi, rsp",
        "call {rust_entry}",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        rust_entry = sym syscall_rust_entry,
    );
}

/// Rust half of the syscall gate: mirrors the frame into the task's
/// portable register view (fork and signals read it), dispatches, and
/// writes the result back into the saved rax.
extern "C" fn syscall_rust_entry(frame: *mut SyscallFrame) {
    // SAFETY: the stub passes a pointer to the frame it just pushed on
    // this very stack; it stays alive until the stub pops it.
    let frame = unsafe { &mut *frame };

    let nr = frame.rax as usize;
    let args = [frame.rdi, frame.rsi, frame.rdx, frame.r10, frame.r8, frame.r9];

    let tid = sched::current_tid();
    sched::with_task(tid, |t| {
        t.user_regs = Some(UserRegs {
            pc: frame.rip,
            sp: frame.rsp,
            ret: frame.rax,
            args: [frame.rdi, frame.rsi, frame.rdx],
            flags: frame.rflags,
        });
    });

    let ret = crate::syscall::dispatch(nr, args) as u64;
    frame.rax = ret;

    // The dispatcher may have rewritten the frame (execve, sigreturn,
    // signal delivery on this edge): the saved view wins.
    if let Some(regs) = sched::with_task(tid, |t| t.user_regs).flatten() {
        if regs.pc != frame.rip || regs.sp != frame.rsp {
            frame.rip = regs.pc;
            frame.rsp = regs.sp;
            frame.rax = regs.ret;
            frame.rdi = regs.args[0];
        } else {
            sched::with_task(tid, |t| {
                if let Some(r) = t.user_regs.as_mut() {
                    r.ret = ret;
                }
            });
        }
    }
}
