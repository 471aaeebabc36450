//! Legacy 8259 PIC: the CPU-level gate for external interrupts on the PC.
//!
//! Per-line masking belongs to the IRQ domain layer; this module only
//! remaps, acknowledges and gates.

use pic8259::ChainedPics;
use spin::Mutex;

/// Vector base for the remapped PICs (32..47).
pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

// SAFETY: the offsets avoid the CPU exception range.
static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remap and unmask the cascade.
pub fn init() {
    // SAFETY: standard PIC initialization sequence on the PC platform.
    unsafe { PICS.lock().initialize() };
}

/// Signal end-of-interrupt for the given line (0..15).
pub fn eoi(line: u8) {
    // SAFETY: `line` is translated to the remapped vector below 48.
    unsafe { PICS.lock().notify_end_of_interrupt(PIC_1_OFFSET + line) };
}

/// Mask one line at the controller.
pub fn mask(line: u8) {
    let mut pics = PICS.lock();
    // SAFETY: reading and rewriting the PIC mask registers.
    unsafe {
        let mut masks = pics.read_masks();
        if line < 8 {
            masks[0] |= 1 << line;
        } else {
            masks[1] |= 1 << (line - 8);
        }
        pics.write_masks(masks[0], masks[1]);
    }
}

/// Unmask one line at the controller.
pub fn unmask(line: u8) {
    let mut pics = PICS.lock();
    // SAFETY: reading and rewriting the PIC mask registers.
    unsafe {
        let mut masks = pics.read_masks();
        if line < 8 {
            masks[0] &= !(1 << line);
        } else {
            masks[1] &= !(1 << (line - 8));
        }
        pics.write_masks(masks[0], masks[1]);
    }
}

/// Whether a line is masked.
pub fn is_masked(line: u8) -> bool {
    let mut pics = PICS.lock();
    // SAFETY: mask register read only.
    let masks = unsafe { pics.read_masks() };
    if line < 8 {
        masks[0] & (1 << line) != 0
    } else {
        masks[1] & (1 << (line - 8)) != 0
    }
}
