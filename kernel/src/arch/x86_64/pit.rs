//! Programmable interval timer: the tick source on the PC.

use x86_64::instructions::port::Port;

use crate::config::TIMER_HZ;

const PIT_BASE_FREQ: u32 = 1_193_182;

/// Program channel 0 for periodic interrupts at [`TIMER_HZ`].
pub fn init() {
    let divisor = (PIT_BASE_FREQ / TIMER_HZ) as u16;
    let mut cmd: Port<u8> = Port::new(0x43);
    let mut data: Port<u8> = Port::new(0x40);

    // SAFETY: standard PIT mode-3 programming sequence.
    unsafe {
        cmd.write(0x36u8);
        data.write((divisor & 0xFF) as u8);
        data.write((divisor >> 8) as u8);
    }
}
