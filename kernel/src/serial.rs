// Generic serial interface for all targets. On the host test target the
// output goes to stdout so failing tests stay readable.

use core::fmt;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod backend {
    use core::fmt::{self, Write};

    pub fn write(args: fmt::Arguments) {
        use uart_16550::SerialPort;
        use x86_64::instructions::interrupts;

        interrupts::without_interrupts(|| {
            // SAFETY: 0x3F8 is the standard COM1 base; QEMU and real PCs
            // decode it. Reinitializing per call is wasteful but harmless.
            let mut port = unsafe { SerialPort::new(0x3F8) };
            let _ = port.write_fmt(args);
        });
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod backend {
    use core::fmt::{self, Write};

    /// 16550-compatible MMIO UART at the QEMU virt machine address.
    struct Uart16550Mmio {
        base: usize,
    }

    impl Write for Uart16550Mmio {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            const THR: usize = 0x00;
            const LSR: usize = 0x05;
            const LSR_THRE: u8 = 1 << 5;

            for byte in s.bytes() {
                // SAFETY: the QEMU virt machine maps a 16550 at 0x1000_0000;
                // these are ordinary device registers.
                unsafe {
                    while core::ptr::read_volatile((self.base + LSR) as *const u8) & LSR_THRE == 0 {
                        core::hint::spin_loop();
                    }
                    core::ptr::write_volatile((self.base + THR) as *mut u8, byte);
                }
            }
            Ok(())
        }
    }

    pub fn write(args: fmt::Arguments) {
        let mut uart = Uart16550Mmio { base: 0x1000_0000 };
        let _ = uart.write_fmt(args);
    }
}

#[cfg(not(target_os = "none"))]
mod backend {
    use core::fmt;

    pub fn write(args: fmt::Arguments) {
        extern crate std;
        use std::io::Write;
        let _ = std::io::stdout().write_fmt(args);
    }
}

#[doc(hidden)]
pub fn _serial_print(args: fmt::Arguments) {
    backend::write(args);
}
