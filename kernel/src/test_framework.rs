//! No-std test plumbing for the QEMU-only integration tests: serial
//! reporting, the custom test runner, and the debug-exit device.

use core::panic::PanicInfo;

use crate::{serial_print, serial_println};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Anything the runner can execute and report.
pub trait Testable {
    fn run(&self);
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        serial_print!("{}...\t", core::any::type_name::<T>());
        self();
        serial_println!("[ok]");
    }
}

/// Custom test runner for bare-metal test binaries.
pub fn test_runner(tests: &[&dyn Testable]) -> ! {
    serial_println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    serial_println!("\nAll tests passed");
    exit_qemu(QemuExitCode::Success)
}

/// Panic handler for test binaries.
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failed)
}

/// Leave QEMU with a status the harness can check.
pub fn exit_qemu(_exit_code: QemuExitCode) -> ! {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: port 0xf4 is the isa-debug-exit device; QEMU terminates on
    // the write, so nothing runs after it.
    unsafe {
        use x86_64::instructions::port::Port;
        let mut port = Port::new(0xf4);
        port.write(_exit_code as u32);
        core::hint::unreachable_unchecked();
    }

    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    crate::arch::riscv64::sbi::shutdown();

    #[cfg(not(target_os = "none"))]
    {
        extern crate std;
        std::process::exit(if _exit_code == QemuExitCode::Success { 0 } else { 1 });
    }

    #[allow(unreachable_code)]
    loop {
        core::hint::spin_loop();
    }
}

#[macro_export]
macro_rules! kernel_assert {
    ($cond:expr) => {
        if !$cond {
            $crate::serial_println!("Assertion failed: {}", stringify!($cond));
            panic!("assertion failed");
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::serial_println!($($arg)*);
            panic!("assertion failed");
        }
    };
}

#[macro_export]
macro_rules! kernel_assert_eq {
    ($left:expr, $right:expr) => {
        if $left != $right {
            $crate::serial_println!(
                "Assertion failed: {} != {}\n  left: {:?}\n right: {:?}",
                stringify!($left),
                stringify!($right),
                $left,
                $right
            );
            panic!("assertion failed: not equal");
        }
    };
}
