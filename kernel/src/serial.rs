//! COM1 serial output.
//!
//! The core has no VGA/framebuffer path (out of scope, see spec section 1):
//! all kernel diagnostic text, the [`crate::log_sink`] backend, and the test
//! harness go through this single serial port.

use core::fmt;

use spin::Mutex;
use uart_16550::SerialPort;

static COM1: Mutex<Option<SerialPort>> = Mutex::new(None);

/// Initialize COM1. Must run once, early, before any `print!`/`log::*!` call.
pub fn init() {
    // SAFETY: 0x3F8 is the standard COM1 I/O base. Called once from the boot
    // path before interrupts are enabled, so no concurrent access is possible.
    let mut port = unsafe { SerialPort::new(0x3F8) };
    port.init();
    *COM1.lock() = Some(port);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        let mut guard = COM1.lock();
        match guard.as_mut() {
            Some(port) => {
                let _ = port.write_fmt(args);
            }
            None => {
                // Not yet initialized (very early boot / panic before init):
                // open a throwaway port rather than dropping the output.
                // SAFETY: same I/O base as `init`; exclusive because interrupts
                // are off and nothing else touches COM1 this early.
                let mut port = unsafe { SerialPort::new(0x3F8) };
                port.init();
                let _ = port.write_fmt(args);
            }
        }
    });
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => ($crate::serial::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
