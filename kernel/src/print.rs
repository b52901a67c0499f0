//! `print!`/`println!` for kernel diagnostics.
//!
//! There is no VGA/framebuffer console in scope (spec section 1); both
//! macros are aliases for the serial output in [`crate::serial`].

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::serial::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
