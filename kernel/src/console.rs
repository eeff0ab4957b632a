//! Console output
//!
//! Bytes go to the SBI console on hardware and to the test harness's
//! captured stdout on the host.

use crate::arch;
use core::fmt::{self, Write};

struct Stdout;

impl Write for Stdout {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        arch::console_write_str(s);
        Ok(())
    }
}

pub fn print(args: fmt::Arguments) {
    let _ = Stdout.write_fmt(args);
}

/// Print to console
#[macro_export]
macro_rules! print {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::console::print(format_args!($fmt $(, $($arg)+)?))
    }
}

/// Print to console with newline
#[macro_export]
macro_rules! println {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::console::print(format_args!(concat!($fmt, "\n") $(, $($arg)+)?))
    };
    () => {
        $crate::console::print(format_args!("\n"))
    }
}
