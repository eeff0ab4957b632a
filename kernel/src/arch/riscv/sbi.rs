//! SBI calls through `sbi-rt`

use sbi_rt as sbi;

/// Print a single character to console (legacy)
#[allow(deprecated)]
pub fn console_putchar(ch: u8) {
    let _ = sbi::legacy::console_putchar(ch as usize);
}

/// Program the next supervisor timer interrupt
pub fn set_timer(stime_value: u64) {
    let _ = sbi::set_timer(stime_value);
}

/// Shutdown the system
pub fn shutdown(failure: bool) -> ! {
    let _ = if failure {
        sbi::system_reset(sbi::Shutdown, sbi::SystemFailure)
    } else {
        sbi::system_reset(sbi::Shutdown, sbi::NoReason)
    };
    #[allow(deprecated)]
    sbi::legacy::shutdown()
}
