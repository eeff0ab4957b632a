//! Architecture back-ends
//!
//! `riscv` drives real Sv39 hardware through SBI. `software` stands in for
//! the hart on every other target so the core can be exercised on a host:
//! physical memory is an arena of frames and the register file is a
//! [`TaskContext`](crate::task::TaskContext) snapshot.

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod riscv;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub use self::riscv::{
    activate_root, console_write_str, disable_interrupts, enable_interrupts, interrupts_enabled,
    trap_handler_address, trap_return_address, wait_for_interrupt, Hart, PhysMemory,
};

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub mod software;
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub use self::software::{
    activate_root, console_write_str, disable_interrupts, enable_interrupts, interrupts_enabled,
    trap_handler_address, trap_return_address, wait_for_interrupt, Hart, PhysMemory,
};
