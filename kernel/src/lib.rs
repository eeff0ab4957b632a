//! Kestrel kernel core
//!
//! Virtual memory management and task scheduling for a single-core RISC-V
//! (Sv39) teaching kernel. Hardware access lives behind [`arch`]; everything
//! else runs unchanged on a development host against the software back-end.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod console;

pub mod arch;
pub mod config;
pub mod error;
pub mod initproc;
pub mod kernel;
pub mod logging;
pub mod mm;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod timer;
pub mod trap;

#[cfg(test)]
pub(crate) mod test_util;

pub use error::{KernelError, KernelResult};
pub use kernel::Kernel;
