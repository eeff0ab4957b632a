//! Sv39 hardware back-end

mod boot;
mod memory;
mod sbi;
mod trap;

pub use memory::PhysMemory;
pub use trap::{trap_handler_address, trap_return_address};

use crate::task::TaskContext;
use core::arch::{asm, global_asm};
use riscv::register::sstatus;

global_asm!(include_str!("switch.S"));
global_asm!(include_str!("trap.S"));

extern "C" {
    /// Save callee-saved registers into `current_task_cx_ptr`, load
    /// `next_task_cx_ptr` and return into the next task
    fn __switch(current_task_cx_ptr: *mut TaskContext, next_task_cx_ptr: *const TaskContext);
}

type Switch = (*mut TaskContext, *const TaskContext);

/// Context switches requested while the kernel is borrowed. The boot glue
/// performs them with [`__switch`] once the borrow has been released.
pub struct Hart {
    pending: Option<Switch>,
}

impl Hart {
    pub fn new() -> Self {
        Self { pending: None }
    }

    /// Record a switch. Switches recorded back to back collapse into one
    /// from the first outgoing context to the last incoming one.
    ///
    /// # Safety
    /// Both pointers must stay valid until the switch is carried out.
    pub unsafe fn switch(&mut self, current: *mut TaskContext, next: *const TaskContext) {
        let from = match self.pending.take() {
            Some((from, _)) => from,
            None => current,
        };
        self.pending = Some((from, next));
    }

    pub fn take_pending(&mut self) -> Option<Switch> {
        self.pending.take()
    }
}

impl Default for Hart {
    fn default() -> Self {
        Self::new()
    }
}

pub fn console_write_str(s: &str) {
    for ch in s.bytes() {
        sbi::console_putchar(ch);
    }
}

pub fn interrupts_enabled() -> bool {
    sstatus::read().sie()
}

pub fn enable_interrupts() {
    // SAFETY: only flips sstatus.SIE.
    unsafe { sstatus::set_sie() }
}

pub fn disable_interrupts() {
    // SAFETY: only flips sstatus.SIE.
    unsafe { sstatus::clear_sie() }
}

/// Write SATP and flush the TLB
pub fn activate_root(token: usize) {
    // SAFETY: callers pass the token of a complete table that maps the
    // running kernel.
    unsafe {
        asm!("csrw satp, {}", in(reg) token);
        asm!("sfence.vma");
    }
}

pub fn wait_for_interrupt() {
    // SAFETY: wfi has no side effects besides stalling.
    unsafe { asm!("wfi") }
}
