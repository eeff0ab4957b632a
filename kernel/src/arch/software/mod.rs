//! Host back-end

mod memory;

pub use memory::PhysMemory;

use crate::task::TaskContext;

/// Stand-in for the address of `trap_return`
pub const TRAP_RETURN_ENTRY: usize = 0x8020_1000;
/// Stand-in for the address of `trap_handler`
pub const TRAP_HANDLER_ENTRY: usize = 0x8020_2000;

pub fn trap_return_address() -> usize {
    TRAP_RETURN_ENTRY
}

pub fn trap_handler_address() -> usize {
    TRAP_HANDLER_ENTRY
}

#[cfg(test)]
pub fn console_write_str(s: &str) {
    std::print!("{}", s);
}

#[cfg(not(test))]
static CONSOLE: spin::Once<fn(&str)> = spin::Once::new();

/// Route console output to `sink`; only the first call takes effect
#[cfg(not(test))]
pub fn install_console(sink: fn(&str)) {
    CONSOLE.call_once(|| sink);
}

#[cfg(not(test))]
pub fn console_write_str(s: &str) {
    if let Some(sink) = CONSOLE.get() {
        sink(s);
    }
}

#[cfg(test)]
std::thread_local! {
    // Every test thread is its own hart.
    static SIE: core::cell::Cell<bool> = const { core::cell::Cell::new(false) };
}

#[cfg(test)]
pub fn interrupts_enabled() -> bool {
    SIE.with(|sie| sie.get())
}

#[cfg(test)]
fn set_sie(enabled: bool) {
    SIE.with(|sie| sie.set(enabled));
}

#[cfg(not(test))]
static SIE: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

#[cfg(not(test))]
pub fn interrupts_enabled() -> bool {
    SIE.load(core::sync::atomic::Ordering::Relaxed)
}

#[cfg(not(test))]
fn set_sie(enabled: bool) {
    SIE.store(enabled, core::sync::atomic::Ordering::Relaxed);
}

pub fn enable_interrupts() {
    set_sie(true);
}

pub fn disable_interrupts() {
    set_sie(false);
}

/// There is no MMU to program; the processor keeps the token.
pub fn activate_root(_token: usize) {}

pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

/// The hart's callee-saved registers
pub struct Hart {
    regs: TaskContext,
}

impl Hart {
    pub fn new() -> Self {
        Self {
            regs: TaskContext::zero_init(),
        }
    }

    /// Registers as the running code would see them
    pub fn registers(&self) -> &TaskContext {
        &self.regs
    }

    /// Save the live registers into `current`, then load `next`.
    ///
    /// # Safety
    /// Both pointers must be valid and `current` writable.
    pub unsafe fn switch(&mut self, current: *mut TaskContext, next: *const TaskContext) {
        *current = self.regs;
        self.regs = *next;
    }
}

impl Default for Hart {
    fn default() -> Self {
        Self::new()
    }
}
