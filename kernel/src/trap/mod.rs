//! Trap handling
//!
//! The architecture back-end decodes `scause`/`stval` into a [`Trap`] and
//! hands it to [`Kernel::handle_trap`]. Pending signals are acted on on the
//! way back to user mode.

mod context;

pub use context::TrapContext;

use crate::kernel::Kernel;
use crate::sync::InterruptGuard;
use crate::syscall;
use crate::task::{Pid, Signal, TaskStatus};

/// The kind of access that faulted
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessType {
    Load,
    Store,
    Execute,
}

/// A trap taken while user code was running
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trap {
    /// `ecall` from user mode
    Syscall,
    /// Access to an unmapped page or one without the needed permission
    PageFault { addr: usize, access: AccessType },
    IllegalInstruction { addr: usize },
    /// `ebreak` at `addr`
    Breakpoint { addr: usize },
    /// Access to `addr` not aligned to its width
    Misaligned { addr: usize, access: AccessType },
    /// Supervisor timer interrupt; `now` is the tick count
    Timer { now: u64 },
    /// Supervisor external interrupt
    External,
}

impl Kernel {
    /// Handle `trap` on behalf of the task on the hart. Returns the task to
    /// resume in user mode, or `None` when the hart goes idle.
    pub fn handle_trap(&mut self, trap: Trap) -> Option<Pid> {
        let _intr = InterruptGuard::new();
        match (trap, self.current_pid()) {
            (Trap::Timer { now }, _) => {
                self.tick(now);
            }
            (Trap::External, _) => log::trace!("external interrupt"),
            (Trap::Syscall, Some(pid)) => self.dispatch_syscall(pid),
            (Trap::PageFault { addr, access }, Some(pid)) => {
                log::warn!("task {}: {:?} fault at {:#x}", pid, access, addr);
                self.raise(pid, Signal::SIGSEGV);
            }
            (Trap::IllegalInstruction { addr }, Some(pid)) => {
                log::warn!("task {}: illegal instruction at {:#x}", pid, addr);
                self.raise(pid, Signal::SIGILL);
            }
            (Trap::Breakpoint { addr }, Some(pid)) => {
                log::warn!("task {}: breakpoint at {:#x}", pid, addr);
                self.raise(pid, Signal::SIGTRAP);
            }
            (Trap::Misaligned { addr, access }, Some(pid)) => {
                log::warn!("task {}: misaligned {:?} at {:#x}", pid, access, addr);
                self.raise(pid, Signal::SIGBUS);
            }
            (trap, None) => log::error!("{:?} with no task on the hart", trap),
        }
        self.return_to_user()
    }

    fn dispatch_syscall(&mut self, pid: Pid) {
        let (id, args) = match self.trap_context_mut(pid) {
            Ok(cx) => {
                cx.sepc += 4;
                cx.syscall_args()
            }
            Err(err) => {
                log::error!("syscall from task {}: {}", pid, err);
                return;
            }
        };
        let ret = syscall::syscall(self, id, args);
        // A blocked caller gets its result when it is woken.
        if matches!(
            self.task_status(pid),
            Some(TaskStatus::Running | TaskStatus::Ready)
        ) {
            if let Ok(cx) = self.trap_context_mut(pid) {
                cx.x[10] = ret as usize;
            }
        }
    }

    fn raise(&mut self, pid: Pid, signal: Signal) {
        if let Err(err) = self.post_signal(pid, signal) {
            log::error!("raising {} on task {}: {}", signal, pid, err);
        }
    }

    /// Apply default signal actions to the task about to enter user mode,
    /// until one survives or the hart idles.
    pub fn return_to_user(&mut self) -> Option<Pid> {
        let _intr = InterruptGuard::new();
        loop {
            let pid = self.schedule()?;
            match self.handle_signals(pid) {
                Ok(None) => return Some(pid),
                Ok(Some(exit_code)) => {
                    if let Err(err) = self.exit_current(exit_code) {
                        log::error!("terminating task {}: {}", pid, err);
                        return Some(pid);
                    }
                }
                Err(err) => {
                    log::error!("signals of task {}: {}", pid, err);
                    return Some(pid);
                }
            }
        }
    }
}
