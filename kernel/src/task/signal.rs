//! Signals
//!
//! Pending and blocked sets are bitmaps with bit `n` standing for signal
//! `n`. There are no user handlers: every signal either is ignored or
//! terminates the task.

use super::pid::Pid;
use super::task::{TaskStatus, WakeReason};
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::sync::InterruptGuard;
use bitflags::bitflags;
use core::fmt;

bitflags! {
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct SignalFlags: u32 {
        const SIGHUP    = 1 << 1;
        const SIGINT    = 1 << 2;
        const SIGQUIT   = 1 << 3;
        const SIGILL    = 1 << 4;
        const SIGTRAP   = 1 << 5;
        const SIGABRT   = 1 << 6;
        const SIGBUS    = 1 << 7;
        const SIGFPE    = 1 << 8;
        const SIGKILL   = 1 << 9;
        const SIGUSR1   = 1 << 10;
        const SIGSEGV   = 1 << 11;
        const SIGUSR2   = 1 << 12;
        const SIGPIPE   = 1 << 13;
        const SIGALRM   = 1 << 14;
        const SIGTERM   = 1 << 15;
        const SIGSTKFLT = 1 << 16;
        const SIGCHLD   = 1 << 17;
        const SIGCONT   = 1 << 18;
        const SIGSTOP   = 1 << 19;
        const SIGTSTP   = 1 << 20;
        const SIGTTIN   = 1 << 21;
        const SIGTTOU   = 1 << 22;
        const SIGURG    = 1 << 23;
        const SIGXCPU   = 1 << 24;
        const SIGXFSZ   = 1 << 25;
        const SIGVTALRM = 1 << 26;
        const SIGPROF   = 1 << 27;
        const SIGWINCH  = 1 << 28;
        const SIGIO     = 1 << 29;
        const SIGPWR    = 1 << 30;
        const SIGSYS    = 1 << 31;
    }
}

/// Can never be blocked
const UNMASKABLE: SignalFlags = SignalFlags::SIGKILL.union(SignalFlags::SIGSTOP);

/// Ignored unless a handler says otherwise, and there are no handlers
const IGNORED_BY_DEFAULT: SignalFlags = SignalFlags::SIGCHLD
    .union(SignalFlags::SIGURG)
    .union(SignalFlags::SIGWINCH)
    .union(SignalFlags::SIGCONT);

/// A single signal number in `1..=31`
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Signal(u8);

impl Signal {
    pub const SIGHUP: Signal = Signal(1);
    pub const SIGINT: Signal = Signal(2);
    pub const SIGILL: Signal = Signal(4);
    pub const SIGTRAP: Signal = Signal(5);
    pub const SIGABRT: Signal = Signal(6);
    pub const SIGBUS: Signal = Signal(7);
    pub const SIGKILL: Signal = Signal(9);
    pub const SIGUSR1: Signal = Signal(10);
    pub const SIGSEGV: Signal = Signal(11);
    pub const SIGUSR2: Signal = Signal(12);
    pub const SIGTERM: Signal = Signal(15);
    pub const SIGCHLD: Signal = Signal(17);
    pub const SIGCONT: Signal = Signal(18);
    pub const SIGSTOP: Signal = Signal(19);
    pub const SIGIO: Signal = Signal(29);

    pub fn new(signum: usize) -> KernelResult<Self> {
        if (1..=31).contains(&signum) {
            Ok(Self(signum as u8))
        } else {
            Err(KernelError::InvalidSignal(signum))
        }
    }

    pub fn number(self) -> usize {
        self.0 as usize
    }

    pub fn flag(self) -> SignalFlags {
        SignalFlags::from_bits_truncate(1 << self.0)
    }

    pub fn default_action(self) -> SignalAction {
        if IGNORED_BY_DEFAULT.contains(self.flag()) {
            SignalAction::Ignore
        } else {
            SignalAction::Terminate
        }
    }

    /// Exit code of a task killed by this signal
    pub fn exit_code(self) -> i32 {
        -(self.0 as i32)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "signal {}", self.0)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SignalAction {
    Ignore,
    Terminate,
}

/// Per-task signal bookkeeping
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SignalState {
    pub pending: SignalFlags,
    pub mask: SignalFlags,
}

impl SignalState {
    pub fn new() -> Self {
        Self {
            pending: SignalFlags::empty(),
            mask: SignalFlags::empty(),
        }
    }

    pub fn post(&mut self, signal: Signal) {
        self.pending |= signal.flag();
    }

    fn blocked(&self) -> SignalFlags {
        self.mask - UNMASKABLE
    }

    pub fn is_deliverable(&self, signal: Signal) -> bool {
        !self.blocked().contains(signal.flag())
    }

    pub fn has_deliverable(&self) -> bool {
        !(self.pending - self.blocked()).is_empty()
    }

    /// Pop the lowest-numbered pending signal that is not masked
    pub fn take_deliverable(&mut self) -> Option<Signal> {
        let ready = self.pending - self.blocked();
        if ready.is_empty() {
            return None;
        }
        let signal = Signal(ready.bits().trailing_zeros() as u8);
        self.pending.remove(signal.flag());
        Some(signal)
    }

    /// Replace the mask, returning the previous one. SIGKILL and SIGSTOP
    /// are dropped from the new mask.
    pub fn set_mask(&mut self, mask: SignalFlags) -> SignalFlags {
        core::mem::replace(&mut self.mask, mask - UNMASKABLE)
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Mark `signal` pending on `pid`. An interruptibly blocked task is
    /// woken if the signal can reach it and would not just be ignored.
    pub fn post_signal(&mut self, pid: Pid, signal: Signal) -> KernelResult<()> {
        let _intr = InterruptGuard::new();
        let task = self.tasks.get_mut(pid).ok_or(KernelError::NoSuchTask(pid))?;
        if task.is_zombie() {
            return Ok(());
        }
        task.signals.post(signal);
        log::debug!("{} posted to task {}", signal, pid);
        let interrupts = task.status == TaskStatus::Blocked
            && task.waiting.is_some_and(|wait| wait.interruptible())
            && task.signals.is_deliverable(signal)
            && signal.default_action() == SignalAction::Terminate;
        if interrupts {
            self.wake(pid, WakeReason::Interrupted)?;
        }
        Ok(())
    }

    /// Install a new signal mask, returning the old one
    pub fn set_signal_mask(&mut self, pid: Pid, mask: SignalFlags) -> KernelResult<SignalFlags> {
        let _intr = InterruptGuard::new();
        let task = self.tasks.get_mut(pid).ok_or(KernelError::NoSuchTask(pid))?;
        Ok(task.signals.set_mask(mask))
    }

    pub fn take_deliverable(&mut self, pid: Pid) -> KernelResult<Option<Signal>> {
        let _intr = InterruptGuard::new();
        let task = self.tasks.get_mut(pid).ok_or(KernelError::NoSuchTask(pid))?;
        Ok(task.signals.take_deliverable())
    }

    /// Apply default actions to every deliverable signal of `pid`. Returns
    /// the exit code if one of them terminates the task.
    pub fn handle_signals(&mut self, pid: Pid) -> KernelResult<Option<i32>> {
        while let Some(signal) = self.take_deliverable(pid)? {
            match signal.default_action() {
                SignalAction::Ignore => log::trace!("task {} ignores {}", pid, signal),
                SignalAction::Terminate => {
                    log::info!("task {} killed by {}", pid, signal);
                    return Ok(Some(signal.exit_code()));
                }
            }
        }
        Ok(None)
    }
}
