//! Kernel error type

use crate::mm::{PhysPageNum, VirtAddr, VirtPageNum};
use crate::task::Pid;
use core::fmt;

/// Every fallible core operation reports one of these
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The frame pool is exhausted
    OutOfMemory,
    /// The leaf entry for this page is already valid
    AlreadyMapped(VirtPageNum),
    /// No translation exists for this page
    NotMapped(VirtPageNum),
    /// A new area intersects an existing one
    OverlappingMapping,
    /// The address is not backed by accessible memory
    InvalidAddress(VirtAddr),
    /// The frame is outside the pool or not currently allocated
    FrameNotAllocated(PhysPageNum),
    /// The executable image could not be loaded
    InvalidElf(&'static str),
    NoSuchTask(Pid),
    NoSuchChild,
    /// The task is not in a state that permits the operation
    InvalidState,
    InvalidSignal(usize),
    InvalidArgument,
}

pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of physical frames"),
            Self::AlreadyMapped(vpn) => write!(f, "{:?} is already mapped", vpn),
            Self::NotMapped(vpn) => write!(f, "{:?} is not mapped", vpn),
            Self::OverlappingMapping => write!(f, "area overlaps an existing mapping"),
            Self::InvalidAddress(va) => write!(f, "invalid address {:?}", va),
            Self::FrameNotAllocated(ppn) => write!(f, "{:?} is not an allocated frame", ppn),
            Self::InvalidElf(why) => write!(f, "invalid ELF image: {}", why),
            Self::NoSuchTask(pid) => write!(f, "no task with pid {}", pid),
            Self::NoSuchChild => write!(f, "no matching child"),
            Self::InvalidState => write!(f, "task is in the wrong state"),
            Self::InvalidSignal(num) => write!(f, "invalid signal number {}", num),
            Self::InvalidArgument => write!(f, "invalid argument"),
        }
    }
}
