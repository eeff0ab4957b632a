//! Task Context
//!
//! The callee-saved state exchanged by a context switch

use crate::arch;

/// Task context for context switching
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[repr(C)]
pub struct TaskContext {
    /// Return address (ra)
    ra: usize,
    /// Stack pointer (sp)
    sp: usize,
    /// Saved registers s0-s11
    s: [usize; 12],
}

impl TaskContext {
    /// Create a zero-initialized context
    pub fn zero_init() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s: [0; 12],
        }
    }

    /// A context that resumes in `trap_return` on the given kernel stack
    pub fn goto_trap_return(kstack_ptr: usize) -> Self {
        Self {
            ra: arch::trap_return_address(),
            sp: kstack_ptr,
            s: [0; 12],
        }
    }

    pub fn ra(&self) -> usize {
        self.ra
    }

    pub fn sp(&self) -> usize {
        self.sp
    }
}
