//! Uniprocessor synchronisation primitives

mod up;

pub use up::{InterruptGuard, UPIntrFreeCell, UPIntrRefMut, UPSafeCell};
