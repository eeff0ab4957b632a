//! Interior mutability for a single hart
//!
//! With one core the only source of concurrency is an interrupt, so a
//! `RefCell` is enough as long as the borrow is not held across one.

use crate::arch;
use core::cell::{RefCell, RefMut};
use core::ops::{Deref, DerefMut};

/// Wrap a static data structure inside it so that we are able to access
/// it without any `unsafe`.
///
/// We should only use it in uniprocessor.
///
/// In order to get mutable reference of inner data, call `exclusive_access`.
pub struct UPSafeCell<T> {
    inner: RefCell<T>,
}

unsafe impl<T> Sync for UPSafeCell<T> {}

impl<T> UPSafeCell<T> {
    /// # Safety
    /// The caller guarantees the cell is only touched from one hart.
    pub unsafe fn new(value: T) -> Self {
        Self {
            inner: RefCell::new(value),
        }
    }

    /// Panics if the data has been borrowed.
    pub fn exclusive_access(&self) -> RefMut<'_, T> {
        self.inner.borrow_mut()
    }
}

/// Masks supervisor interrupts for its lifetime and restores the previous
/// enable state on drop. Guards nest.
pub struct InterruptGuard {
    was_enabled: bool,
}

impl InterruptGuard {
    pub fn new() -> Self {
        let was_enabled = arch::interrupts_enabled();
        arch::disable_interrupts();
        Self { was_enabled }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            arch::enable_interrupts();
        }
    }
}

/// Like [`UPSafeCell`], but interrupts stay masked while the data is
/// borrowed.
pub struct UPIntrFreeCell<T> {
    inner: RefCell<T>,
}

unsafe impl<T> Sync for UPIntrFreeCell<T> {}

pub struct UPIntrRefMut<'a, T> {
    // Field order matters: the borrow is released before interrupts return.
    inner: RefMut<'a, T>,
    _guard: InterruptGuard,
}

impl<T> UPIntrFreeCell<T> {
    /// # Safety
    /// The caller guarantees the cell is only touched from one hart.
    pub unsafe fn new(value: T) -> Self {
        Self {
            inner: RefCell::new(value),
        }
    }

    /// Panics if the data has been borrowed.
    pub fn exclusive_access(&self) -> UPIntrRefMut<'_, T> {
        let guard = InterruptGuard::new();
        UPIntrRefMut {
            inner: self.inner.borrow_mut(),
            _guard: guard,
        }
    }

    pub fn exclusive_session<F, V>(&self, f: F) -> V
    where
        F: FnOnce(&mut T) -> V,
    {
        let mut inner = self.exclusive_access();
        f(inner.deref_mut())
    }
}

impl<T> Deref for UPIntrRefMut<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.inner.deref()
    }
}

impl<T> DerefMut for UPIntrRefMut<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.deref_mut()
    }
}
