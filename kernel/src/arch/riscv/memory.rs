//! Physical memory seen through the kernel's identity mapping

use crate::config::PAGE_SIZE;
use crate::mm::{PhysAddr, PhysPageNum};

/// The frames `[start, end)`, reached at their physical addresses
pub struct PhysMemory {
    start: PhysPageNum,
    end: PhysPageNum,
}

impl PhysMemory {
    /// # Safety
    /// The range must be RAM that nothing else uses and that stays
    /// identity-mapped whenever the kernel touches it.
    pub unsafe fn new(start: PhysPageNum, end: PhysPageNum) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ppn: PhysPageNum) -> bool {
        self.start <= ppn && ppn < self.end
    }

    fn frame_ptr(&self, ppn: PhysPageNum) -> Option<*mut [u8; PAGE_SIZE]> {
        let pa: PhysAddr = ppn.into();
        self.contains(ppn).then_some(pa.0 as *mut [u8; PAGE_SIZE])
    }

    pub fn frame(&self, ppn: PhysPageNum) -> Option<&[u8; PAGE_SIZE]> {
        // SAFETY: the frame lies in the range handed over in `new`.
        self.frame_ptr(ppn).map(|ptr| unsafe { &*ptr })
    }

    pub fn frame_mut(&mut self, ppn: PhysPageNum) -> Option<&mut [u8; PAGE_SIZE]> {
        // SAFETY: as above, and `&mut self` makes the access exclusive.
        self.frame_ptr(ppn).map(|ptr| unsafe { &mut *ptr })
    }

    /// Copy a whole frame; false if either frame is outside the range
    pub fn copy_frame(&mut self, src: PhysPageNum, dst: PhysPageNum) -> bool {
        match (self.frame_ptr(src), self.frame_ptr(dst)) {
            (Some(s), Some(d)) => {
                if s != d {
                    // SAFETY: distinct whole frames inside the range.
                    unsafe { core::ptr::copy_nonoverlapping(s, d, 1) };
                }
                true
            }
            _ => false,
        }
    }
}
