//! Physical Frame Allocator
//!
//! Manages physical memory pages using a bitmap allocation strategy with a
//! next-fit cursor. The allocator also owns the [`PhysMemory`] view, so every
//! byte of a frame is reached through it.

use super::page_table::PageTableEntry;
use super::{PhysAddr, PhysPageNum};
use crate::arch::PhysMemory;
use crate::config::PAGE_SIZE;
use crate::error::{KernelError, KernelResult};
use crate::trap::TrapContext;
use alloc::vec::Vec;
use core::mem::{align_of, size_of};

const BITS: usize = u64::BITS as usize;

/// Owning handle for one allocated frame. Not `Copy`: it goes back through
/// [`FrameAllocator::release`] exactly once.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct FrameTracker {
    pub ppn: PhysPageNum,
}

/// Bitmap-based frame allocator
pub struct FrameAllocator {
    /// First frame of the pool
    start: PhysPageNum,
    /// One past the last frame of the pool
    end: PhysPageNum,
    /// 1 = allocated, 0 = free
    bitmap: Vec<u64>,
    /// Where the next search begins
    next: usize,
    free: usize,
    memory: PhysMemory,
}

impl FrameAllocator {
    /// Create an allocator over the physical range `[start, end)`, shrunk
    /// inwards to whole frames.
    ///
    /// # Safety
    /// On hardware the range must be identity-mapped RAM that nothing else
    /// uses.
    pub unsafe fn new(start: PhysAddr, end: PhysAddr) -> Self {
        let start = start.ceil();
        let end = end.floor().max(start);
        let total = end.0 - start.0;
        log::debug!("frame pool {:?}..{:?} ({} frames)", start, end, total);
        Self {
            start,
            end,
            bitmap: alloc::vec![0; (total + BITS - 1) / BITS],
            next: 0,
            free: total,
            memory: PhysMemory::new(start, end),
        }
    }

    fn index(&self, ppn: PhysPageNum) -> Option<usize> {
        (self.start <= ppn && ppn < self.end).then(|| ppn.0 - self.start.0)
    }

    fn test_bit(&self, idx: usize) -> bool {
        self.bitmap[idx / BITS] & (1 << (idx % BITS)) != 0
    }

    /// Allocate a zero-filled physical frame
    pub fn alloc(&mut self) -> KernelResult<PhysPageNum> {
        let total = self.total_frames();
        if self.free == 0 {
            log::warn!("frame allocator exhausted ({} frames)", total);
            return Err(KernelError::OutOfMemory);
        }
        for offset in 0..total {
            let idx = (self.next + offset) % total;
            if self.test_bit(idx) {
                continue;
            }
            self.bitmap[idx / BITS] |= 1 << (idx % BITS);
            self.next = (idx + 1) % total;
            self.free -= 1;
            let ppn = PhysPageNum(self.start.0 + idx);
            self.frame_bytes_mut(ppn)?.fill(0);
            log::trace!("alloc {:?}", ppn);
            return Ok(ppn);
        }
        Err(KernelError::OutOfMemory)
    }

    /// Allocate a frame wrapped in an owning handle
    pub fn alloc_tracked(&mut self) -> KernelResult<FrameTracker> {
        self.alloc().map(|ppn| FrameTracker { ppn })
    }

    /// Return a frame to the pool. A frame outside the pool or not currently
    /// allocated is rejected.
    pub fn dealloc(&mut self, ppn: PhysPageNum) -> KernelResult<()> {
        match self.index(ppn) {
            Some(idx) if self.test_bit(idx) => {
                self.bitmap[idx / BITS] &= !(1 << (idx % BITS));
                self.free += 1;
                log::trace!("dealloc {:?}", ppn);
                Ok(())
            }
            _ => {
                log::error!("frame {:?} has not been allocated", ppn);
                Err(KernelError::FrameNotAllocated(ppn))
            }
        }
    }

    /// Give back a tracked frame
    pub fn release(&mut self, frame: FrameTracker) -> KernelResult<()> {
        self.dealloc(frame.ppn)
    }

    /// Get number of free frames
    pub fn free_frames(&self) -> usize {
        self.free
    }

    /// Get total number of frames
    pub fn total_frames(&self) -> usize {
        self.end.0 - self.start.0
    }

    pub fn is_allocated(&self, ppn: PhysPageNum) -> bool {
        self.index(ppn).is_some_and(|idx| self.test_bit(idx))
    }

    pub fn frame_bytes(&self, ppn: PhysPageNum) -> KernelResult<&[u8; PAGE_SIZE]> {
        self.memory
            .frame(ppn)
            .ok_or(KernelError::FrameNotAllocated(ppn))
    }

    pub fn frame_bytes_mut(&mut self, ppn: PhysPageNum) -> KernelResult<&mut [u8; PAGE_SIZE]> {
        self.memory
            .frame_mut(ppn)
            .ok_or(KernelError::FrameNotAllocated(ppn))
    }

    /// Copy the contents of `src` over `dst`
    pub fn copy_frame(&mut self, src: PhysPageNum, dst: PhysPageNum) -> KernelResult<()> {
        if self.memory.copy_frame(src, dst) {
            Ok(())
        } else {
            Err(KernelError::FrameNotAllocated(src))
        }
    }

    /// View a frame as a page-table node
    pub fn ptes(&self, ppn: PhysPageNum) -> KernelResult<&[PageTableEntry; 512]> {
        let bytes = self.frame_bytes(ppn)?;
        // SAFETY: frames are page aligned and `PageTableEntry` is a plain u64.
        Ok(unsafe { cast_ref(bytes) })
    }

    pub fn ptes_mut(&mut self, ppn: PhysPageNum) -> KernelResult<&mut [PageTableEntry; 512]> {
        let bytes = self.frame_bytes_mut(ppn)?;
        // SAFETY: as in `ptes`.
        Ok(unsafe { cast_mut(bytes) })
    }

    /// View the start of a frame as a trap context
    pub fn trap_context(&self, ppn: PhysPageNum) -> KernelResult<&TrapContext> {
        let bytes = self.frame_bytes(ppn)?;
        // SAFETY: `TrapContext` is `repr(C)` usizes and fits in a page.
        Ok(unsafe { cast_ref(bytes) })
    }

    pub fn trap_context_mut(&mut self, ppn: PhysPageNum) -> KernelResult<&mut TrapContext> {
        let bytes = self.frame_bytes_mut(ppn)?;
        // SAFETY: as in `trap_context`.
        Ok(unsafe { cast_mut(bytes) })
    }
}

/// # Safety
/// `T` must be valid for any bit pattern.
unsafe fn cast_ref<T>(bytes: &[u8; PAGE_SIZE]) -> &T {
    debug_assert!(size_of::<T>() <= PAGE_SIZE && align_of::<T>() <= PAGE_SIZE);
    &*(bytes.as_ptr() as *const T)
}

/// # Safety
/// `T` must be valid for any bit pattern.
unsafe fn cast_mut<T>(bytes: &mut [u8; PAGE_SIZE]) -> &mut T {
    debug_assert!(size_of::<T>() <= PAGE_SIZE && align_of::<T>() <= PAGE_SIZE);
    &mut *(bytes.as_mut_ptr() as *mut T)
}
