//! Physical memory emulated as a frame arena

use crate::config::PAGE_SIZE;
use crate::mm::PhysPageNum;
use alloc::vec::Vec;

#[derive(Clone)]
#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE]);

/// Backing store for the frames `[start, end)`, indexed by frame number
pub struct PhysMemory {
    start: PhysPageNum,
    frames: Vec<Frame>,
}

impl PhysMemory {
    /// # Safety
    /// Always safe on the host; the signature matches the hardware
    /// back-end, where the range must be otherwise unused RAM.
    pub unsafe fn new(start: PhysPageNum, end: PhysPageNum) -> Self {
        let count = end.0.saturating_sub(start.0);
        Self {
            start,
            frames: alloc::vec![Frame([0; PAGE_SIZE]); count],
        }
    }

    fn index(&self, ppn: PhysPageNum) -> Option<usize> {
        let idx = ppn.0.checked_sub(self.start.0)?;
        (idx < self.frames.len()).then_some(idx)
    }

    pub fn contains(&self, ppn: PhysPageNum) -> bool {
        self.index(ppn).is_some()
    }

    pub fn frame(&self, ppn: PhysPageNum) -> Option<&[u8; PAGE_SIZE]> {
        self.index(ppn).map(|idx| &self.frames[idx].0)
    }

    pub fn frame_mut(&mut self, ppn: PhysPageNum) -> Option<&mut [u8; PAGE_SIZE]> {
        let idx = self.index(ppn)?;
        Some(&mut self.frames[idx].0)
    }

    /// Copy a whole frame; false if either frame is outside the arena
    pub fn copy_frame(&mut self, src: PhysPageNum, dst: PhysPageNum) -> bool {
        match (self.index(src), self.index(dst)) {
            (Some(s), Some(d)) => {
                if s != d {
                    let bytes = self.frames[s].0;
                    self.frames[d].0 = bytes;
                }
                true
            }
            _ => false,
        }
    }
}
