//! Process identifiers and kernel stacks

use crate::config::{KERNEL_STACK_SIZE, PAGE_SIZE, TRAMPOLINE};
use crate::error::{KernelError, KernelResult};
use crate::mm::{FrameAllocator, MapPermission, MemorySet, VirtAddr};
use alloc::vec::Vec;
use core::fmt;

/// Process identifier
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub usize);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out small integers, reusing released ones first
pub struct RecycleAllocator {
    current: usize,
    recycled: Vec<usize>,
}

impl RecycleAllocator {
    pub fn new() -> Self {
        Self {
            current: 0,
            recycled: Vec::new(),
        }
    }

    pub fn alloc(&mut self) -> usize {
        if let Some(id) = self.recycled.pop() {
            id
        } else {
            self.current += 1;
            self.current - 1
        }
    }

    pub fn dealloc(&mut self, id: usize) -> KernelResult<()> {
        if id >= self.current || self.recycled.contains(&id) {
            log::error!("id {} has not been allocated", id);
            return Err(KernelError::InvalidArgument);
        }
        self.recycled.push(id);
        Ok(())
    }
}

impl Default for RecycleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Return (bottom, top) of a kernel stack in kernel space. A guard page
/// sits below each stack.
pub fn kernel_stack_position(id: usize) -> (usize, usize) {
    let top = TRAMPOLINE - id * (KERNEL_STACK_SIZE + PAGE_SIZE);
    let bottom = top - KERNEL_STACK_SIZE;
    (bottom, top)
}

/// Kernel stack for a task, mapped into the kernel space
#[derive(Debug)]
pub struct KernelStack {
    id: usize,
}

impl KernelStack {
    pub fn new(
        id: usize,
        kernel_space: &mut MemorySet,
        frames: &mut FrameAllocator,
    ) -> KernelResult<Self> {
        let (bottom, top) = kernel_stack_position(id + 1);
        kernel_space.insert_framed_area(
            frames,
            VirtAddr::new(bottom),
            VirtAddr::new(top),
            MapPermission::R | MapPermission::W,
        )?;
        Ok(Self { id })
    }

    pub fn top(&self) -> usize {
        kernel_stack_position(self.id + 1).1
    }

    /// Unmap the stack and return its frames
    pub fn release(self, kernel_space: &mut MemorySet, frames: &mut FrameAllocator) -> KernelResult<()> {
        let (bottom, _) = kernel_stack_position(self.id + 1);
        kernel_space.remove_area_with_start_vpn(frames, VirtAddr::new(bottom).floor())
    }
}
