//! Memory Management Module
//!
//! - physical frame allocation (bitmap, next-fit)
//! - SV39 page tables
//! - address spaces built from map areas
//! - the kernel heap (hardware only)

pub mod frame_allocator;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod heap;
pub mod memory_layout;
pub mod memory_set;
pub mod page_table;

pub use frame_allocator::{FrameAllocator, FrameTracker};
pub use memory_layout::{
    PhysAddr, PhysPageNum, SimpleRange, StepByOne, VPNRange, VirtAddr, VirtPageNum,
};
pub use memory_set::{
    user_range_end, AppImage, KernelLayout, MapArea, MapPermission, MapType, MemorySet, Segment,
};
pub use page_table::{PTEFlags, PageTable, PageTableEntry};
