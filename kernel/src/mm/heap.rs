//! Kernel heap on hardware, backed by a buddy allocator over a static
//! region in `.bss`

use crate::config::KERNEL_HEAP_SIZE;
use buddy_system_allocator::LockedHeap;

#[global_allocator]
static HEAP_ALLOCATOR: LockedHeap<32> = LockedHeap::empty();

static mut HEAP_SPACE: [u8; KERNEL_HEAP_SIZE] = [0; KERNEL_HEAP_SIZE];

/// Hand the heap region to the allocator. Call once, before any allocation.
pub fn init_heap() {
    // SAFETY: runs once during boot, before anything else touches HEAP_SPACE.
    unsafe {
        let start = core::ptr::addr_of_mut!(HEAP_SPACE) as usize;
        HEAP_ALLOCATOR.lock().init(start, KERNEL_HEAP_SIZE);
    }
    log::debug!("kernel heap: {:#x} bytes", KERNEL_HEAP_SIZE);
}
