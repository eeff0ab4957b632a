//! Boot sequence, the idle loop and the panic handler
//!
//! The kernel lives in a static cell. Every entry from assembly borrows it
//! for one operation, releases it, and only then performs the context
//! switch the operation recorded.

use super::{__switch, sbi, trap};
use crate::config::{BootConfig, MEMORY_END, MMIO};
use crate::initproc;
use crate::kernel::Kernel;
use crate::logging;
use crate::mm::{heap, FrameAllocator, KernelLayout, PhysAddr};
use crate::sync::UPIntrFreeCell;
use crate::task::TaskStatus;
use crate::trap::Trap;
use core::panic::PanicInfo;
use lazy_static::lazy_static;

lazy_static! {
    static ref KERNEL: UPIntrFreeCell<Option<Kernel>> = unsafe { UPIntrFreeCell::new(None) };
}

fn with_kernel<V>(f: impl FnOnce(&mut Kernel) -> V) -> V {
    KERNEL.exclusive_session(|slot| match slot {
        Some(kernel) => f(kernel),
        None => panic!("kernel used before boot"),
    })
}

/// Run `f`, then switch contexts if it asked for that. Returns whether a
/// switch happened.
fn run_and_switch(f: impl FnOnce(&mut Kernel)) -> bool {
    let pending = with_kernel(|kernel| {
        f(kernel);
        kernel.processor_mut().hart_mut().take_pending()
    });
    match pending {
        Some((current, next)) => {
            // SAFETY: both contexts belong to the kernel in `KERNEL`, which
            // is never moved or dropped.
            unsafe { __switch(current, next) };
            true
        }
        None => false,
    }
}

pub(super) fn handle_trap(trap: Trap) {
    run_and_switch(|kernel| {
        kernel.handle_trap(trap);
    });
}

pub(super) fn user_token() -> usize {
    with_kernel(|kernel| kernel.processor().active_token())
}

pub(super) fn cycles_per_tick() -> usize {
    with_kernel(|kernel| kernel.config().cycles_per_tick())
}

fn clear_bss() {
    extern "C" {
        fn sbss();
        fn ebss();
    }
    // SAFETY: nothing in .bss is in use yet.
    unsafe {
        core::slice::from_raw_parts_mut(sbss as usize as *mut u8, ebss as usize - sbss as usize)
            .fill(0);
    }
}

fn kernel_layout() -> KernelLayout {
    extern "C" {
        fn stext();
        fn etext();
        fn srodata();
        fn erodata();
        fn sdata();
        fn edata();
        fn sbss_with_stack();
        fn ebss();
        fn ekernel();
        fn strampoline();
    }
    KernelLayout {
        stext: stext as usize,
        etext: etext as usize,
        srodata: srodata as usize,
        erodata: erodata as usize,
        sdata: sdata as usize,
        edata: edata as usize,
        sbss_with_stack: sbss_with_stack as usize,
        ebss: ebss as usize,
        ekernel: ekernel as usize,
        strampoline: strampoline as usize,
        memory_end: MEMORY_END,
        mmio: MMIO,
    }
}

/// Called from `_start` on the boot stack
#[no_mangle]
pub fn kernel_main() -> ! {
    clear_bss();
    heap::init_heap();
    logging::init();
    println!("[kernel] Kestrel booting");

    let layout = kernel_layout();
    let config = BootConfig::default();
    // SAFETY: RAM past the kernel image belongs to nobody else.
    let frames = unsafe {
        FrameAllocator::new(PhysAddr::new(layout.ekernel), PhysAddr::new(layout.memory_end))
    };
    let mut kernel = match Kernel::new(frames, layout, config) {
        Ok(kernel) => kernel,
        Err(err) => panic!("building the kernel space: {}", err),
    };
    if let Err(err) = kernel.spawn(&initproc::image()) {
        panic!("spawning init: {}", err);
    }
    *KERNEL.exclusive_access() = Some(kernel);

    trap::enable_timer_interrupt();
    trap::set_next_trigger(config.cycles_per_tick());
    idle_loop()
}

/// Runs on the boot stack whenever no task holds the hart
fn idle_loop() -> ! {
    loop {
        let alive = with_kernel(|kernel| {
            [TaskStatus::Ready, TaskStatus::Running, TaskStatus::Blocked]
                .into_iter()
                .map(|status| kernel.count_with_status(status))
                .sum::<usize>()
        });
        if alive == 0 {
            println!("[kernel] no tasks left, shutting down");
            sbi::shutdown(false);
        }
        let switched = run_and_switch(|kernel| {
            let cycles = kernel.config().cycles_per_tick();
            let now = trap::current_tick(cycles);
            if now > kernel.ticks() {
                trap::set_next_trigger(cycles);
                kernel.tick(now);
            } else {
                kernel.return_to_user();
            }
        });
        if !switched {
            super::wait_for_interrupt();
        }
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    if let Some(location) = info.location() {
        println!(
            "[kernel] Panicked at {}:{} {}",
            location.file(),
            location.line(),
            info.message()
        );
    } else {
        println!("[kernel] Panicked: {}", info.message());
    }
    sbi::shutdown(true)
}
