//! Trap entry and exit for user mode

use super::{boot, sbi};
use crate::config::{TRAMPOLINE, TRAP_CONTEXT};
use crate::trap::{AccessType, Trap};
use core::arch::asm;
use riscv::register::mtvec::TrapMode;
use riscv::register::scause::{self, Exception, Interrupt, Trap as Cause};
use riscv::register::{sepc, sie, stval, stvec, time};

pub fn trap_handler_address() -> usize {
    trap_handler as usize
}

pub fn trap_return_address() -> usize {
    trap_return as usize
}

fn set_kernel_trap_entry() {
    // SAFETY: `trap_from_kernel` never returns.
    unsafe { stvec::write(trap_from_kernel as usize, TrapMode::Direct) }
}

fn set_user_trap_entry() {
    // SAFETY: the trampoline is mapped in every user space.
    unsafe { stvec::write(TRAMPOLINE, TrapMode::Direct) }
}

pub fn enable_timer_interrupt() {
    // SAFETY: only sets sie.STIE.
    unsafe { sie::set_stimer() }
}

/// Arm the timer one tick from now
pub fn set_next_trigger(cycles_per_tick: usize) {
    sbi::set_timer((time::read() + cycles_per_tick) as u64);
}

/// Ticks elapsed since boot
pub fn current_tick(cycles_per_tick: usize) -> u64 {
    (time::read() / cycles_per_tick) as u64
}

/// Entered from `__alltraps` on the task's kernel stack
#[no_mangle]
pub fn trap_handler() -> ! {
    set_kernel_trap_entry();
    let stval = stval::read();
    let trap = match scause::read().cause() {
        Cause::Exception(Exception::UserEnvCall) => Trap::Syscall,
        Cause::Exception(Exception::StoreFault | Exception::StorePageFault) => Trap::PageFault {
            addr: stval,
            access: AccessType::Store,
        },
        Cause::Exception(Exception::LoadFault | Exception::LoadPageFault) => Trap::PageFault {
            addr: stval,
            access: AccessType::Load,
        },
        Cause::Exception(Exception::InstructionFault | Exception::InstructionPageFault) => {
            Trap::PageFault {
                addr: stval,
                access: AccessType::Execute,
            }
        }
        Cause::Exception(Exception::Breakpoint) => Trap::Breakpoint { addr: sepc::read() },
        Cause::Exception(Exception::InstructionMisaligned) => Trap::Misaligned {
            addr: stval,
            access: AccessType::Execute,
        },
        Cause::Exception(Exception::LoadMisaligned) => Trap::Misaligned {
            addr: stval,
            access: AccessType::Load,
        },
        Cause::Exception(Exception::StoreMisaligned) => Trap::Misaligned {
            addr: stval,
            access: AccessType::Store,
        },
        Cause::Exception(cause) => {
            if !matches!(cause, Exception::IllegalInstruction) {
                log::warn!("user exception {:?}, stval = {:#x}", cause, stval);
            }
            Trap::IllegalInstruction { addr: sepc::read() }
        }
        Cause::Interrupt(Interrupt::SupervisorTimer) => {
            let cycles = boot::cycles_per_tick();
            set_next_trigger(cycles);
            Trap::Timer {
                now: current_tick(cycles),
            }
        }
        Cause::Interrupt(Interrupt::SupervisorExternal) => Trap::External,
        cause => panic!("unsupported interrupt {:?}, stval = {:#x}", cause, stval),
    };
    boot::handle_trap(trap);
    trap_return()
}

/// Leave for user mode through `__restore` in the trampoline, with the
/// current task's trap context and address space
#[no_mangle]
pub fn trap_return() -> ! {
    set_user_trap_entry();
    let user_satp = boot::user_token();
    extern "C" {
        fn __alltraps();
        fn __restore();
    }
    let restore_va = __restore as usize - __alltraps as usize + TRAMPOLINE;
    // SAFETY: the trap context page and the trampoline are mapped in the
    // space `user_satp` names.
    unsafe {
        asm!(
            "fence.i",
            "jr {restore_va}",
            restore_va = in(reg) restore_va,
            in("a0") TRAP_CONTEXT,
            in("a1") user_satp,
            options(noreturn)
        );
    }
}

#[no_mangle]
pub fn trap_from_kernel() -> ! {
    panic!(
        "trap from kernel: {:?}, stval = {:#x}, sepc = {:#x}",
        scause::read().cause(),
        stval::read(),
        sepc::read()
    );
}
