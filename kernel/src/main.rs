//! Kestrel kernel image
//!
//! On RISC-V this is the bootable kernel: `_start` sets up the boot stack
//! and enters `kernel_main`. On a host it boots the core against the
//! software back-end and interprets the built-in init program until every
//! task is gone.

#![cfg_attr(target_os = "none", no_std, no_main)]

#[cfg(target_os = "none")]
extern crate kestrel;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
core::arch::global_asm!(include_str!("entry.asm"));

#[cfg(not(target_os = "none"))]
mod host {
    use kestrel::config::{BootConfig, MMIO, PAGE_SIZE};
    use kestrel::mm::{FrameAllocator, KernelLayout, PhysAddr};
    use kestrel::task::{Pid, TaskStatus};
    use kestrel::trap::Trap;
    use kestrel::{initproc, logging, Kernel, KernelResult};

    const POOL_START: usize = 0x8040_0000;
    const POOL_FRAMES: usize = 256;

    fn boot() -> KernelResult<Kernel> {
        let pool_end = POOL_START + POOL_FRAMES * PAGE_SIZE;
        // SAFETY: host frames are heap-backed.
        let frames =
            unsafe { FrameAllocator::new(PhysAddr::new(POOL_START), PhysAddr::new(pool_end)) };
        let layout = KernelLayout {
            stext: 0x8020_0000,
            etext: 0x8020_2000,
            srodata: 0x8020_2000,
            erodata: 0x8020_3000,
            sdata: 0x8020_3000,
            edata: 0x8020_4000,
            sbss_with_stack: 0x8020_4000,
            ebss: 0x8020_6000,
            ekernel: POOL_START,
            strampoline: 0x8020_1000,
            memory_end: pool_end,
            mmio: MMIO,
        };
        Kernel::new(frames, layout, BootConfig::default())
    }

    /// Execute one instruction of `pid`. Only `addi` and `ecall` are known.
    fn step(kernel: &mut Kernel, pid: Pid) -> KernelResult<Option<Pid>> {
        let pc = kernel.trap_context(pid)?.sepc;
        let mut bytes = [0u8; 4];
        kernel.copy_from_user(pid, pc, &mut bytes)?;
        let insn = u32::from_le_bytes(bytes);
        match insn & 0x7f {
            0x13 if (insn >> 12) & 0x7 == 0 => {
                let rd = ((insn >> 7) & 0x1f) as usize;
                let rs1 = ((insn >> 15) & 0x1f) as usize;
                let imm = ((insn as i32) >> 20) as usize;
                let cx = kernel.trap_context_mut(pid)?;
                if rd != 0 {
                    cx.x[rd] = cx.x[rs1].wrapping_add(imm);
                }
                cx.sepc += 4;
                Ok(Some(pid))
            }
            0x73 if insn == 0x0010_0073 => Ok(kernel.handle_trap(Trap::Breakpoint { addr: pc })),
            0x73 => Ok(kernel.handle_trap(Trap::Syscall)),
            _ => Ok(kernel.handle_trap(Trap::IllegalInstruction { addr: pc })),
        }
    }

    fn run() -> KernelResult<u64> {
        let mut kernel = boot()?;
        kernel.spawn(&initproc::image())?;
        let mut now = 0;
        let mut running = kernel.return_to_user();
        loop {
            running = match running {
                Some(pid) => step(&mut kernel, pid)?,
                None if kernel.count_with_status(TaskStatus::Blocked) > 0 => {
                    kestrel::arch::wait_for_interrupt();
                    now += 1;
                    kernel.handle_trap(Trap::Timer { now })
                }
                None => return Ok(now),
            };
        }
    }

    pub fn main() {
        kestrel::arch::software::install_console(|s| print!("{}", s));
        logging::init();
        match run() {
            Ok(ticks) => println!("[kernel] all tasks finished after {} ticks", ticks),
            Err(err) => {
                eprintln!("[kernel] {}", err);
                std::process::exit(1);
            }
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    host::main();
}
