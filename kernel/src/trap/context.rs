//! Trap context for user-kernel transitions

/// `sstatus.SPIE`: interrupts come back on after `sret`
const SSTATUS_SPIE: usize = 1 << 5;

/// Saved on trap entry at `TRAP_CONTEXT`; the trampoline depends on the
/// field order.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrapContext {
    /// General registers x0..x31
    pub x: [usize; 32],
    pub sstatus: usize,
    pub sepc: usize,
    /// Kernel root the trampoline switches to
    pub kernel_satp: usize,
    /// This task's kernel stack top
    pub kernel_sp: usize,
    /// Address of the trap handler
    pub trap_handler: usize,
}

impl TrapContext {
    /// Context for the first entry into user mode at `entry`, with
    /// `sstatus.SPP` = User.
    pub fn app_init_context(
        entry: usize,
        sp: usize,
        kernel_satp: usize,
        kernel_sp: usize,
        trap_handler: usize,
    ) -> Self {
        let mut cx = Self {
            x: [0; 32],
            sstatus: SSTATUS_SPIE,
            sepc: entry,
            kernel_satp,
            kernel_sp,
            trap_handler,
        };
        cx.set_sp(sp);
        cx
    }

    /// Set stack pointer (x2)
    pub fn set_sp(&mut self, sp: usize) {
        self.x[2] = sp;
    }

    /// Syscall number (a7) and its first three arguments (a0..a2)
    pub fn syscall_args(&self) -> (usize, [usize; 3]) {
        (self.x[17], [self.x[10], self.x[11], self.x[12]])
    }
}
