//! Kernel configuration constants

/// User stack size (8KB)
pub const USER_STACK_SIZE: usize = 4096 * 2;

/// Kernel stack size (16KB)
pub const KERNEL_STACK_SIZE: usize = 4096 * 4;

/// Kernel heap size (8MB)
pub const KERNEL_HEAP_SIZE: usize = 0x80_0000;

/// Physical memory end (128MB for QEMU virt)
pub const MEMORY_END: usize = 0x8800_0000;

/// Page size (4KB)
pub const PAGE_SIZE: usize = 0x1000;

/// Page size bits
pub const PAGE_SIZE_BITS: usize = 12;

/// Physical address width under Sv39
pub const PA_WIDTH_SV39: usize = 56;
/// Virtual address width under Sv39
pub const VA_WIDTH_SV39: usize = 39;
pub const PPN_WIDTH_SV39: usize = PA_WIDTH_SV39 - PAGE_SIZE_BITS;
pub const VPN_WIDTH_SV39: usize = VA_WIDTH_SV39 - PAGE_SIZE_BITS;

/// First address past the user half of an Sv39 space. User mappings and
/// user pointers stay below it.
pub const USER_SPACE_END: usize = 1 << (VA_WIDTH_SV39 - 1);

/// The trampoline page sits at the very top of every address space
pub const TRAMPOLINE: usize = usize::MAX - PAGE_SIZE + 1;

/// Each user space keeps its trap context right below the trampoline
pub const TRAP_CONTEXT: usize = TRAMPOLINE - PAGE_SIZE;

/// Clock frequency (10MHz for QEMU)
pub const CLOCK_FREQ: usize = 10_000_000;

/// Timer interrupts per second
pub const TICKS_PER_SEC: usize = 100;

/// Timer ticks a task may run before it is preempted
pub const TIME_SLICE_TICKS: usize = 10;

/// Syscall ids below this are counted per task
pub const MAX_SYSCALL_NUM: usize = 500;

/// Memory-mapped device windows on the QEMU virt board: (base, length)
pub const MMIO: &[(usize, usize)] = &[
    (0x0010_0000, 0x00_2000), // VIRT_TEST/RTC
    (0x0200_0000, 0x01_0000), // CLINT
    (0x0c00_0000, 0x21_0000), // PLIC
    (0x1000_0000, 0x00_9000), // UART and virtio
];

/// Runtime knobs chosen at boot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootConfig {
    /// Timer ticks per scheduling quantum
    pub time_slice_ticks: usize,
    /// Timer interrupts per second
    pub ticks_per_sec: usize,
    /// Frequency of the `time` CSR
    pub clock_freq: usize,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            time_slice_ticks: TIME_SLICE_TICKS,
            ticks_per_sec: TICKS_PER_SEC,
            clock_freq: CLOCK_FREQ,
        }
    }
}

impl BootConfig {
    /// Number of `time` CSR cycles between two timer interrupts
    pub fn cycles_per_tick(&self) -> usize {
        self.clock_freq / self.ticks_per_sec
    }

    /// Convert milliseconds into timer ticks, rounding up. Saturates at
    /// `u64::MAX`.
    pub fn ms_to_ticks(&self, ms: usize) -> u64 {
        let ticks = (ms as u128 * self.ticks_per_sec as u128).div_ceil(1000);
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    /// Convert timer ticks into milliseconds, saturating
    pub fn ticks_to_ms(&self, ticks: u64) -> usize {
        let ms = ticks as u128 * 1000 / self.ticks_per_sec as u128;
        usize::try_from(ms).unwrap_or(usize::MAX)
    }
}
