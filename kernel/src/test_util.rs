//! Fixtures shared by the unit tests

use crate::config::{BootConfig, MMIO, PAGE_SIZE};
use crate::kernel::Kernel;
use crate::mm::{AppImage, FrameAllocator, KernelLayout, MapPermission, PhysAddr, Segment, VirtAddr};
use alloc::vec::Vec;

/// First frame of every test pool; clear of the fake kernel image below
pub const POOL_BASE: usize = 0x8040_0000;

pub fn frames(count: usize) -> FrameAllocator {
    // SAFETY: host frames are heap-backed.
    unsafe {
        FrameAllocator::new(
            PhysAddr::new(POOL_BASE),
            PhysAddr::new(POOL_BASE + count * PAGE_SIZE),
        )
    }
}

/// A small kernel image right below the frame pool
pub fn layout(frames: &FrameAllocator) -> KernelLayout {
    KernelLayout {
        stext: 0x8020_0000,
        etext: 0x8020_2000,
        srodata: 0x8020_2000,
        erodata: 0x8020_3000,
        sdata: 0x8020_3000,
        edata: 0x8020_4000,
        sbss_with_stack: 0x8020_4000,
        ebss: 0x8020_6000,
        ekernel: POOL_BASE,
        strampoline: 0x8020_1000,
        memory_end: POOL_BASE + frames.total_frames() * PAGE_SIZE,
        mmio: MMIO,
    }
}

pub fn kernel(count: usize) -> Kernel {
    let frames = frames(count);
    let layout = layout(&frames);
    Kernel::new(frames, layout, BootConfig::default()).unwrap()
}

/// One R+W+X segment at 0x10000 holding `data`, at least a page long
pub fn app_image(data: &[u8]) -> AppImage<'_> {
    AppImage {
        entry: 0x1_0000,
        segments: alloc::vec![Segment {
            start_va: VirtAddr::new(0x1_0000),
            mem_len: data.len().max(PAGE_SIZE),
            perm: MapPermission::R | MapPermission::W | MapPermission::X,
            data,
        }],
    }
}

/// A minimal RISC-V ELF64 executable with one R+X `PT_LOAD` segment. The
/// bytes live in a `u64` buffer so the headers are suitably aligned.
pub struct ElfImage {
    words: Vec<u64>,
    len: usize,
}

impl ElfImage {
    pub fn new(entry: usize, code: &[u8]) -> Self {
        const EHSIZE: usize = 64;
        const PHENTSIZE: usize = 56;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        bytes.extend_from_slice(&[0; 8]);
        bytes.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        bytes.extend_from_slice(&0xf3u16.to_le_bytes()); // EM_RISCV
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&(entry as u64).to_le_bytes());
        bytes.extend_from_slice(&(EHSIZE as u64).to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&(EHSIZE as u16).to_le_bytes());
        bytes.extend_from_slice(&(PHENTSIZE as u16).to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&64u16.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        assert_eq!(bytes.len(), EHSIZE);

        bytes.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        bytes.extend_from_slice(&0b101u32.to_le_bytes()); // R | X
        bytes.extend_from_slice(&((EHSIZE + PHENTSIZE) as u64).to_le_bytes());
        bytes.extend_from_slice(&(entry as u64).to_le_bytes());
        bytes.extend_from_slice(&(entry as u64).to_le_bytes());
        bytes.extend_from_slice(&(code.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&(code.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&(PAGE_SIZE as u64).to_le_bytes());
        assert_eq!(bytes.len(), EHSIZE + PHENTSIZE);
        bytes.extend_from_slice(code);

        let len = bytes.len();
        bytes.resize(len.next_multiple_of(8), 0);
        let words = bytes
            .chunks_exact(8)
            .map(|chunk| u64::from_ne_bytes(chunk.try_into().unwrap()))
            .collect();
        Self { words, len }
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: `words` holds at least `len` initialised bytes.
        unsafe { core::slice::from_raw_parts(self.words.as_ptr().cast::<u8>(), self.len) }
    }
}
