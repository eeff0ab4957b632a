//! Page Table Management
//!
//! Implements SV39 page table for RISC-V 64-bit systems.
//! SV39 uses 3-level page tables with 39-bit virtual addresses.
//!
//! A table never touches memory directly: node frames are reached through
//! the [`FrameAllocator`], which turns the table into an arena of frames
//! indexed by physical page number.

use super::frame_allocator::{FrameAllocator, FrameTracker};
use super::{PhysAddr, PhysPageNum, VirtAddr, VirtPageNum};
use crate::error::{KernelError, KernelResult};
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt::{self, Debug, Formatter};

bitflags! {
    /// Page Table Entry (PTE) flags
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct PTEFlags: u8 {
        /// Valid flag
        const V = 1 << 0;
        /// Readable flag
        const R = 1 << 1;
        /// Writable flag
        const W = 1 << 2;
        /// Executable flag
        const X = 1 << 3;
        /// User accessible flag
        const U = 1 << 4;
        /// Global mapping flag
        const G = 1 << 5;
        /// Accessed flag (set by hardware)
        const A = 1 << 6;
        /// Dirty flag (set by hardware)
        const D = 1 << 7;
    }
}

const PPN_MASK: usize = (1 << 44) - 1;

/// Page Table Entry
///
/// PPN in bits 10..=53, flags in bits 0..=7, everything else zero.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
#[repr(C)]
pub struct PageTableEntry {
    pub bits: usize,
}

impl PageTableEntry {
    /// Create a PTE from physical page number and flags
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        Self {
            bits: ((ppn.0 & PPN_MASK) << 10) | flags.bits() as usize,
        }
    }

    /// Create a new invalid PTE
    pub fn empty() -> Self {
        Self { bits: 0 }
    }

    pub fn ppn(&self) -> PhysPageNum {
        PhysPageNum((self.bits >> 10) & PPN_MASK)
    }

    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.bits as u8)
    }

    pub fn is_valid(&self) -> bool {
        self.flags().contains(PTEFlags::V)
    }

    /// Check if PTE is a leaf (R/W/X set)
    pub fn is_leaf(&self) -> bool {
        self.flags().intersects(PTEFlags::R | PTEFlags::W | PTEFlags::X)
    }

    pub fn readable(&self) -> bool {
        self.flags().contains(PTEFlags::R)
    }

    pub fn writable(&self) -> bool {
        self.flags().contains(PTEFlags::W)
    }

    pub fn executable(&self) -> bool {
        self.flags().contains(PTEFlags::X)
    }

    pub fn user(&self) -> bool {
        self.flags().contains(PTEFlags::U)
    }
}

impl Debug for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PTE")
            .field("ppn", &self.ppn())
            .field("flags", &self.flags())
            .finish()
    }
}

/// One SV39 translation structure
pub struct PageTable {
    root_ppn: PhysPageNum,
    /// Node frames owned by this table, root first. Empty for a borrowed view.
    frames: Vec<FrameTracker>,
}

impl PageTable {
    /// Create a table with an empty root node
    pub fn new(frames: &mut FrameAllocator) -> KernelResult<Self> {
        let root = frames.alloc_tracked()?;
        Ok(Self {
            root_ppn: root.ppn,
            frames: alloc::vec![root],
        })
    }

    /// A non-owning view of the table behind a SATP value
    pub fn from_token(satp: usize) -> Self {
        Self {
            root_ppn: PhysPageNum::from(satp & PPN_MASK),
            frames: Vec::new(),
        }
    }

    pub fn root_ppn(&self) -> PhysPageNum {
        self.root_ppn
    }

    /// SATP value selecting this table in Sv39 mode
    pub fn token(&self) -> usize {
        8usize << 60 | self.root_ppn.0
    }

    /// Number of node frames this table owns
    pub fn node_count(&self) -> usize {
        self.frames.len()
    }

    fn find_pte_create<'a>(
        &mut self,
        frames: &'a mut FrameAllocator,
        vpn: VirtPageNum,
    ) -> KernelResult<&'a mut PageTableEntry> {
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;
        for &idx in &idxs[..2] {
            let pte = frames.ptes(ppn)?[idx];
            if !pte.is_valid() {
                let node = frames.alloc_tracked()?;
                frames.ptes_mut(ppn)?[idx] = PageTableEntry::new(node.ppn, PTEFlags::V);
                ppn = node.ppn;
                self.frames.push(node);
            } else if pte.is_leaf() {
                return Err(KernelError::AlreadyMapped(vpn));
            } else {
                ppn = pte.ppn();
            }
        }
        Ok(&mut frames.ptes_mut(ppn)?[idxs[2]])
    }

    /// Frame number of the leaf node covering `vpn`, if every level exists
    fn find_leaf_node(&self, frames: &FrameAllocator, vpn: VirtPageNum) -> Option<PhysPageNum> {
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;
        for &idx in &idxs[..2] {
            let pte = frames.ptes(ppn).ok()?[idx];
            if !pte.is_valid() || pte.is_leaf() {
                return None;
            }
            ppn = pte.ppn();
        }
        Some(ppn)
    }

    fn find_pte_mut<'a>(
        &self,
        frames: &'a mut FrameAllocator,
        vpn: VirtPageNum,
    ) -> Option<&'a mut PageTableEntry> {
        let node = self.find_leaf_node(frames, vpn)?;
        let pte = &mut frames.ptes_mut(node).ok()?[vpn.indexes()[2]];
        pte.is_valid().then_some(pte)
    }

    /// Map a virtual page to a physical page
    pub fn map(
        &mut self,
        frames: &mut FrameAllocator,
        vpn: VirtPageNum,
        ppn: PhysPageNum,
        flags: PTEFlags,
    ) -> KernelResult<()> {
        let pte = self.find_pte_create(frames, vpn)?;
        if pte.is_valid() {
            log::warn!("{:?} is mapped before mapping", vpn);
            return Err(KernelError::AlreadyMapped(vpn));
        }
        *pte = PageTableEntry::new(ppn, flags | PTEFlags::V);
        Ok(())
    }

    /// Unmap a virtual page, returning the frame it pointed at
    pub fn unmap(&mut self, frames: &mut FrameAllocator, vpn: VirtPageNum) -> KernelResult<PhysPageNum> {
        let pte = self
            .find_pte_mut(frames, vpn)
            .ok_or(KernelError::NotMapped(vpn))?;
        let ppn = pte.ppn();
        *pte = PageTableEntry::empty();
        Ok(ppn)
    }

    /// Replace the permission bits of an existing mapping
    pub fn set_flags(
        &mut self,
        frames: &mut FrameAllocator,
        vpn: VirtPageNum,
        flags: PTEFlags,
    ) -> KernelResult<()> {
        let pte = self
            .find_pte_mut(frames, vpn)
            .ok_or(KernelError::NotMapped(vpn))?;
        *pte = PageTableEntry::new(pte.ppn(), flags | PTEFlags::V);
        Ok(())
    }

    /// Look up the valid leaf entry for `vpn`. Never faults.
    pub fn translate(&self, frames: &FrameAllocator, vpn: VirtPageNum) -> Option<PageTableEntry> {
        let node = self.find_leaf_node(frames, vpn)?;
        let pte = frames.ptes(node).ok()?[vpn.indexes()[2]];
        pte.is_valid().then_some(pte)
    }

    pub fn translate_va(&self, frames: &FrameAllocator, va: VirtAddr) -> Option<PhysAddr> {
        self.translate(frames, va.floor()).map(|pte| {
            let base: PhysAddr = pte.ppn().into();
            PhysAddr(base.0 + va.page_offset())
        })
    }

    /// Return every node frame to the allocator. Leaf targets are untouched.
    pub fn release(self, frames: &mut FrameAllocator) -> KernelResult<()> {
        let mut result = Ok(());
        for node in self.frames {
            if let Err(err) = frames.release(node) {
                result = Err(err);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    #[test]
    fn pte_layout_is_bit_exact() {
        let pte = PageTableEntry::new(PhysPageNum(0x8_0123), PTEFlags::V | PTEFlags::R | PTEFlags::D);
        assert_eq!(pte.bits, (0x8_0123 << 10) | 0b1000_0011);
        assert_eq!(pte.ppn(), PhysPageNum(0x8_0123));
        assert!(pte.is_leaf() && pte.readable() && !pte.writable());
        assert_eq!(pte.bits >> 54, 0);
        assert_eq!((pte.bits >> 8) & 0b11, 0);
    }

    #[test]
    fn map_then_translate() {
        let mut frames = test_util::frames(8);
        let mut pt = PageTable::new(&mut frames).unwrap();
        let vpn = VirtPageNum(0x12345);
        let flags = PTEFlags::R | PTEFlags::W | PTEFlags::U;
        pt.map(&mut frames, vpn, PhysPageNum(0x80555), flags).unwrap();

        let pte = pt.translate(&frames, vpn).unwrap();
        assert_eq!(pte.ppn(), PhysPageNum(0x80555));
        assert_eq!(pte.flags(), flags | PTEFlags::V);
        assert_eq!(
            pt.translate_va(&frames, VirtAddr(0x1234_5678)),
            Some(PhysAddr(0x8055_5678))
        );
    }

    #[test]
    fn unmap_then_translate_is_none() {
        let mut frames = test_util::frames(8);
        let mut pt = PageTable::new(&mut frames).unwrap();
        let vpn = VirtPageNum(7);
        pt.map(&mut frames, vpn, PhysPageNum(0x80000), PTEFlags::R).unwrap();
        assert_eq!(pt.unmap(&mut frames, vpn), Ok(PhysPageNum(0x80000)));
        assert!(pt.translate(&frames, vpn).is_none());
        assert_eq!(pt.unmap(&mut frames, vpn), Err(KernelError::NotMapped(vpn)));
    }

    #[test]
    fn double_map_is_rejected() {
        let mut frames = test_util::frames(8);
        let mut pt = PageTable::new(&mut frames).unwrap();
        let vpn = VirtPageNum(1);
        pt.map(&mut frames, vpn, PhysPageNum(0x80000), PTEFlags::R).unwrap();
        assert_eq!(
            pt.map(&mut frames, vpn, PhysPageNum(0x80001), PTEFlags::R),
            Err(KernelError::AlreadyMapped(vpn))
        );
        assert_eq!(pt.translate(&frames, vpn).unwrap().ppn(), PhysPageNum(0x80000));
    }

    #[test]
    fn intermediate_levels_are_allocated_lazily() {
        let mut frames = test_util::frames(8);
        let mut pt = PageTable::new(&mut frames).unwrap();
        assert_eq!(pt.node_count(), 1);
        pt.map(&mut frames, VirtPageNum(0), PhysPageNum(0x80000), PTEFlags::R).unwrap();
        assert_eq!(pt.node_count(), 3);
        // Same level-0 node.
        pt.map(&mut frames, VirtPageNum(1), PhysPageNum(0x80001), PTEFlags::R).unwrap();
        assert_eq!(pt.node_count(), 3);
        // New level-1 and level-0 nodes under the same root entry.
        pt.map(&mut frames, VirtPageNum(1 << 9), PhysPageNum(0x80002), PTEFlags::R).unwrap();
        assert_eq!(pt.node_count(), 4);
    }

    #[test]
    fn release_returns_every_node() {
        let mut frames = test_util::frames(8);
        let before = frames.free_frames();
        let mut pt = PageTable::new(&mut frames).unwrap();
        pt.map(&mut frames, VirtPageNum(3), PhysPageNum(0x80000), PTEFlags::R).unwrap();
        pt.map(&mut frames, VirtPageNum(3 << 18), PhysPageNum(0x80000), PTEFlags::R).unwrap();
        pt.release(&mut frames).unwrap();
        assert_eq!(frames.free_frames(), before);
    }

    #[test]
    fn set_flags_keeps_the_target() {
        let mut frames = test_util::frames(8);
        let mut pt = PageTable::new(&mut frames).unwrap();
        let vpn = VirtPageNum(9);
        pt.map(&mut frames, vpn, PhysPageNum(0x80000), PTEFlags::R | PTEFlags::W).unwrap();
        pt.set_flags(&mut frames, vpn, PTEFlags::R).unwrap();
        let pte = pt.translate(&frames, vpn).unwrap();
        assert_eq!(pte.ppn(), PhysPageNum(0x80000));
        assert!(!pte.writable());
    }

    #[test]
    fn token_view_sees_the_same_mappings() {
        let mut frames = test_util::frames(8);
        let mut pt = PageTable::new(&mut frames).unwrap();
        pt.map(&mut frames, VirtPageNum(5), PhysPageNum(0x80000), PTEFlags::R).unwrap();
        let view = PageTable::from_token(pt.token());
        assert_eq!(pt.token() >> 60, 8);
        assert_eq!(view.root_ppn(), pt.root_ppn());
        assert_eq!(view.translate(&frames, VirtPageNum(5)).unwrap().ppn(), PhysPageNum(0x80000));
        assert_eq!(view.node_count(), 0);
    }

    #[test]
    fn out_of_frames_while_walking() {
        let mut frames = test_util::frames(2);
        let mut pt = PageTable::new(&mut frames).unwrap();
        assert_eq!(
            pt.map(&mut frames, VirtPageNum(0), PhysPageNum(0x80000), PTEFlags::R),
            Err(KernelError::OutOfMemory)
        );
    }
}
