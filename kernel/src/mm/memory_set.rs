//! Address spaces
//!
//! A [`MemorySet`] is a page table plus an ordered list of non-overlapping
//! [`MapArea`]s. Framed areas own their data frames; identity areas map
//! physical memory onto itself and own nothing.

use super::frame_allocator::{FrameAllocator, FrameTracker};
use super::page_table::{PTEFlags, PageTable, PageTableEntry};
use super::{PhysAddr, PhysPageNum, StepByOne, VPNRange, VirtAddr, VirtPageNum};
use crate::arch;
use crate::config::{PAGE_SIZE, TRAMPOLINE, TRAP_CONTEXT, USER_SPACE_END, USER_STACK_SIZE};
use crate::error::{KernelError, KernelResult};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use bitflags::bitflags;
use xmas_elf::{header, program, ElfFile};

/// Map type for memory area
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MapType {
    /// Virtual page `n` maps physical frame `n`
    Identity,
    /// Each page gets a freshly allocated frame
    Framed,
}

bitflags! {
    /// Map permission corresponding to that in pte: `R W X U`
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct MapPermission: u8 {
        /// Readable
        const R = 1 << 1;
        /// Writable
        const W = 1 << 2;
        /// Executable
        const X = 1 << 3;
        /// Accessible in U mode
        const U = 1 << 4;
    }
}

impl From<MapPermission> for PTEFlags {
    fn from(perm: MapPermission) -> Self {
        PTEFlags::from_bits_truncate(perm.bits())
    }
}

/// Map area structure, controls a contiguous piece of virtual memory
pub struct MapArea {
    vpn_range: VPNRange,
    data_frames: BTreeMap<VirtPageNum, FrameTracker>,
    map_type: MapType,
    map_perm: MapPermission,
}

impl MapArea {
    /// Cover every page touched by `[start_va, end_va)`
    pub fn new(
        start_va: VirtAddr,
        end_va: VirtAddr,
        map_type: MapType,
        map_perm: MapPermission,
    ) -> Self {
        let start_vpn = start_va.floor();
        let end_vpn = end_va.ceil().max(start_vpn);
        Self {
            vpn_range: VPNRange::new(start_vpn, end_vpn),
            data_frames: BTreeMap::new(),
            map_type,
            map_perm,
        }
    }

    /// Same range, type and permission; no frames
    pub fn from_another(another: &MapArea) -> Self {
        Self {
            vpn_range: another.vpn_range,
            data_frames: BTreeMap::new(),
            map_type: another.map_type,
            map_perm: another.map_perm,
        }
    }

    pub fn vpn_range(&self) -> VPNRange {
        self.vpn_range
    }

    pub fn map_type(&self) -> MapType {
        self.map_type
    }

    pub fn map_perm(&self) -> MapPermission {
        self.map_perm
    }

    pub fn frame_count(&self) -> usize {
        self.data_frames.len()
    }

    fn map_one(
        &mut self,
        page_table: &mut PageTable,
        frames: &mut FrameAllocator,
        vpn: VirtPageNum,
    ) -> KernelResult<()> {
        let pte_flags = PTEFlags::from(self.map_perm);
        match self.map_type {
            MapType::Identity => page_table.map(frames, vpn, PhysPageNum(vpn.0), pte_flags),
            MapType::Framed => {
                let frame = frames.alloc_tracked()?;
                if let Err(err) = page_table.map(frames, vpn, frame.ppn, pte_flags) {
                    frames.release(frame)?;
                    return Err(err);
                }
                self.data_frames.insert(vpn, frame);
                Ok(())
            }
        }
    }

    fn unmap_one(
        &mut self,
        page_table: &mut PageTable,
        frames: &mut FrameAllocator,
        vpn: VirtPageNum,
    ) -> KernelResult<()> {
        page_table.unmap(frames, vpn)?;
        if self.map_type == MapType::Framed {
            if let Some(frame) = self.data_frames.remove(&vpn) {
                frames.release(frame)?;
            }
        }
        Ok(())
    }

    /// Map every page; on failure the pages mapped so far are undone.
    pub fn map(&mut self, page_table: &mut PageTable, frames: &mut FrameAllocator) -> KernelResult<()> {
        for vpn in self.vpn_range {
            if let Err(err) = self.map_one(page_table, frames, vpn) {
                for done in VPNRange::new(self.vpn_range.get_start(), vpn) {
                    if let Err(undo) = self.unmap_one(page_table, frames, done) {
                        log::error!("rollback of {:?} failed: {}", done, undo);
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn unmap(&mut self, page_table: &mut PageTable, frames: &mut FrameAllocator) -> KernelResult<()> {
        for vpn in self.vpn_range {
            self.unmap_one(page_table, frames, vpn)?;
        }
        Ok(())
    }

    /// Grow the area up to `new_end`, mapping the new pages. Nothing changes
    /// on failure.
    pub fn append_to(
        &mut self,
        page_table: &mut PageTable,
        frames: &mut FrameAllocator,
        new_end: VirtPageNum,
    ) -> KernelResult<()> {
        let old_end = self.vpn_range.get_end();
        for vpn in VPNRange::new(old_end, new_end) {
            if let Err(err) = self.map_one(page_table, frames, vpn) {
                for done in VPNRange::new(old_end, vpn) {
                    if let Err(undo) = self.unmap_one(page_table, frames, done) {
                        log::error!("rollback of {:?} failed: {}", done, undo);
                    }
                }
                return Err(err);
            }
        }
        self.vpn_range = VPNRange::new(self.vpn_range.get_start(), new_end);
        Ok(())
    }

    /// Cut the area back to end at `new_end`, unmapping the tail
    pub fn shrink_to(
        &mut self,
        page_table: &mut PageTable,
        frames: &mut FrameAllocator,
        new_end: VirtPageNum,
    ) -> KernelResult<()> {
        for vpn in VPNRange::new(new_end, self.vpn_range.get_end()) {
            self.unmap_one(page_table, frames, vpn)?;
        }
        self.vpn_range = VPNRange::new(self.vpn_range.get_start(), new_end);
        Ok(())
    }

    /// Copy `data` into the area starting `offset` bytes into its first page.
    /// The area must already be mapped.
    pub fn copy_data(
        &self,
        page_table: &PageTable,
        frames: &mut FrameAllocator,
        data: &[u8],
        offset: usize,
    ) -> KernelResult<()> {
        let capacity = (self.vpn_range.get_end().0 - self.vpn_range.get_start().0) * PAGE_SIZE;
        if offset + data.len() > capacity {
            return Err(KernelError::InvalidArgument);
        }
        let mut start = 0;
        let mut page_offset = offset;
        let mut current_vpn = self.vpn_range.get_start();
        while start < data.len() {
            let len = (PAGE_SIZE - page_offset).min(data.len() - start);
            let ppn = page_table
                .translate(frames, current_vpn)
                .ok_or(KernelError::NotMapped(current_vpn))?
                .ppn();
            frames.frame_bytes_mut(ppn)?[page_offset..page_offset + len]
                .copy_from_slice(&data[start..start + len]);
            start += len;
            page_offset = 0;
            current_vpn.step();
        }
        Ok(())
    }
}

/// Addresses of the kernel image sections, normally taken from the linker
/// script
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KernelLayout {
    pub stext: usize,
    pub etext: usize,
    pub srodata: usize,
    pub erodata: usize,
    pub sdata: usize,
    pub edata: usize,
    pub sbss_with_stack: usize,
    pub ebss: usize,
    pub ekernel: usize,
    /// Physical address of the trampoline code page
    pub strampoline: usize,
    /// End of usable RAM
    pub memory_end: usize,
    /// Device windows: (base, length)
    pub mmio: &'static [(usize, usize)],
}

const EM_RISCV: u16 = 0xF3;

/// One loadable segment of a user program
#[derive(Clone, Debug)]
pub struct Segment<'a> {
    pub start_va: VirtAddr,
    /// Size in memory; the tail past `data` is zero-filled
    pub mem_len: usize,
    pub perm: MapPermission,
    pub data: &'a [u8],
}

/// A user program ready to be laid out in a fresh address space
#[derive(Clone, Debug)]
pub struct AppImage<'a> {
    pub entry: usize,
    pub segments: Vec<Segment<'a>>,
}

impl<'a> AppImage<'a> {
    /// Collect the `PT_LOAD` segments of an ELF64 executable
    pub fn from_elf(elf_data: &'a [u8]) -> KernelResult<Self> {
        let elf = ElfFile::new(elf_data).map_err(KernelError::InvalidElf)?;
        if !matches!(elf.header.pt1.class(), header::Class::SixtyFour) {
            return Err(KernelError::InvalidElf("not a 64-bit image"));
        }
        let machine = elf_data.get(18..20).map(|b| u16::from_le_bytes([b[0], b[1]]));
        if machine != Some(EM_RISCV) {
            return Err(KernelError::InvalidElf("not a RISC-V image"));
        }
        let mut segments = Vec::new();
        for i in 0..elf.header.pt2.ph_count() {
            let ph = elf.program_header(i).map_err(KernelError::InvalidElf)?;
            if ph.get_type().map_err(KernelError::InvalidElf)? != program::Type::Load {
                continue;
            }
            let offset = ph.offset() as usize;
            let file_size = ph.file_size() as usize;
            let mem_size = ph.mem_size() as usize;
            if file_size > mem_size {
                return Err(KernelError::InvalidElf("file size exceeds memory size"));
            }
            let start = ph.virtual_addr() as usize;
            if user_range_end(start, mem_size).is_none() {
                return Err(KernelError::InvalidElf("segment outside user space"));
            }
            let data = offset
                .checked_add(file_size)
                .and_then(|end| elf_data.get(offset..end))
                .ok_or(KernelError::InvalidElf("segment out of bounds"))?;
            let flags = ph.flags();
            let mut perm = MapPermission::U;
            if flags.is_read() {
                perm |= MapPermission::R;
            }
            if flags.is_write() {
                perm |= MapPermission::W;
            }
            if flags.is_execute() {
                perm |= MapPermission::X;
            }
            segments.push(Segment {
                start_va: VirtAddr::new(start),
                mem_len: mem_size,
                perm,
                data,
            });
        }
        if segments.is_empty() {
            return Err(KernelError::InvalidElf("no loadable segment"));
        }
        Ok(Self {
            entry: elf.header.pt2.entry_point() as usize,
            segments,
        })
    }
}

/// End of `[start, start + len)` if the whole range lies in the user half
pub fn user_range_end(start: usize, len: usize) -> Option<usize> {
    start.checked_add(len).filter(|&end| end <= USER_SPACE_END)
}

/// Memory set structure, controls virtual-memory space
pub struct MemorySet {
    page_table: PageTable,
    areas: Vec<MapArea>,
}

impl MemorySet {
    pub fn new_bare(frames: &mut FrameAllocator) -> KernelResult<Self> {
        Ok(Self {
            page_table: PageTable::new(frames)?,
            areas: Vec::new(),
        })
    }

    pub fn token(&self) -> usize {
        self.page_table.token()
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub fn areas(&self) -> &[MapArea] {
        &self.areas
    }

    /// Map `area` and add it to the set, then copy `data` in at `offset`.
    /// An area without pages is not kept.
    pub fn insert_area(
        &mut self,
        frames: &mut FrameAllocator,
        mut area: MapArea,
        data: Option<(&[u8], usize)>,
    ) -> KernelResult<()> {
        if area.vpn_range.is_empty() {
            return match data {
                Some((data, _)) if !data.is_empty() => Err(KernelError::InvalidArgument),
                _ => Ok(()),
            };
        }
        if self
            .areas
            .iter()
            .any(|a| a.vpn_range.overlaps(&area.vpn_range))
        {
            log::warn!("area {:?} overlaps an existing one", area.vpn_range);
            return Err(KernelError::OverlappingMapping);
        }
        area.map(&mut self.page_table, frames)?;
        if let Some((data, offset)) = data {
            if let Err(err) = area.copy_data(&self.page_table, frames, data, offset) {
                area.unmap(&mut self.page_table, frames)?;
                return Err(err);
            }
        }
        self.areas.push(area);
        Ok(())
    }

    /// Assume that no conflicts.
    pub fn insert_framed_area(
        &mut self,
        frames: &mut FrameAllocator,
        start_va: VirtAddr,
        end_va: VirtAddr,
        permission: MapPermission,
    ) -> KernelResult<()> {
        self.insert_area(
            frames,
            MapArea::new(start_va, end_va, MapType::Framed, permission),
            None,
        )
    }

    /// Unmap and drop the area beginning at `start_vpn`
    pub fn remove_area_with_start_vpn(
        &mut self,
        frames: &mut FrameAllocator,
        start_vpn: VirtPageNum,
    ) -> KernelResult<()> {
        let idx = self
            .areas
            .iter()
            .position(|area| area.vpn_range.get_start() == start_vpn)
            .ok_or(KernelError::NotMapped(start_vpn))?;
        let mut area = self.areas.remove(idx);
        area.unmap(&mut self.page_table, frames)
    }

    /// Remove the area covering exactly `[start_vpn, end_vpn)`
    pub fn remove_area(
        &mut self,
        frames: &mut FrameAllocator,
        start_vpn: VirtPageNum,
        end_vpn: VirtPageNum,
    ) -> KernelResult<()> {
        match self
            .areas
            .iter()
            .find(|area| area.vpn_range.get_start() == start_vpn)
        {
            Some(area) if area.vpn_range.get_end() == end_vpn => {
                self.remove_area_with_start_vpn(frames, start_vpn)
            }
            _ => Err(KernelError::NotMapped(start_vpn)),
        }
    }

    /// Move the end of the area starting at `start_vpn` to `new_end`,
    /// mapping or unmapping pages as needed. The area is created when it
    /// does not exist yet and dropped once it is empty.
    pub fn resize_area(
        &mut self,
        frames: &mut FrameAllocator,
        start_vpn: VirtPageNum,
        new_end: VirtPageNum,
        perm: MapPermission,
    ) -> KernelResult<()> {
        if new_end < start_vpn {
            return Err(KernelError::InvalidArgument);
        }
        let Some(idx) = self
            .areas
            .iter()
            .position(|area| area.vpn_range.get_start() == start_vpn)
        else {
            return self.insert_area(
                frames,
                MapArea::new(start_vpn.into(), new_end.into(), MapType::Framed, perm),
                None,
            );
        };
        let old_end = self.areas[idx].vpn_range.get_end();
        if new_end > old_end {
            let grown = VPNRange::new(old_end, new_end);
            if self.areas.iter().any(|area| area.vpn_range.overlaps(&grown)) {
                log::warn!("growing {:?} to {:?} overlaps another area", start_vpn, new_end);
                return Err(KernelError::OverlappingMapping);
            }
            self.areas[idx].append_to(&mut self.page_table, frames, new_end)
        } else if new_end == start_vpn {
            self.remove_area_with_start_vpn(frames, start_vpn)
        } else {
            self.areas[idx].shrink_to(&mut self.page_table, frames, new_end)
        }
    }

    /// Mention that trampoline is not collected by areas.
    fn map_trampoline(&mut self, frames: &mut FrameAllocator, layout: &KernelLayout) -> KernelResult<()> {
        self.page_table.map(
            frames,
            VirtAddr::new(TRAMPOLINE).floor(),
            PhysAddr::new(layout.strampoline).floor(),
            PTEFlags::R | PTEFlags::X,
        )
    }

    /// Without kernel stacks.
    pub fn new_kernel(frames: &mut FrameAllocator, layout: &KernelLayout) -> KernelResult<Self> {
        let mut memory_set = Self::new_bare(frames)?;
        if let Err(err) = memory_set.populate_kernel(frames, layout) {
            memory_set.release_on_error(frames);
            return Err(err);
        }
        Ok(memory_set)
    }

    fn populate_kernel(&mut self, frames: &mut FrameAllocator, layout: &KernelLayout) -> KernelResult<()> {
        self.map_trampoline(frames, layout)?;
        log::info!(".text [{:#x}, {:#x})", layout.stext, layout.etext);
        log::info!(".rodata [{:#x}, {:#x})", layout.srodata, layout.erodata);
        log::info!(".data [{:#x}, {:#x})", layout.sdata, layout.edata);
        log::info!(".bss [{:#x}, {:#x})", layout.sbss_with_stack, layout.ebss);
        let sections = [
            (layout.stext, layout.etext, MapPermission::R | MapPermission::X),
            (layout.srodata, layout.erodata, MapPermission::R),
            (layout.sdata, layout.edata, MapPermission::R | MapPermission::W),
            (layout.sbss_with_stack, layout.ebss, MapPermission::R | MapPermission::W),
            (layout.ekernel, layout.memory_end, MapPermission::R | MapPermission::W),
        ];
        for (start, end, perm) in sections {
            self.insert_identity(frames, start, end, perm)?;
        }
        for &(base, len) in layout.mmio {
            self.insert_identity(frames, base, base + len, MapPermission::R | MapPermission::W)?;
        }
        Ok(())
    }

    fn insert_identity(
        &mut self,
        frames: &mut FrameAllocator,
        start: usize,
        end: usize,
        perm: MapPermission,
    ) -> KernelResult<()> {
        if start >= end {
            return Ok(());
        }
        self.insert_area(
            frames,
            MapArea::new(start.into(), end.into(), MapType::Identity, perm),
            None,
        )
    }

    /// Lay out a user program: its segments, a guard page, the user stack,
    /// the trap context page and the trampoline.
    /// Returns the set, the user stack top and the entry point.
    pub fn new_app(
        frames: &mut FrameAllocator,
        layout: &KernelLayout,
        image: &AppImage,
    ) -> KernelResult<(Self, usize, usize)> {
        let mut memory_set = Self::new_bare(frames)?;
        match memory_set.populate_app(frames, layout, image) {
            Ok(user_stack_top) => Ok((memory_set, user_stack_top, image.entry)),
            Err(err) => {
                memory_set.release_on_error(frames);
                Err(err)
            }
        }
    }

    fn populate_app(
        &mut self,
        frames: &mut FrameAllocator,
        layout: &KernelLayout,
        image: &AppImage,
    ) -> KernelResult<usize> {
        self.map_trampoline(frames, layout)?;
        let mut max_end_vpn = VirtPageNum(0);
        for segment in &image.segments {
            if segment.data.len() > segment.mem_len {
                return Err(KernelError::InvalidArgument);
            }
            let end = user_range_end(segment.start_va.0, segment.mem_len)
                .ok_or(KernelError::InvalidArgument)?;
            let end_va = VirtAddr::new(end);
            let area = MapArea::new(
                segment.start_va,
                end_va,
                MapType::Framed,
                segment.perm | MapPermission::U,
            );
            max_end_vpn = max_end_vpn.max(area.vpn_range.get_end());
            self.insert_area(frames, area, Some((segment.data, segment.start_va.page_offset())))?;
        }
        let max_end_va: VirtAddr = max_end_vpn.into();
        // guard page
        let user_stack_bottom = max_end_va.0 + PAGE_SIZE;
        let user_stack_top = user_stack_bottom + USER_STACK_SIZE;
        if user_stack_top > USER_SPACE_END {
            return Err(KernelError::InvalidArgument);
        }
        self.insert_framed_area(
            frames,
            user_stack_bottom.into(),
            user_stack_top.into(),
            MapPermission::R | MapPermission::W | MapPermission::U,
        )?;
        self.insert_framed_area(
            frames,
            TRAP_CONTEXT.into(),
            TRAMPOLINE.into(),
            MapPermission::R | MapPermission::W,
        )?;
        Ok(user_stack_top)
    }

    /// Parse an ELF executable and lay it out with [`MemorySet::new_app`]
    pub fn from_elf(
        frames: &mut FrameAllocator,
        layout: &KernelLayout,
        elf_data: &[u8],
    ) -> KernelResult<(Self, usize, usize)> {
        let image = AppImage::from_elf(elf_data)?;
        Self::new_app(frames, layout, &image)
    }

    /// Deep copy of a user space: every framed page gets a new frame with
    /// the same contents.
    pub fn from_existing_user(
        frames: &mut FrameAllocator,
        layout: &KernelLayout,
        user_space: &MemorySet,
    ) -> KernelResult<Self> {
        let mut memory_set = Self::new_bare(frames)?;
        if let Err(err) = memory_set.copy_user(frames, layout, user_space) {
            memory_set.release_on_error(frames);
            return Err(err);
        }
        Ok(memory_set)
    }

    fn copy_user(
        &mut self,
        frames: &mut FrameAllocator,
        layout: &KernelLayout,
        user_space: &MemorySet,
    ) -> KernelResult<()> {
        self.map_trampoline(frames, layout)?;
        for area in user_space.areas.iter() {
            self.insert_area(frames, MapArea::from_another(area), None)?;
            if area.map_type == MapType::Identity {
                continue;
            }
            for vpn in area.vpn_range {
                let src_ppn = user_space
                    .translate(frames, vpn)
                    .ok_or(KernelError::NotMapped(vpn))?
                    .ppn();
                let dst_ppn = self
                    .translate(frames, vpn)
                    .ok_or(KernelError::NotMapped(vpn))?
                    .ppn();
                frames.copy_frame(src_ppn, dst_ppn)?;
            }
        }
        Ok(())
    }

    /// Install this table as the active translation root
    pub fn activate(&self) {
        arch::activate_root(self.token());
    }

    pub fn translate(&self, frames: &FrameAllocator, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.page_table.translate(frames, vpn)
    }

    pub fn translate_to_phys(&self, frames: &FrameAllocator, va: VirtAddr) -> Option<PhysAddr> {
        self.page_table.translate_va(frames, va)
    }

    /// Split the user range `[va, va + len)` into physical pieces, one per
    /// page. Every page must be mapped user-accessible, and writable when
    /// `write` is set.
    pub fn translated_byte_buffer(
        &self,
        frames: &FrameAllocator,
        va: usize,
        len: usize,
        write: bool,
    ) -> KernelResult<Vec<(PhysAddr, usize)>> {
        let mut chunks = Vec::new();
        let mut start = va;
        let end = user_range_end(va, len).ok_or(KernelError::InvalidAddress(VirtAddr(va)))?;
        while start < end {
            let start_va = VirtAddr::new(start);
            let pte = self
                .translate(frames, start_va.floor())
                .filter(|pte| pte.user() && (!write || pte.writable()))
                .ok_or(KernelError::InvalidAddress(start_va))?;
            let chunk = (PAGE_SIZE - start_va.page_offset()).min(end - start);
            let base: PhysAddr = pte.ppn().into();
            chunks.push((PhysAddr(base.0 + start_va.page_offset()), chunk));
            start += chunk;
        }
        Ok(chunks)
    }

    /// Read user memory at `va` into `buf`
    pub fn copy_from_user(&self, frames: &FrameAllocator, va: usize, buf: &mut [u8]) -> KernelResult<()> {
        let mut copied = 0;
        for (pa, len) in self.translated_byte_buffer(frames, va, buf.len(), false)? {
            let offset = pa.page_offset();
            buf[copied..copied + len].copy_from_slice(&frames.frame_bytes(pa.floor())?[offset..offset + len]);
            copied += len;
        }
        Ok(())
    }

    /// Write `data` into user memory at `va`
    pub fn copy_to_user(&self, frames: &mut FrameAllocator, va: usize, data: &[u8]) -> KernelResult<()> {
        let mut copied = 0;
        for (pa, len) in self.translated_byte_buffer(frames, va, data.len(), true)? {
            let offset = pa.page_offset();
            frames.frame_bytes_mut(pa.floor())?[offset..offset + len]
                .copy_from_slice(&data[copied..copied + len]);
            copied += len;
        }
        Ok(())
    }

    /// Tear the set down: data frames first, then table nodes
    pub fn release(self, frames: &mut FrameAllocator) -> KernelResult<()> {
        let mut result = Ok(());
        for area in self.areas {
            for (_, frame) in area.data_frames {
                if let Err(err) = frames.release(frame) {
                    result = Err(err);
                }
            }
        }
        self.page_table.release(frames).and(result)
    }

    fn release_on_error(&mut self, frames: &mut FrameAllocator) {
        let partial = core::mem::replace(
            self,
            Self {
                page_table: PageTable::from_token(0),
                areas: Vec::new(),
            },
        );
        if let Err(err) = partial.release(frames) {
            log::error!("releasing a half-built address space: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    fn rw_user() -> MapPermission {
        MapPermission::R | MapPermission::W | MapPermission::U
    }

    #[test]
    fn overlapping_areas_are_rejected() {
        let mut frames = test_util::frames(16);
        let mut ms = MemorySet::new_bare(&mut frames).unwrap();
        ms.insert_framed_area(&mut frames, 0x1000.into(), 0x3000.into(), rw_user())
            .unwrap();
        let free = frames.free_frames();
        assert_eq!(
            ms.insert_framed_area(&mut frames, 0x2000.into(), 0x4000.into(), rw_user()),
            Err(KernelError::OverlappingMapping)
        );
        assert_eq!(frames.free_frames(), free);
        ms.insert_framed_area(&mut frames, 0x3000.into(), 0x4000.into(), rw_user())
            .unwrap();
        assert_eq!(ms.areas().len(), 2);
    }

    #[test]
    fn disjoint_areas_succeed_until_frames_run_out() {
        let mut frames = test_util::frames(8);
        let mut ms = MemorySet::new_bare(&mut frames).unwrap();
        let mut inserted = 0;
        let err = loop {
            let start = 0x10_0000 + inserted * 0x2000;
            match ms.insert_framed_area(&mut frames, start.into(), (start + PAGE_SIZE).into(), rw_user()) {
                Ok(()) => inserted += 1,
                Err(err) => break err,
            }
        };
        assert_eq!(err, KernelError::OutOfMemory);
        assert!(inserted > 0);
        assert_eq!(ms.areas().len(), inserted);
    }

    #[test]
    fn failed_map_rolls_back() {
        let mut frames = test_util::frames(5);
        let mut ms = MemorySet::new_bare(&mut frames).unwrap();
        let free = frames.free_frames();
        // Needs two table nodes plus four data frames.
        let err = ms.insert_framed_area(&mut frames, 0x1000.into(), 0x5000.into(), rw_user());
        assert_eq!(err, Err(KernelError::OutOfMemory));
        assert!(ms.areas().is_empty());
        assert!(ms.translate(&frames, VirtPageNum(1)).is_none());
        // Only the intermediate nodes stay with the table.
        assert_eq!(frames.free_frames(), free - 2);
    }

    #[test]
    fn remove_area_returns_its_frames() {
        let mut frames = test_util::frames(16);
        let mut ms = MemorySet::new_bare(&mut frames).unwrap();
        ms.insert_framed_area(&mut frames, 0x1000.into(), 0x4000.into(), rw_user())
            .unwrap();
        let free = frames.free_frames();
        assert_eq!(
            ms.remove_area(&mut frames, VirtPageNum(1), VirtPageNum(3)),
            Err(KernelError::NotMapped(VirtPageNum(1)))
        );
        ms.remove_area(&mut frames, VirtPageNum(1), VirtPageNum(4)).unwrap();
        assert_eq!(frames.free_frames(), free + 3);
        assert!(ms.translate(&frames, VirtPageNum(2)).is_none());
    }

    #[test]
    fn kernel_space_is_identity_mapped_without_user_bit() {
        let mut frames = test_util::frames(64);
        let layout = test_util::layout(&frames);
        let ks = MemorySet::new_kernel(&mut frames, &layout).unwrap();

        let text = ks.translate(&frames, VirtAddr::new(layout.stext).floor()).unwrap();
        assert_eq!(text.ppn(), PhysAddr::new(layout.stext).floor());
        assert!(text.executable() && !text.writable() && !text.user());

        let rodata = ks.translate(&frames, VirtAddr::new(layout.srodata).floor()).unwrap();
        assert!(rodata.readable() && !rodata.writable() && !rodata.executable());

        let uart = ks.translate(&frames, VirtAddr::new(0x1000_0000).floor()).unwrap();
        assert!(uart.writable() && !uart.user());

        let tramp = ks.translate(&frames, VirtAddr::new(TRAMPOLINE).floor()).unwrap();
        assert_eq!(tramp.ppn(), PhysAddr::new(layout.strampoline).floor());
    }

    #[test]
    fn app_space_layout() {
        let mut frames = test_util::frames(64);
        let layout = test_util::layout(&frames);
        let code = [0x13u8, 0, 0, 0];
        let image = AppImage {
            entry: 0x1_0000,
            segments: alloc::vec![Segment {
                start_va: VirtAddr::new(0x1_0000),
                mem_len: 0x1800,
                perm: MapPermission::R | MapPermission::X,
                data: &code,
            }],
        };
        let (ms, user_sp, entry) = MemorySet::new_app(&mut frames, &layout, &image).unwrap();
        assert_eq!(entry, 0x1_0000);
        // two code pages, one guard page, then the stack
        assert_eq!(user_sp, 0x1_2000 + PAGE_SIZE + USER_STACK_SIZE);

        let text = ms.translate(&frames, VirtPageNum(0x10)).unwrap();
        assert!(text.user() && text.executable() && !text.writable());
        assert!(ms.translate(&frames, VirtPageNum(0x12)).is_none());
        let stack = ms.translate(&frames, VirtAddr::new(user_sp - 1).floor()).unwrap();
        assert!(stack.user() && stack.writable());

        let trap_cx = ms.translate(&frames, VirtAddr::new(TRAP_CONTEXT).floor()).unwrap();
        assert!(!trap_cx.user() && trap_cx.writable());
        let tramp = ms.translate(&frames, VirtAddr::new(TRAMPOLINE).floor()).unwrap();
        assert_eq!(tramp.ppn(), PhysAddr::new(layout.strampoline).floor());
        assert!(!frames.is_allocated(tramp.ppn()));

        let mut word = [0u8; 4];
        ms.copy_from_user(&frames, 0x1_0000, &mut word).unwrap();
        assert_eq!(word, code);
    }

    #[test]
    fn segment_data_lands_at_its_page_offset() {
        let mut frames = test_util::frames(64);
        let layout = test_util::layout(&frames);
        let data = [0xaau8; 0x20];
        let image = AppImage {
            entry: 0x1_0ff0,
            segments: alloc::vec![Segment {
                start_va: VirtAddr::new(0x1_0ff0),
                mem_len: 0x20,
                perm: MapPermission::R,
                data: &data,
            }],
        };
        let (ms, _, _) = MemorySet::new_app(&mut frames, &layout, &image).unwrap();
        let mut buf = [0u8; 0x30];
        ms.copy_from_user(&frames, 0x1_0fe0, &mut buf).unwrap();
        assert!(buf[..0x10].iter().all(|b| *b == 0));
        assert!(buf[0x10..].iter().all(|b| *b == 0xaa));
    }

    #[test]
    fn user_copies_cross_page_boundaries() {
        let mut frames = test_util::frames(16);
        let mut ms = MemorySet::new_bare(&mut frames).unwrap();
        ms.insert_framed_area(&mut frames, 0x1000.into(), 0x3000.into(), rw_user())
            .unwrap();
        let message = b"across the boundary";
        ms.copy_to_user(&mut frames, 0x1ff8, message).unwrap();

        let chunks = ms.translated_byte_buffer(&frames, 0x1ff8, message.len(), false).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].1, 8);
        assert_eq!(chunks[1].1, message.len() - 8);

        let mut back = [0u8; 19];
        ms.copy_from_user(&frames, 0x1ff8, &mut back).unwrap();
        assert_eq!(&back, message);
    }

    #[test]
    fn user_copies_reject_unmapped_or_protected_pages() {
        let mut frames = test_util::frames(16);
        let mut ms = MemorySet::new_bare(&mut frames).unwrap();
        ms.insert_framed_area(&mut frames, 0x1000.into(), 0x2000.into(), rw_user())
            .unwrap();
        ms.insert_framed_area(
            &mut frames,
            0x2000.into(),
            0x3000.into(),
            MapPermission::R | MapPermission::U,
        )
        .unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(
            ms.copy_from_user(&frames, 0x2ff8, &mut buf),
            Err(KernelError::InvalidAddress(VirtAddr::new(0x3000)))
        );
        assert_eq!(
            ms.copy_to_user(&mut frames, 0x1ff8, &buf),
            Err(KernelError::InvalidAddress(VirtAddr::new(0x2000)))
        );
        ms.copy_from_user(&frames, 0x1ff8, &mut buf).unwrap();
    }

    #[test]
    fn fork_copies_are_independent() {
        let mut frames = test_util::frames(64);
        let layout = test_util::layout(&frames);
        let data = [1u8; 16];
        let image = AppImage {
            entry: 0x1_0000,
            segments: alloc::vec![Segment {
                start_va: VirtAddr::new(0x1_0000),
                mem_len: PAGE_SIZE,
                perm: MapPermission::R | MapPermission::W,
                data: &data,
            }],
        };
        let (parent, _, _) = MemorySet::new_app(&mut frames, &layout, &image).unwrap();
        let child = MemorySet::from_existing_user(&mut frames, &layout, &parent).unwrap();

        let p = parent.translate(&frames, VirtPageNum(0x10)).unwrap().ppn();
        let c = child.translate(&frames, VirtPageNum(0x10)).unwrap().ppn();
        assert_ne!(p, c);

        parent.copy_to_user(&mut frames, 0x1_0000, &[9]).unwrap();
        let mut byte = [0u8];
        child.copy_from_user(&frames, 0x1_0000, &mut byte).unwrap();
        assert_eq!(byte, [1]);

        let tramp_p = parent.translate(&frames, VirtAddr::new(TRAMPOLINE).floor()).unwrap();
        let tramp_c = child.translate(&frames, VirtAddr::new(TRAMPOLINE).floor()).unwrap();
        assert_eq!(tramp_p.ppn(), tramp_c.ppn());
    }

    #[test]
    fn release_returns_everything() {
        let mut frames = test_util::frames(64);
        let layout = test_util::layout(&frames);
        let free = frames.free_frames();
        let image = test_util::app_image(&[]);
        let (ms, _, _) = MemorySet::new_app(&mut frames, &layout, &image).unwrap();
        assert!(frames.free_frames() < free);
        ms.release(&mut frames).unwrap();
        assert_eq!(frames.free_frames(), free);
    }

    #[test]
    fn failed_app_build_releases_partial_space() {
        let mut frames = test_util::frames(6);
        let layout = test_util::layout(&frames);
        let image = test_util::app_image(&[]);
        assert_eq!(
            MemorySet::new_app(&mut frames, &layout, &image).err(),
            Some(KernelError::OutOfMemory)
        );
        assert_eq!(frames.free_frames(), frames.total_frames());
    }

    #[test]
    fn elf_images_are_loaded() {
        let mut frames = test_util::frames(64);
        let layout = test_util::layout(&frames);
        let elf = test_util::ElfImage::new(0x1_0000, &[0x13, 0, 0, 0, 0x73, 0, 0, 0]);
        let (ms, _, entry) = MemorySet::from_elf(&mut frames, &layout, elf.bytes()).unwrap();
        assert_eq!(entry, 0x1_0000);
        let pte = ms.translate(&frames, VirtPageNum(0x10)).unwrap();
        assert!(pte.user() && pte.executable() && pte.readable());
        let mut insn = [0u8; 8];
        ms.copy_from_user(&frames, 0x1_0000, &mut insn).unwrap();
        assert_eq!(insn[4], 0x73);
    }

    #[test]
    fn segments_must_fit_in_the_user_half() {
        let mut frames = test_util::frames(64);
        let layout = test_util::layout(&frames);
        let free = frames.free_frames();
        let cases = [
            (0x1_0000, usize::MAX),
            (USER_SPACE_END - PAGE_SIZE, 2 * PAGE_SIZE),
            // The segment fits but the stack above it would not.
            (USER_SPACE_END - PAGE_SIZE, PAGE_SIZE),
        ];
        for (start, mem_len) in cases {
            let image = AppImage {
                entry: start,
                segments: alloc::vec![Segment {
                    start_va: VirtAddr::new(start),
                    mem_len,
                    perm: MapPermission::R,
                    data: &[],
                }],
            };
            assert_eq!(
                MemorySet::new_app(&mut frames, &layout, &image).err(),
                Some(KernelError::InvalidArgument)
            );
            assert_eq!(frames.free_frames(), free);
        }
        let elf = test_util::ElfImage::new(USER_SPACE_END - 4, &[0x13, 0, 0, 0, 0x73, 0, 0, 0]);
        assert_eq!(
            MemorySet::from_elf(&mut frames, &layout, elf.bytes()).err(),
            Some(KernelError::InvalidElf("segment outside user space"))
        );
    }

    #[test]
    fn user_pointers_must_stay_in_the_user_half() {
        let mut frames = test_util::frames(16);
        let mut ms = MemorySet::new_bare(&mut frames).unwrap();
        ms.insert_framed_area(&mut frames, 0x1000.into(), 0x2000.into(), rw_user())
            .unwrap();
        let mut buf = [0u8; 4];
        ms.copy_from_user(&frames, 0x1000, &mut buf).unwrap();
        // Would alias 0x1000 once cut down to 39 bits.
        let alias = (1 << 39) + 0x1000;
        assert_eq!(
            ms.copy_from_user(&frames, alias, &mut buf),
            Err(KernelError::InvalidAddress(VirtAddr(alias)))
        );
        assert!(ms.translated_byte_buffer(&frames, USER_SPACE_END - 2, 4, false).is_err());
    }

    #[test]
    fn empty_areas_are_not_kept() {
        let mut frames = test_util::frames(16);
        let mut ms = MemorySet::new_bare(&mut frames).unwrap();
        for _ in 0..3 {
            ms.insert_framed_area(&mut frames, 0x5000.into(), 0x5000.into(), rw_user())
                .unwrap();
        }
        assert!(ms.areas().is_empty());
    }

    #[test]
    fn resized_area_grows_shrinks_and_vanishes() {
        let mut frames = test_util::frames(32);
        let mut ms = MemorySet::new_bare(&mut frames).unwrap();
        let start = VirtPageNum(0x10);
        ms.resize_area(&mut frames, start, VirtPageNum(0x12), rw_user()).unwrap();
        assert_eq!(ms.areas().len(), 1);
        let free = frames.free_frames();

        ms.resize_area(&mut frames, start, VirtPageNum(0x15), rw_user()).unwrap();
        assert_eq!(frames.free_frames(), free - 3);
        assert!(ms.translate(&frames, VirtPageNum(0x14)).is_some());

        ms.resize_area(&mut frames, start, VirtPageNum(0x11), rw_user()).unwrap();
        assert_eq!(frames.free_frames(), free + 1);
        assert!(ms.translate(&frames, VirtPageNum(0x11)).is_none());
        assert_eq!(ms.areas()[0].vpn_range().get_end(), VirtPageNum(0x11));

        ms.resize_area(&mut frames, start, start, rw_user()).unwrap();
        assert!(ms.areas().is_empty());
    }

    #[test]
    fn resized_area_stops_at_its_neighbour() {
        let mut frames = test_util::frames(32);
        let mut ms = MemorySet::new_bare(&mut frames).unwrap();
        ms.insert_framed_area(&mut frames, 0x13000.into(), 0x14000.into(), rw_user())
            .unwrap();
        let start = VirtPageNum(0x10);
        ms.resize_area(&mut frames, start, VirtPageNum(0x11), rw_user()).unwrap();
        let free = frames.free_frames();
        assert_eq!(
            ms.resize_area(&mut frames, start, VirtPageNum(0x14), rw_user()),
            Err(KernelError::OverlappingMapping)
        );
        assert_eq!(frames.free_frames(), free);
        assert_eq!(ms.areas()[1].vpn_range().get_end(), VirtPageNum(0x11));
    }

    #[test]
    fn garbage_is_not_an_elf() {
        let mut frames = test_util::frames(16);
        let layout = test_util::layout(&frames);
        let bytes = [0u8; 128];
        assert!(matches!(
            MemorySet::from_elf(&mut frames, &layout, &bytes).err(),
            Some(KernelError::InvalidElf(_))
        ));
        assert_eq!(frames.free_frames(), frames.total_frames());
    }
}
