//! Memory mapping system calls
//!
//! Anonymous, eagerly backed mappings in the caller's address space.

use super::{caller, into_ret};
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::config::PAGE_SIZE;
use crate::mm::{user_range_end, MapPermission, VirtAddr};
use crate::task::Pid;

/// Protection bits of `prot`
pub const PROT_READ: usize = 0x1;
pub const PROT_WRITE: usize = 0x2;
pub const PROT_EXEC: usize = 0x4;

const PROT_MASK: usize = PROT_READ | PROT_WRITE | PROT_EXEC;

impl Kernel {
    /// Map `[start, start + len)` into `pid`'s space with the permissions in
    /// `prot`. `start` must be page aligned, the range non-empty and inside
    /// the user half, `prot` non-empty and free of unknown bits, and no page
    /// of the range may already be mapped.
    pub fn mmap(&mut self, pid: Pid, start: usize, len: usize, prot: usize) -> KernelResult<()> {
        if start % PAGE_SIZE != 0 || len == 0 || prot & !PROT_MASK != 0 || prot & PROT_MASK == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let end = user_range_end(start, len).ok_or(KernelError::InvalidArgument)?;
        let start_va = VirtAddr::new(start);
        let perm = MapPermission::from_bits_truncate((prot as u8) << 1) | MapPermission::U;
        let task = self.tasks.get_mut(pid).ok_or(KernelError::NoSuchTask(pid))?;
        task.memory_set
            .insert_framed_area(&mut self.frames, start_va, VirtAddr::new(end), perm)?;
        log::debug!("task {} mapped [{:#x}, {:#x}) {:?}", pid, start, end, perm);
        Ok(())
    }

    /// Undo an earlier [`Kernel::mmap`] of exactly `[start, start + len)`
    pub fn munmap(&mut self, pid: Pid, start: usize, len: usize) -> KernelResult<()> {
        if start % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let end = user_range_end(start, len).ok_or(KernelError::InvalidArgument)?;
        let start_va = VirtAddr::new(start);
        let task = self.tasks.get_mut(pid).ok_or(KernelError::NoSuchTask(pid))?;
        task.memory_set
            .remove_area(&mut self.frames, start_va.floor(), VirtAddr::new(end).ceil())?;
        log::debug!("task {} unmapped [{:#x}, {:#x})", pid, start, end);
        Ok(())
    }
}

pub fn sys_mmap(kernel: &mut Kernel, start: usize, len: usize, prot: usize) -> isize {
    let result = caller(kernel).and_then(|pid| kernel.mmap(pid, start, len, prot));
    into_ret("mmap", result.map(|_| 0))
}

pub fn sys_munmap(kernel: &mut Kernel, start: usize, len: usize) -> isize {
    let result = caller(kernel).and_then(|pid| kernel.munmap(pid, start, len));
    into_ret("munmap", result.map(|_| 0))
}

/// Grow or shrink the caller's heap by `size` bytes; returns the old break
pub fn sys_sbrk(kernel: &mut Kernel, size: i32) -> isize {
    let result = caller(kernel).and_then(|pid| kernel.change_program_brk(pid, size as isize));
    into_ret("sbrk", result.map(|old_brk| old_brk as isize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::USER_SPACE_END;
    use crate::mm::VirtPageNum;
    use crate::test_util;

    const BASE: usize = 0x1000_0000;

    #[test]
    fn mapped_pages_are_user_accessible() {
        let mut kernel = test_util::kernel(128);
        let pid = kernel.spawn(&test_util::app_image(&[])).unwrap();
        kernel.mmap(pid, BASE, 2 * PAGE_SIZE, PROT_READ | PROT_WRITE).unwrap();
        let space = &kernel.task(pid).unwrap().memory_set;
        let pte = space.translate(kernel.frames(), VirtPageNum(BASE / PAGE_SIZE + 1)).unwrap();
        assert!(pte.user() && pte.readable() && pte.writable() && !pte.executable());
        kernel.copy_to_user(pid, BASE + PAGE_SIZE - 2, &[1, 2, 3, 4]).unwrap();
    }

    #[test]
    fn bad_arguments_are_rejected() {
        let mut kernel = test_util::kernel(128);
        let pid = kernel.spawn(&test_util::app_image(&[])).unwrap();
        let invalid = Err(KernelError::InvalidArgument);
        assert_eq!(kernel.mmap(pid, BASE + 1, PAGE_SIZE, PROT_READ), invalid);
        assert_eq!(kernel.mmap(pid, BASE, PAGE_SIZE, 0), invalid);
        assert_eq!(kernel.mmap(pid, BASE, PAGE_SIZE, 0x8 | PROT_READ), invalid);
        kernel.mmap(pid, BASE, PAGE_SIZE, PROT_READ).unwrap();
        assert_eq!(
            kernel.mmap(pid, BASE, PAGE_SIZE, PROT_READ),
            Err(KernelError::OverlappingMapping)
        );
    }

    #[test]
    fn ranges_outside_the_user_half_are_rejected() {
        let mut kernel = test_util::kernel(128);
        let pid = kernel.spawn(&test_util::app_image(&[])).unwrap();
        let areas = kernel.task(pid).unwrap().memory_set.areas().len();
        let invalid = Err(KernelError::InvalidArgument);
        let rw = PROT_READ | PROT_WRITE;
        assert_eq!(kernel.mmap(pid, (1 << 39) - 5 * PAGE_SIZE, 7 * PAGE_SIZE, rw), invalid);
        assert_eq!(kernel.mmap(pid, (1 << 39) + 0x20_0000, PAGE_SIZE, rw), invalid);
        assert_eq!(kernel.mmap(pid, USER_SPACE_END - PAGE_SIZE, 2 * PAGE_SIZE, rw), invalid);
        assert_eq!(kernel.mmap(pid, BASE, 0, rw), invalid);
        assert_eq!(kernel.task(pid).unwrap().memory_set.areas().len(), areas);
        let mut buf = [0u8; 4];
        assert!(kernel.copy_from_user(pid, (1 << 39) + 0x1_0000, &mut buf).is_err());

        kernel.mmap(pid, USER_SPACE_END - PAGE_SIZE, PAGE_SIZE, rw).unwrap();
        kernel.copy_to_user(pid, USER_SPACE_END - 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(kernel.munmap(pid, (1 << 39) + BASE, PAGE_SIZE), invalid);
    }

    #[test]
    fn munmap_needs_an_exact_match_and_frees_frames() {
        let mut kernel = test_util::kernel(128);
        let pid = kernel.spawn(&test_util::app_image(&[])).unwrap();
        let free = kernel.frames().free_frames();
        kernel.mmap(pid, BASE, 3 * PAGE_SIZE, PROT_READ).unwrap();
        assert!(kernel.munmap(pid, BASE, PAGE_SIZE).is_err());
        kernel.munmap(pid, BASE, 3 * PAGE_SIZE).unwrap();
        let space = &kernel.task(pid).unwrap().memory_set;
        assert!(space.translate(kernel.frames(), VirtPageNum(BASE / PAGE_SIZE)).is_none());
        // Table nodes built for the mapping stay behind.
        assert!(kernel.frames().free_frames() >= free - 2);
    }

    #[test]
    fn heap_follows_the_program_break() {
        let mut kernel = test_util::kernel(128);
        let pid = kernel.spawn(&test_util::app_image(&[])).unwrap();
        let heap = kernel.task(pid).unwrap().heap_bottom;
        assert_eq!(heap, 0x1_4000);
        let free = kernel.frames().free_frames();
        let areas = kernel.task(pid).unwrap().memory_set.areas().len();

        assert_eq!(kernel.change_program_brk(pid, 0), Ok(heap));
        assert_eq!(kernel.change_program_brk(pid, 100), Ok(heap));
        kernel.copy_to_user(pid, heap + 96, &[1, 2, 3, 4]).unwrap();
        assert_eq!(kernel.task(pid).unwrap().memory_set.areas().len(), areas + 1);

        assert_eq!(kernel.change_program_brk(pid, PAGE_SIZE as isize), Ok(heap + 100));
        kernel.copy_to_user(pid, heap + PAGE_SIZE, &[5]).unwrap();
        assert_eq!(kernel.frames().free_frames(), free - 2);

        assert_eq!(kernel.change_program_brk(pid, -(PAGE_SIZE as isize)), Ok(heap + PAGE_SIZE + 100));
        assert!(kernel.copy_to_user(pid, heap + PAGE_SIZE, &[5]).is_err());
        let mut bytes = [0u8; 4];
        kernel.copy_from_user(pid, heap + 96, &mut bytes).unwrap();
        assert_eq!(bytes, [1, 2, 3, 4]);

        assert_eq!(kernel.change_program_brk(pid, -200), Err(KernelError::InvalidArgument));
        assert_eq!(kernel.change_program_brk(pid, -100), Ok(heap + 100));
        assert_eq!(kernel.task(pid).unwrap().program_brk, heap);
        assert_eq!(kernel.task(pid).unwrap().memory_set.areas().len(), areas);
        assert_eq!(kernel.frames().free_frames(), free);
    }

    #[test]
    fn heap_does_not_swallow_a_mapping_at_its_start() {
        let mut kernel = test_util::kernel(128);
        let pid = kernel.spawn(&test_util::app_image(&[])).unwrap();
        let heap = kernel.task(pid).unwrap().heap_bottom;
        kernel.mmap(pid, heap, PAGE_SIZE, PROT_READ | PROT_WRITE).unwrap();
        assert_eq!(kernel.change_program_brk(pid, 8), Err(KernelError::OverlappingMapping));
        assert_eq!(kernel.change_program_brk(pid, 0), Ok(heap));
        kernel.munmap(pid, heap, PAGE_SIZE).unwrap();

        kernel.mmap(pid, heap + 2 * PAGE_SIZE, PAGE_SIZE, PROT_READ).unwrap();
        assert_eq!(kernel.change_program_brk(pid, PAGE_SIZE as isize), Ok(heap));
        assert_eq!(
            kernel.change_program_brk(pid, PAGE_SIZE as isize + 1),
            Err(KernelError::OverlappingMapping)
        );
        assert_eq!(kernel.task(pid).unwrap().program_brk, heap + PAGE_SIZE);
    }

    #[test]
    fn sbrk_reports_the_old_break_or_fails() {
        let mut kernel = test_util::kernel(128);
        let pid = kernel.spawn(&test_util::app_image(&[])).unwrap();
        kernel.schedule();
        assert_eq!(sys_sbrk(&mut kernel, -1), -1);
        assert_eq!(sys_sbrk(&mut kernel, 8), 0x1_4000);
        assert_eq!(sys_sbrk(&mut kernel, 0), 0x1_4008);
        let child = kernel.fork(pid).unwrap();
        let task = kernel.task(child).unwrap();
        assert_eq!((task.heap_bottom, task.program_brk), (0x1_4000, 0x1_4008));
        kernel.copy_to_user(child, 0x1_4000, &[9; 8]).unwrap();
    }
}
