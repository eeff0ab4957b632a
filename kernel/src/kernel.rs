//! The kernel context
//!
//! [`Kernel`] owns every subsystem of the core. Boot code builds exactly one
//! and keeps it for the lifetime of the machine; every cross-subsystem
//! operation is a method on it.

use crate::config::BootConfig;
use crate::error::{KernelError, KernelResult};
use crate::mm::{FrameAllocator, KernelLayout, MemorySet, PhysAddr};
use crate::task::{
    Pid, Processor, RecycleAllocator, Scheduler, TaskControlBlock, TaskManager, TaskStatus,
};
use crate::timer::TimerQueue;
use crate::trap::TrapContext;
use alloc::vec::Vec;

pub struct Kernel {
    pub(crate) frames: FrameAllocator,
    pub(crate) layout: KernelLayout,
    pub(crate) kernel_space: MemorySet,
    pub(crate) tasks: TaskManager,
    pub(crate) scheduler: Scheduler,
    pub(crate) processor: Processor,
    pub(crate) timers: TimerQueue,
    pub(crate) pid_allocator: RecycleAllocator,
    /// Adopts orphaned children
    pub(crate) init_pid: Option<Pid>,
    /// Parentless zombies awaiting the next scheduling point
    pub(crate) orphans: Vec<Pid>,
    /// Timer ticks since boot
    pub(crate) ticks: u64,
    pub(crate) config: BootConfig,
}

impl Kernel {
    /// Build the kernel space over `frames` and make it the active root
    pub fn new(
        mut frames: FrameAllocator,
        layout: KernelLayout,
        config: BootConfig,
    ) -> KernelResult<Self> {
        let kernel_space = MemorySet::new_kernel(&mut frames, &layout)?;
        kernel_space.activate();
        let mut processor = Processor::new();
        processor.install_root(kernel_space.token());
        log::info!(
            "kernel space ready, {} of {} frames free",
            frames.free_frames(),
            frames.total_frames()
        );
        Ok(Self {
            frames,
            layout,
            kernel_space,
            tasks: TaskManager::new(),
            scheduler: Scheduler::new(config.time_slice_ticks),
            processor,
            timers: TimerQueue::new(),
            pid_allocator: RecycleAllocator::new(),
            init_pid: None,
            orphans: Vec::new(),
            ticks: 0,
            config,
        })
    }

    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut FrameAllocator {
        &mut self.frames
    }

    pub fn layout(&self) -> &KernelLayout {
        &self.layout
    }

    pub fn kernel_space(&self) -> &MemorySet {
        &self.kernel_space
    }

    pub fn config(&self) -> &BootConfig {
        &self.config
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    pub fn processor_mut(&mut self) -> &mut Processor {
        &mut self.processor
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn init_pid(&self) -> Option<Pid> {
        self.init_pid
    }

    pub fn task(&self, pid: Pid) -> Option<&TaskControlBlock> {
        self.tasks.get(pid)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.task_count()
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.tasks.count_with_status(status)
    }

    /// Ready tasks, front of the queue first
    pub fn ready_pids(&self) -> Vec<Pid> {
        self.tasks.ready_pids()
    }

    fn user_space(&self, pid: Pid) -> KernelResult<&MemorySet> {
        self.tasks
            .get(pid)
            .map(|task| &task.memory_set)
            .ok_or(KernelError::NoSuchTask(pid))
    }

    pub fn trap_context(&self, pid: Pid) -> KernelResult<&TrapContext> {
        let task = self.tasks.get(pid).ok_or(KernelError::NoSuchTask(pid))?;
        self.frames.trap_context(task.trap_cx_ppn)
    }

    pub fn trap_context_mut(&mut self, pid: Pid) -> KernelResult<&mut TrapContext> {
        let task = self.tasks.get(pid).ok_or(KernelError::NoSuchTask(pid))?;
        self.frames.trap_context_mut(task.trap_cx_ppn)
    }

    /// Read `buf.len()` bytes from `pid`'s memory at `va`
    pub fn copy_from_user(&self, pid: Pid, va: usize, buf: &mut [u8]) -> KernelResult<()> {
        self.user_space(pid)?.copy_from_user(&self.frames, va, buf)
    }

    /// Write `data` into `pid`'s memory at `va`
    pub fn copy_to_user(&mut self, pid: Pid, va: usize, data: &[u8]) -> KernelResult<()> {
        let space = &self
            .tasks
            .get(pid)
            .ok_or(KernelError::NoSuchTask(pid))?
            .memory_set;
        space.copy_to_user(&mut self.frames, va, data)
    }

    /// Physical pieces of `pid`'s buffer `[va, va + len)`
    pub fn translated_byte_buffer(
        &self,
        pid: Pid,
        va: usize,
        len: usize,
        write: bool,
    ) -> KernelResult<Vec<(PhysAddr, usize)>> {
        self.user_space(pid)?
            .translated_byte_buffer(&self.frames, va, len, write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    #[test]
    fn new_kernel_activates_its_own_space() {
        let kernel = test_util::kernel(64);
        assert_eq!(kernel.processor().active_token(), kernel.kernel_space().token());
        assert_eq!(kernel.current_pid(), None);
        assert_eq!(kernel.task_count(), 0);
        assert_eq!(kernel.ticks(), 0);
        assert!(kernel.frames().free_frames() < kernel.frames().total_frames());
    }

    #[test]
    fn too_small_a_pool_fails_cleanly() {
        let frames = test_util::frames(2);
        let layout = test_util::layout(&frames);
        assert_eq!(
            Kernel::new(frames, layout, BootConfig::default()).err(),
            Some(KernelError::OutOfMemory)
        );
    }

    #[test]
    fn user_memory_is_reached_per_task() {
        let mut kernel = test_util::kernel(128);
        let pid = kernel.spawn(&test_util::app_image(b"hello")).unwrap();
        let mut buf = [0u8; 5];
        kernel.copy_from_user(pid, 0x1_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        kernel.copy_to_user(pid, 0x1_0000, b"J").unwrap();
        let pieces = kernel.translated_byte_buffer(pid, 0x1_0000, 1, false).unwrap();
        let (pa, len) = pieces[0];
        assert_eq!(len, 1);
        assert_eq!(kernel.frames().frame_bytes(pa.floor()).unwrap()[0], b'J');
        assert_eq!(
            kernel.copy_from_user(Pid(42), 0, &mut buf),
            Err(KernelError::NoSuchTask(Pid(42)))
        );
    }
}
