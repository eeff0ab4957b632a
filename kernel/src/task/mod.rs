//! Task (process) management module
//!
//! Task lifecycle: spawn and fork create tasks, the scheduler moves them
//! between `Ready` and `Running`, waits park them in `Blocked`, and exit
//! leaves a `Zombie` until its parent collects it.

mod context;
mod manager;
mod pid;
mod processor;
mod scheduler;
mod signal;
#[allow(clippy::module_inception)]
mod task;

pub use context::TaskContext;
pub use manager::TaskManager;
pub use pid::{kernel_stack_position, KernelStack, Pid, RecycleAllocator};
pub use processor::Processor;
pub use scheduler::Scheduler;
pub use signal::{Signal, SignalAction, SignalFlags, SignalState};
pub use task::{TaskControlBlock, TaskStatus, WaitReason, WakeReason};

use crate::arch;
use crate::config::{TRAP_CONTEXT, USER_SPACE_END};
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::mm::{AppImage, MapPermission, MemorySet, VirtAddr};
use crate::sync::InterruptGuard;
use crate::syscall;
use crate::trap::TrapContext;
use alloc::vec::Vec;

impl Kernel {
    /// Create a task from a loader-provided image and queue it. The first
    /// task ever spawned becomes the init task.
    pub fn spawn(&mut self, image: &AppImage) -> KernelResult<Pid> {
        let _intr = InterruptGuard::new();
        let (memory_set, user_sp, entry) = MemorySet::new_app(&mut self.frames, &self.layout, image)?;
        let pid = self.admit(memory_set, user_sp, None, |cx, kernel_satp, kernel_sp| {
            *cx = TrapContext::app_init_context(
                entry,
                user_sp,
                kernel_satp,
                kernel_sp,
                arch::trap_handler_address(),
            );
        })?;
        if self.init_pid.is_none() {
            self.init_pid = Some(pid);
        }
        log::info!("spawned task {} (entry {:#x})", pid, entry);
        Ok(pid)
    }

    /// Create a task from an ELF executable
    pub fn spawn_elf(&mut self, elf_data: &[u8]) -> KernelResult<Pid> {
        let image = AppImage::from_elf(elf_data)?;
        self.spawn(&image)
    }

    /// Duplicate `parent`: a deep copy of its address space, the same
    /// registers, and `0` as the child's return value.
    pub fn fork(&mut self, parent: Pid) -> KernelResult<Pid> {
        let _intr = InterruptGuard::new();
        let parent_task = self.tasks.get(parent).ok_or(KernelError::NoSuchTask(parent))?;
        if parent_task.is_zombie() {
            return Err(KernelError::InvalidState);
        }
        let memory_set =
            MemorySet::from_existing_user(&mut self.frames, &self.layout, &parent_task.memory_set)?;
        let base_size = parent_task.base_size;
        let heap = (parent_task.heap_bottom, parent_task.program_brk);
        let mask = parent_task.signals.mask;
        let child = self.admit(memory_set, base_size, Some(parent), |cx, _, kernel_sp| {
            cx.kernel_sp = kernel_sp;
            cx.x[10] = 0;
        })?;
        if let Some(task) = self.tasks.get_mut(child) {
            task.signals.mask = mask;
            (task.heap_bottom, task.program_brk) = heap;
        }
        if let Some(task) = self.tasks.get_mut(parent) {
            task.children.push(child);
        }
        log::info!("task {} forked task {}", parent, child);
        Ok(child)
    }

    /// Give a freshly built address space a pid, a kernel stack and a TCB,
    /// then queue it. `init_cx` fills in the trap context. Everything is
    /// released again on failure.
    fn admit<F>(
        &mut self,
        memory_set: MemorySet,
        base_size: usize,
        parent: Option<Pid>,
        init_cx: F,
    ) -> KernelResult<Pid>
    where
        F: FnOnce(&mut TrapContext, usize, usize),
    {
        let trap_cx_ppn = match memory_set.translate(&self.frames, VirtAddr::new(TRAP_CONTEXT).floor()) {
            Some(pte) => pte.ppn(),
            None => {
                self.discard_space(memory_set);
                return Err(KernelError::NotMapped(VirtAddr::new(TRAP_CONTEXT).floor()));
            }
        };
        let pid = Pid(self.pid_allocator.alloc());
        let kernel_stack = match KernelStack::new(pid.0, &mut self.kernel_space, &mut self.frames) {
            Ok(kernel_stack) => kernel_stack,
            Err(err) => {
                self.discard_space(memory_set);
                self.discard_pid(pid);
                return Err(err);
            }
        };
        let kernel_satp = self.kernel_space.token();
        let kernel_sp = kernel_stack.top();
        let prepared = self
            .frames
            .trap_context_mut(trap_cx_ppn)
            .map(|cx| init_cx(cx, kernel_satp, kernel_sp));
        if let Err(err) = prepared {
            self.discard_space(memory_set);
            if let Err(e) = kernel_stack.release(&mut self.kernel_space, &mut self.frames) {
                log::error!("releasing kernel stack of {}: {}", pid, e);
            }
            self.discard_pid(pid);
            return Err(err);
        }
        let task = TaskControlBlock::new(pid, kernel_stack, memory_set, trap_cx_ppn, base_size, parent);
        self.tasks.insert(task);
        self.tasks.push_ready(pid);
        Ok(pid)
    }

    fn discard_space(&mut self, memory_set: MemorySet) {
        if let Err(err) = memory_set.release(&mut self.frames) {
            log::error!("releasing an address space: {}", err);
        }
    }

    fn discard_pid(&mut self, pid: Pid) {
        if let Err(err) = self.pid_allocator.dealloc(pid.0) {
            log::error!("releasing pid {}: {}", pid, err);
        }
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.processor.current()
    }

    pub fn task_status(&self, pid: Pid) -> Option<TaskStatus> {
        self.tasks.get(pid).map(|task| task.status)
    }

    /// Dispatch the next ready task if the hart is free. A task that is
    /// still `Running` keeps the hart. Returns the task on the hart, or
    /// `None` when it idles.
    pub fn schedule(&mut self) -> Option<Pid> {
        let _intr = InterruptGuard::new();
        let outgoing = self.processor.current();
        self.reap_orphans(outgoing);
        if let Some(pid) = outgoing {
            if self.task_status(pid) == Some(TaskStatus::Running) {
                return Some(pid);
            }
        }
        let Some(next) = self.scheduler.pick_next(&mut self.tasks) else {
            if let Some(prev) = outgoing {
                if let Some(task) = self.tasks.get_mut(prev) {
                    let prev_cx = &mut task.task_cx as *mut _;
                    // SAFETY: the context lives in a boxed TCB that is not
                    // reaped before the switch is carried out.
                    unsafe { self.processor.switch_to_idle(prev_cx) };
                }
                self.processor.set_current(None);
                self.processor.install_root(self.kernel_space.token());
                log::trace!("hart idle");
            }
            return None;
        };
        let now = self.ticks;
        let Some(task) = self.tasks.get_mut(next) else {
            return None;
        };
        task.status = TaskStatus::Running;
        task.first_run.get_or_insert(now);
        let next_cx = &task.task_cx as *const _;
        let token = task.user_token();
        if outgoing != Some(next) {
            let prev_cx = outgoing
                .and_then(|pid| self.tasks.get_mut(pid))
                .map(|task| &mut task.task_cx as *mut _);
            // SAFETY: as above; both contexts are boxed and live.
            unsafe { self.processor.switch(prev_cx, next_cx) };
        }
        self.processor.set_current(Some(next));
        self.processor.install_root(token);
        self.scheduler.reset_time_slice();
        log::trace!("dispatch task {}", next);
        Some(next)
    }

    fn suspend_current(&mut self) -> Option<Pid> {
        let pid = self.current_pid()?;
        let task = self.tasks.get_mut(pid)?;
        if task.status == TaskStatus::Running {
            task.status = TaskStatus::Ready;
            self.tasks.push_ready(pid);
        }
        Some(pid)
    }

    /// The running task gives up the hart and rejoins the back of the queue
    pub fn yield_current(&mut self) -> Option<Pid> {
        let _intr = InterruptGuard::new();
        self.suspend_current();
        self.schedule()
    }

    /// Like [`Kernel::yield_current`], on behalf of the timer
    pub fn preempt_current(&mut self) -> Option<Pid> {
        let _intr = InterruptGuard::new();
        if let Some(pid) = self.suspend_current() {
            log::debug!("preempt task {}", pid);
        }
        self.schedule()
    }

    /// Park the running task until it is woken
    pub fn block_current(&mut self, wait: WaitReason) -> KernelResult<Option<Pid>> {
        let _intr = InterruptGuard::new();
        let pid = self.current_pid().ok_or(KernelError::InvalidState)?;
        let task = self.tasks.get_mut(pid).ok_or(KernelError::NoSuchTask(pid))?;
        if task.status != TaskStatus::Running {
            return Err(KernelError::InvalidState);
        }
        task.status = TaskStatus::Blocked;
        task.waiting = Some(wait);
        task.wake_reason = None;
        log::debug!("task {} blocks on {:?}", pid, wait);
        Ok(self.schedule())
    }

    /// Move a blocked task to the back of the ready queue. Returns false if
    /// it was not blocked.
    pub fn wake(&mut self, pid: Pid, reason: WakeReason) -> KernelResult<bool> {
        let _intr = InterruptGuard::new();
        let task = self.tasks.get_mut(pid).ok_or(KernelError::NoSuchTask(pid))?;
        if task.status != TaskStatus::Blocked {
            return Ok(false);
        }
        task.status = TaskStatus::Ready;
        task.wake_reason = Some(reason);
        let wait = task.waiting.take();
        let trap_cx_ppn = task.trap_cx_ppn;
        self.tasks.push_ready(pid);
        if reason != WakeReason::Timeout {
            self.timers.cancel(pid);
        }
        if let Some(wait) = wait {
            let cx = self.frames.trap_context_mut(trap_cx_ppn)?;
            syscall::complete_wait(cx, wait, reason);
        }
        log::debug!("task {} woken: {:?}", pid, reason);
        Ok(true)
    }

    /// The device collaborator finished a transfer for `pid`
    pub fn notify_io(&mut self, pid: Pid) -> KernelResult<bool> {
        let _intr = InterruptGuard::new();
        let task = self.tasks.get(pid).ok_or(KernelError::NoSuchTask(pid))?;
        match (task.status, task.waiting) {
            (TaskStatus::Blocked, Some(WaitReason::Io { .. })) => self.wake(pid, WakeReason::Io),
            _ => Ok(false),
        }
    }

    /// Input arrived for `pid`: raise SIGIO and finish any pending read
    pub fn on_input_ready(&mut self, pid: Pid) -> KernelResult<()> {
        let _intr = InterruptGuard::new();
        self.post_signal(pid, Signal::SIGIO)?;
        self.notify_io(pid)?;
        Ok(())
    }

    /// Terminate the running task and hand the hart on
    pub fn exit_current(&mut self, exit_code: i32) -> KernelResult<Option<Pid>> {
        let _intr = InterruptGuard::new();
        let pid = self.current_pid().ok_or(KernelError::InvalidState)?;
        self.exit_task(pid, exit_code)?;
        Ok(self.schedule())
    }

    fn exit_task(&mut self, pid: Pid, exit_code: i32) -> KernelResult<()> {
        let task = self.tasks.get_mut(pid).ok_or(KernelError::NoSuchTask(pid))?;
        if task.is_zombie() {
            return Err(KernelError::InvalidState);
        }
        task.status = TaskStatus::Zombie;
        task.exit_code = exit_code;
        task.waiting = None;
        let children = core::mem::take(&mut task.children);
        let parent = task.parent;
        self.tasks.remove_ready(pid);
        self.timers.cancel(pid);
        log::info!("task {} exited with code {}", pid, exit_code);

        if self.init_pid == Some(pid) {
            self.init_pid = None;
        }
        let new_parent = self.init_pid;
        for child in children {
            let Some(child_task) = self.tasks.get_mut(child) else {
                continue;
            };
            child_task.parent = new_parent;
            let zombie = child_task.is_zombie();
            match new_parent {
                Some(init) => {
                    if let Some(init_task) = self.tasks.get_mut(init) {
                        init_task.children.push(child);
                    }
                }
                None if zombie => self.orphans.push(child),
                None => {}
            }
        }

        match parent.filter(|&ppid| self.tasks.contains(ppid)) {
            Some(ppid) => {
                self.post_signal(ppid, Signal::SIGCHLD)?;
                let parent_task = self.tasks.get(ppid).ok_or(KernelError::NoSuchTask(ppid))?;
                if parent_task.status == TaskStatus::Blocked
                    && parent_task.waiting == Some(WaitReason::Child)
                {
                    self.wake(ppid, WakeReason::ChildExited)?;
                }
            }
            None => self.orphans.push(pid),
        }
        Ok(())
    }

    /// Move the program break of `pid` by `size` bytes, mapping or
    /// unmapping heap pages to match. Returns the old break.
    pub fn change_program_brk(&mut self, pid: Pid, size: isize) -> KernelResult<usize> {
        let _intr = InterruptGuard::new();
        let task = self.tasks.get_mut(pid).ok_or(KernelError::NoSuchTask(pid))?;
        let old_brk = task.program_brk;
        let new_brk = old_brk
            .checked_add_signed(size)
            .filter(|&brk| brk >= task.heap_bottom && brk <= USER_SPACE_END)
            .ok_or(KernelError::InvalidArgument)?;
        let heap_start = VirtAddr::new(task.heap_bottom).floor();
        let old_end = VirtAddr::new(old_brk).ceil();
        let new_end = VirtAddr::new(new_brk).ceil();
        if new_end != old_end {
            // With no heap pages yet, an area at the heap start belongs to mmap.
            let foreign = old_end == heap_start
                && task
                    .memory_set
                    .areas()
                    .iter()
                    .any(|area| area.vpn_range().get_start() == heap_start);
            if foreign {
                return Err(KernelError::OverlappingMapping);
            }
            task.memory_set.resize_area(
                &mut self.frames,
                heap_start,
                new_end,
                MapPermission::R | MapPermission::W | MapPermission::U,
            )?;
        }
        task.program_brk = new_brk;
        log::debug!("task {} brk {:#x} -> {:#x}", pid, old_brk, new_brk);
        Ok(old_brk)
    }

    /// Collect an exited child of `parent`: any child when `target` is
    /// `None`. `Ok(None)` means matching children exist but none has exited.
    pub fn waitpid(&mut self, parent: Pid, target: Option<Pid>) -> KernelResult<Option<(Pid, i32)>> {
        let _intr = InterruptGuard::new();
        let task = self.tasks.get(parent).ok_or(KernelError::NoSuchTask(parent))?;
        let matching: Vec<Pid> = task
            .children
            .iter()
            .copied()
            .filter(|&child| target.map_or(true, |t| t == child))
            .collect();
        if matching.is_empty() {
            return Err(KernelError::NoSuchChild);
        }
        let Some(zombie) = matching
            .into_iter()
            .find(|&child| self.task_status(child) == Some(TaskStatus::Zombie))
        else {
            return Ok(None);
        };
        if let Some(task) = self.tasks.get_mut(parent) {
            task.children.retain(|&child| child != zombie);
        }
        let exit_code = self.reap(zombie)?;
        Ok(Some((zombie, exit_code)))
    }

    /// Release everything a zombie still holds; returns its exit code
    fn reap(&mut self, pid: Pid) -> KernelResult<i32> {
        let task = self.tasks.remove(pid).ok_or(KernelError::NoSuchTask(pid))?;
        let TaskControlBlock {
            kernel_stack,
            memory_set,
            exit_code,
            ..
        } = *task;
        self.timers.cancel(pid);
        let space = memory_set.release(&mut self.frames);
        let stack = kernel_stack.release(&mut self.kernel_space, &mut self.frames);
        let id = self.pid_allocator.dealloc(pid.0);
        if let Err(err) = space.and(stack).and(id) {
            log::error!("reaping task {}: {}", pid, err);
        }
        log::debug!("reaped task {}", pid);
        Ok(exit_code)
    }

    /// Parentless zombies go at the next scheduling point, except the one
    /// still on the hart
    fn reap_orphans(&mut self, on_hart: Option<Pid>) {
        let orphans = core::mem::take(&mut self.orphans);
        for pid in orphans {
            if Some(pid) == on_hart {
                self.orphans.push(pid);
            } else if let Err(err) = self.reap(pid) {
                log::error!("reaping orphan {}: {}", pid, err);
            }
        }
    }
}
