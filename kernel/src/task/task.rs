//! Task Control Block
//!
//! Everything the kernel tracks about one task

use super::context::TaskContext;
use super::pid::{KernelStack, Pid};
use super::signal::SignalState;
use crate::config::MAX_SYSCALL_NUM;
use crate::mm::{MemorySet, PhysPageNum};
use alloc::vec::Vec;

/// Task State
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Ready,
    Running,
    Blocked,
    Zombie,
}

/// Why a task is blocked
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitReason {
    /// Until a timer deadline
    Sleep,
    /// Until a deliverable signal that is not ignored arrives
    Signal,
    /// Until the device collaborator completes a transfer
    Io { interruptible: bool },
    /// Until a child exits
    Child,
}

impl WaitReason {
    /// Whether a deliverable signal may cut the wait short
    pub fn interruptible(self) -> bool {
        match self {
            Self::Io { interruptible } => interruptible,
            _ => true,
        }
    }
}

/// Why a task left `Blocked`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WakeReason {
    Timeout,
    Interrupted,
    Io,
    ChildExited,
    Explicit,
}

pub struct TaskControlBlock {
    pub pid: Pid,
    pub kernel_stack: KernelStack,
    pub status: TaskStatus,
    pub task_cx: TaskContext,
    pub memory_set: MemorySet,
    /// Frame holding this task's trap context
    pub trap_cx_ppn: PhysPageNum,
    /// Top of the initial user stack
    pub base_size: usize,
    /// The heap grows up from here
    pub heap_bottom: usize,
    pub program_brk: usize,
    pub syscall_times: [u32; MAX_SYSCALL_NUM],
    /// Tick of the first dispatch
    pub first_run: Option<u64>,
    pub parent: Option<Pid>,
    pub children: Vec<Pid>,
    pub exit_code: i32,
    pub signals: SignalState,
    pub waiting: Option<WaitReason>,
    pub wake_reason: Option<WakeReason>,
}

impl TaskControlBlock {
    pub fn new(
        pid: Pid,
        kernel_stack: KernelStack,
        memory_set: MemorySet,
        trap_cx_ppn: PhysPageNum,
        base_size: usize,
        parent: Option<Pid>,
    ) -> Self {
        let kernel_stack_top = kernel_stack.top();
        Self {
            pid,
            kernel_stack,
            status: TaskStatus::Ready,
            task_cx: TaskContext::goto_trap_return(kernel_stack_top),
            memory_set,
            trap_cx_ppn,
            base_size,
            heap_bottom: base_size,
            program_brk: base_size,
            syscall_times: [0; MAX_SYSCALL_NUM],
            first_run: None,
            parent,
            children: Vec::new(),
            exit_code: 0,
            signals: SignalState::new(),
            waiting: None,
            wake_reason: None,
        }
    }

    pub fn user_token(&self) -> usize {
        self.memory_set.token()
    }

    pub fn is_zombie(&self) -> bool {
        self.status == TaskStatus::Zombie
    }

    pub fn record_syscall(&mut self, syscall_id: usize) {
        if let Some(count) = self.syscall_times.get_mut(syscall_id) {
            *count = count.saturating_add(1);
        }
    }
}
