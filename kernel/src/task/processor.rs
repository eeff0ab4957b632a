//! The single hart: who is running, the idle context and the active
//! translation root

use super::context::TaskContext;
use super::pid::Pid;
use crate::arch::Hart;

pub struct Processor {
    current: Option<Pid>,
    /// Where the hart goes when nothing is ready
    idle_task_cx: TaskContext,
    /// SATP of the space the hart returns to
    active_token: usize,
    hart: Hart,
}

impl Processor {
    pub fn new() -> Self {
        Self {
            current: None,
            idle_task_cx: TaskContext::zero_init(),
            active_token: 0,
            hart: Hart::new(),
        }
    }

    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    pub fn set_current(&mut self, pid: Option<Pid>) {
        self.current = pid;
    }

    pub fn active_token(&self) -> usize {
        self.active_token
    }

    /// Record the root the hart uses once it is back in user mode
    pub fn install_root(&mut self, token: usize) {
        self.active_token = token;
    }

    pub fn idle_task_cx(&self) -> &TaskContext {
        &self.idle_task_cx
    }

    pub fn hart(&self) -> &Hart {
        &self.hart
    }

    pub fn hart_mut(&mut self) -> &mut Hart {
        &mut self.hart
    }

    /// Switch from `from` (or the idle context) to `next`.
    ///
    /// # Safety
    /// `from` and `next` must point at live task contexts that stay put until
    /// the switch has been carried out.
    pub unsafe fn switch(&mut self, from: Option<*mut TaskContext>, next: *const TaskContext) {
        let from = from.unwrap_or(&mut self.idle_task_cx as *mut TaskContext);
        self.hart.switch(from, next);
    }

    /// Park `from` and return to the idle context.
    ///
    /// # Safety
    /// As for [`Processor::switch`].
    pub unsafe fn switch_to_idle(&mut self, from: *mut TaskContext) {
        let idle = &self.idle_task_cx as *const TaskContext;
        self.hart.switch(from, idle);
    }
}

impl Default for Processor {
    fn default() -> Self {
        Self::new()
    }
}
