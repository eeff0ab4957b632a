//! Scheduler
//!
//! Implements round-robin scheduling: FIFO dispatch from the ready queue
//! and a fixed time slice counted in timer ticks.

use super::manager::TaskManager;
use super::pid::Pid;
use super::task::TaskStatus;

pub struct Scheduler {
    time_slice: usize,
    current_time_slice: usize,
}

impl Scheduler {
    pub fn new(time_slice: usize) -> Self {
        Self {
            time_slice: time_slice.max(1),
            current_time_slice: 0,
        }
    }

    /// Next ready task, first come first served
    pub fn pick_next(&mut self, tasks: &mut TaskManager) -> Option<Pid> {
        while let Some(pid) = tasks.fetch() {
            match tasks.get(pid) {
                Some(task) if task.status == TaskStatus::Ready => return Some(pid),
                _ => log::warn!("dropping stale ready entry {}", pid),
            }
        }
        None
    }

    /// Charge one tick to the running task. True once its slice is used up.
    pub fn tick(&mut self) -> bool {
        self.current_time_slice += 1;
        if self.current_time_slice >= self.time_slice {
            self.current_time_slice = 0;
            true
        } else {
            false
        }
    }

    pub fn reset_time_slice(&mut self) {
        self.current_time_slice = 0;
    }

    pub fn time_slice(&self) -> usize {
        self.time_slice
    }
}
