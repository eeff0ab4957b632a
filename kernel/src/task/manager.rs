//! Task Manager
//!
//! Owns every task control block and the FIFO ready queue

use super::pid::Pid;
use super::task::{TaskControlBlock, TaskStatus};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

pub struct TaskManager {
    // Boxed so a saved context keeps its address while the map rebalances.
    tasks: BTreeMap<Pid, Box<TaskControlBlock>>,
    ready_queue: VecDeque<Pid>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            ready_queue: VecDeque::new(),
        }
    }

    pub fn insert(&mut self, task: TaskControlBlock) {
        self.tasks.insert(task.pid, Box::new(task));
    }

    /// Drop a task from the table and the ready queue
    pub fn remove(&mut self, pid: Pid) -> Option<Box<TaskControlBlock>> {
        self.remove_ready(pid);
        self.tasks.remove(&pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&TaskControlBlock> {
        self.tasks.get(&pid).map(|task| task.as_ref())
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut TaskControlBlock> {
        self.tasks.get_mut(&pid).map(|task| task.as_mut())
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.tasks.contains_key(&pid)
    }

    /// Append to the back of the ready queue
    pub fn push_ready(&mut self, pid: Pid) {
        self.ready_queue.push_back(pid);
    }

    /// Take the task at the front of the ready queue
    pub fn fetch(&mut self) -> Option<Pid> {
        self.ready_queue.pop_front()
    }

    pub fn remove_ready(&mut self, pid: Pid) {
        self.ready_queue.retain(|&queued| queued != pid);
    }

    pub fn ready_pids(&self) -> Vec<Pid> {
        self.ready_queue.iter().copied().collect()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}
