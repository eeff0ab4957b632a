//! Timer deadlines and sleeping
//!
//! Kernel time is a monotonic count of timer interrupts. Deadlines are kept
//! in a min-heap; equal deadlines fire in the order they were armed.

use crate::config::BootConfig;
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::sync::InterruptGuard;
use crate::task::{Pid, TaskStatus, WaitReason, WakeReason};
use alloc::collections::BinaryHeap;
use alloc::vec::Vec;
use core::cmp::Ordering;

/// A task waiting for `expire`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TimerCondVar {
    pub expire: u64,
    pub pid: Pid,
    seq: u64,
}

impl PartialOrd for TimerCondVar {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerCondVar {
    // Reversed so the max-heap pops the earliest deadline.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .expire
            .cmp(&self.expire)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct TimerQueue {
    timers: BinaryHeap<TimerCondVar>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            timers: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn add_timer(&mut self, pid: Pid, expire: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers.push(TimerCondVar { expire, pid, seq });
    }

    /// Pop every timer with `expire <= now`, earliest first
    pub fn check_timer(&mut self, now: u64) -> Vec<Pid> {
        let mut expired = Vec::new();
        while let Some(timer) = self.timers.peek() {
            if timer.expire > now {
                break;
            }
            expired.push(timer.pid);
            self.timers.pop();
        }
        expired
    }

    /// Drop every timer armed for `pid`; returns how many there were
    pub fn cancel(&mut self, pid: Pid) -> usize {
        let before = self.timers.len();
        self.timers.retain(|timer| timer.pid != pid);
        before - self.timers.len()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.peek().map(|timer| timer.expire)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds since boot for a raw `time` CSR value
pub fn get_time_ms(time: u64, config: &BootConfig) -> usize {
    (time / (config.clock_freq as u64 / 1000)) as usize
}

impl Kernel {
    /// Block the running task until `ticks` timer ticks from now
    pub fn sleep_current(&mut self, ticks: u64) -> KernelResult<Option<Pid>> {
        let _intr = InterruptGuard::new();
        let pid = self.current_pid().ok_or(KernelError::InvalidState)?;
        let expire = self.ticks.saturating_add(ticks);
        self.timers.add_timer(pid, expire);
        log::trace!("task {} sleeps until tick {}", pid, expire);
        self.block_current(WaitReason::Sleep)
    }

    /// Wake every sleeper whose deadline has passed; returns them in wake
    /// order
    pub fn check_timer(&mut self, now: u64) -> Vec<Pid> {
        let _intr = InterruptGuard::new();
        let mut woken = Vec::new();
        for pid in self.timers.check_timer(now) {
            match self.wake(pid, WakeReason::Timeout) {
                Ok(true) => woken.push(pid),
                Ok(false) => {}
                Err(err) => log::error!("timer for task {}: {}", pid, err),
            }
        }
        woken
    }

    /// Timer interrupt: advance the clock to `now`, fire due timers and
    /// charge the running task's time slice. Returns the task that owns the
    /// hart afterwards.
    pub fn tick(&mut self, now: u64) -> Option<Pid> {
        let _intr = InterruptGuard::new();
        self.ticks = self.ticks.max(now);
        self.check_timer(self.ticks);
        match self.current_pid() {
            Some(pid) if self.task_status(pid) == Some(TaskStatus::Running) => {
                if self.scheduler.tick() {
                    log::trace!("time slice of task {} expired", pid);
                    self.preempt_current()
                } else {
                    Some(pid)
                }
            }
            _ => self.schedule(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_deadline_first() {
        let mut queue = TimerQueue::new();
        queue.add_timer(Pid(1), 30);
        queue.add_timer(Pid(2), 10);
        queue.add_timer(Pid(3), 20);
        assert_eq!(queue.next_deadline(), Some(10));
        assert_eq!(queue.check_timer(25), [Pid(2), Pid(3)]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn ties_fire_in_insertion_order() {
        let mut queue = TimerQueue::new();
        for pid in [5, 3, 9, 1] {
            queue.add_timer(Pid(pid), 7);
        }
        assert_eq!(queue.check_timer(7), [Pid(5), Pid(3), Pid(9), Pid(1)]);
    }

    #[test]
    fn nothing_fires_before_its_deadline() {
        let mut queue = TimerQueue::new();
        queue.add_timer(Pid(1), 100);
        assert!(queue.check_timer(99).is_empty());
        assert_eq!(queue.check_timer(100), [Pid(1)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn cancel_removes_only_that_task() {
        let mut queue = TimerQueue::new();
        queue.add_timer(Pid(1), 5);
        queue.add_timer(Pid(2), 6);
        queue.add_timer(Pid(1), 7);
        assert_eq!(queue.cancel(Pid(1)), 2);
        assert_eq!(queue.check_timer(10), [Pid(2)]);
    }

    #[test]
    fn time_conversions() {
        let config = BootConfig::default();
        assert_eq!(get_time_ms(10_000_000, &config), 1000);
        assert_eq!(config.ms_to_ticks(10), 1);
        assert_eq!(config.ms_to_ticks(11), 2);
        assert_eq!(config.ticks_to_ms(3), 30);
    }

    #[test]
    fn huge_durations_saturate() {
        let config = BootConfig::default();
        assert_eq!(config.ms_to_ticks(usize::MAX), usize::MAX as u64 / 10 + 1);
        let fast = BootConfig {
            ticks_per_sec: 1_000_000,
            ..config
        };
        assert_eq!(fast.ms_to_ticks(usize::MAX), u64::MAX);
        assert_eq!(fast.ticks_to_ms(u64::MAX), 18_446_744_073_709_551);
    }
}
