//! Process management syscalls

use super::{caller, into_ret};
use crate::config::MAX_SYSCALL_NUM;
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::task::{Pid, Signal, SignalFlags, TaskStatus, WaitReason};
use alloc::vec;
use alloc::vec::Vec;
use core::mem::{offset_of, size_of};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeVal {
    pub sec: usize,
    pub usec: usize,
}

impl TimeVal {
    fn to_bytes(self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&(self.sec as u64).to_ne_bytes());
        bytes[8..].copy_from_slice(&(self.usec as u64).to_ne_bytes());
        bytes
    }
}

/// What `task_info` reports about the caller
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    pub status: u32,
    /// How often each syscall id has been invoked
    pub syscall_times: [u32; MAX_SYSCALL_NUM],
    /// Milliseconds since the task was first dispatched
    pub time: usize,
}

impl TaskInfo {
    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; size_of::<Self>()];
        bytes[..4].copy_from_slice(&self.status.to_ne_bytes());
        let times = offset_of!(TaskInfo, syscall_times);
        for (chunk, count) in bytes[times..].chunks_exact_mut(4).zip(self.syscall_times) {
            chunk.copy_from_slice(&count.to_ne_bytes());
        }
        let time = offset_of!(TaskInfo, time);
        bytes[time..time + size_of::<usize>()].copy_from_slice(&self.time.to_ne_bytes());
        bytes
    }
}

fn status_code(status: TaskStatus) -> u32 {
    match status {
        TaskStatus::Ready => 1,
        TaskStatus::Running => 2,
        TaskStatus::Blocked => 3,
        TaskStatus::Zombie => 4,
    }
}

/// The caller becomes a zombie; nothing is returned to it
pub fn sys_exit(kernel: &mut Kernel, exit_code: i32) -> isize {
    into_ret("exit", kernel.exit_current(exit_code).map(|_| 0))
}

pub fn sys_yield(kernel: &mut Kernel) -> isize {
    kernel.yield_current();
    0
}

pub fn sys_getpid(kernel: &mut Kernel) -> isize {
    into_ret("getpid", caller(kernel).map(|pid| pid.0 as isize))
}

/// Parent gets the child's pid, the child gets 0
pub fn sys_fork(kernel: &mut Kernel) -> isize {
    let result = caller(kernel).and_then(|parent| kernel.fork(parent));
    into_ret("fork", result.map(|child| child.0 as isize))
}

/// Collect an exited child (`pid == -1`: any child) and store its exit code
/// at `exit_code_ptr` when that is non-null. Blocks while matching children
/// are still running. `-1` when no child matches.
pub fn sys_waitpid(kernel: &mut Kernel, pid: isize, exit_code_ptr: usize) -> isize {
    into_ret("waitpid", waitpid(kernel, pid, exit_code_ptr))
}

fn waitpid(kernel: &mut Kernel, pid: isize, exit_code_ptr: usize) -> KernelResult<isize> {
    let parent = caller(kernel)?;
    let target = match pid {
        -1 => None,
        pid if pid >= 0 => Some(Pid(pid as usize)),
        _ => return Err(KernelError::InvalidArgument),
    };
    if exit_code_ptr != 0 {
        // A zombie is only reaped once its exit code has somewhere to go.
        kernel.translated_byte_buffer(parent, exit_code_ptr, size_of::<i32>(), true)?;
    }
    match kernel.waitpid(parent, target)? {
        Some((child, exit_code)) => {
            if exit_code_ptr != 0 {
                kernel.copy_to_user(parent, exit_code_ptr, &exit_code.to_ne_bytes())?;
            }
            Ok(child.0 as isize)
        }
        None => {
            kernel.block_current(WaitReason::Child)?;
            Ok(0)
        }
    }
}

pub fn sys_kill(kernel: &mut Kernel, pid: usize, signum: usize) -> isize {
    let result = Signal::new(signum).and_then(|signal| kernel.post_signal(Pid(pid), signal));
    into_ret("kill", result.map(|_| 0))
}

/// Replace the caller's signal mask; returns the old one
pub fn sys_sigprocmask(kernel: &mut Kernel, mask: usize) -> isize {
    let result = caller(kernel).and_then(|pid| {
        kernel.set_signal_mask(pid, SignalFlags::from_bits_truncate(mask as u32))
    });
    into_ret("sigprocmask", result.map(|old| old.bits() as isize))
}

/// Block for at least `ms` milliseconds. `-EINTR` if a signal cuts the
/// sleep short.
pub fn sys_sleep(kernel: &mut Kernel, ms: usize) -> isize {
    let ticks = kernel.config().ms_to_ticks(ms);
    if ticks == 0 {
        kernel.yield_current();
        return 0;
    }
    into_ret("sleep", kernel.sleep_current(ticks).map(|_| 0))
}

/// Time since boot, at tick granularity
pub fn sys_get_time(kernel: &mut Kernel, ts: usize, _tz: usize) -> isize {
    into_ret("get_time", get_time(kernel, ts))
}

fn get_time(kernel: &mut Kernel, ts: usize) -> KernelResult<isize> {
    let pid = caller(kernel)?;
    let us = kernel.config().ticks_to_ms(kernel.ticks()).saturating_mul(1000);
    let time = TimeVal {
        sec: us / 1_000_000,
        usec: us % 1_000_000,
    };
    kernel.copy_to_user(pid, ts, &time.to_bytes())?;
    Ok(0)
}

/// Fill the `TaskInfo` at `ti` for the caller
pub fn sys_task_info(kernel: &mut Kernel, ti: usize) -> isize {
    into_ret("task_info", task_info(kernel, ti))
}

fn task_info(kernel: &mut Kernel, ti: usize) -> KernelResult<isize> {
    let pid = caller(kernel)?;
    let now = kernel.ticks();
    let task = kernel.task(pid).ok_or(KernelError::NoSuchTask(pid))?;
    let elapsed = task.first_run.map_or(0, |start| now.saturating_sub(start));
    let info = TaskInfo {
        status: status_code(task.status),
        syscall_times: task.syscall_times,
        time: kernel.config().ticks_to_ms(elapsed),
    };
    kernel.copy_to_user(pid, ti, &info.to_bytes())?;
    Ok(0)
}
