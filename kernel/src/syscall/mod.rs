//! System call dispatch
//!
//! The trap handler passes the syscall number (a7) and three arguments
//! (a0..a2). Every handler returns the value placed in a0; failures are
//! negative.

mod memory;
mod process;

use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::task::{Pid, WaitReason, WakeReason};
use crate::trap::TrapContext;

use memory::*;
use process::*;

pub const SYSCALL_SLEEP: usize = 101;
pub const SYSCALL_EXIT: usize = 93;
pub const SYSCALL_YIELD: usize = 124;
pub const SYSCALL_KILL: usize = 129;
pub const SYSCALL_SIGPROCMASK: usize = 135;
pub const SYSCALL_GET_TIME: usize = 169;
pub const SYSCALL_GETPID: usize = 172;
pub const SYSCALL_SBRK: usize = 214;
pub const SYSCALL_MUNMAP: usize = 215;
pub const SYSCALL_FORK: usize = 220;
pub const SYSCALL_MMAP: usize = 222;
pub const SYSCALL_WAITPID: usize = 260;
pub const SYSCALL_TASK_INFO: usize = 410;

/// Interrupted system call
pub const EINTR: isize = 4;

pub fn syscall(kernel: &mut Kernel, syscall_id: usize, args: [usize; 3]) -> isize {
    if let Some(pid) = kernel.current_pid() {
        if let Some(task) = kernel.tasks.get_mut(pid) {
            task.record_syscall(syscall_id);
        }
    }
    match syscall_id {
        SYSCALL_SLEEP => sys_sleep(kernel, args[0]),
        SYSCALL_EXIT => sys_exit(kernel, args[0] as i32),
        SYSCALL_YIELD => sys_yield(kernel),
        SYSCALL_KILL => sys_kill(kernel, args[0], args[1]),
        SYSCALL_SIGPROCMASK => sys_sigprocmask(kernel, args[0]),
        SYSCALL_GET_TIME => sys_get_time(kernel, args[0], args[1]),
        SYSCALL_GETPID => sys_getpid(kernel),
        SYSCALL_SBRK => sys_sbrk(kernel, args[0] as i32),
        SYSCALL_MUNMAP => sys_munmap(kernel, args[0], args[1]),
        SYSCALL_FORK => sys_fork(kernel),
        SYSCALL_MMAP => sys_mmap(kernel, args[0], args[1], args[2]),
        SYSCALL_WAITPID => sys_waitpid(kernel, args[0] as isize, args[1]),
        SYSCALL_TASK_INFO => sys_task_info(kernel, args[0]),
        _ => {
            log::warn!("unsupported syscall id {}", syscall_id);
            -1
        }
    }
}

fn caller(kernel: &Kernel) -> KernelResult<Pid> {
    kernel.current_pid().ok_or(KernelError::InvalidState)
}

fn into_ret(syscall: &str, result: KernelResult<isize>) -> isize {
    result.unwrap_or_else(|err| {
        log::warn!("{} failed: {}", syscall, err);
        -1
    })
}

/// Finish the syscall a task blocked in, now that it leaves `Blocked`.
/// An interrupted wait fails with `-EINTR`; a child wait that ends any
/// other way restarts the `ecall` so the child is collected.
pub(crate) fn complete_wait(cx: &mut TrapContext, wait: WaitReason, reason: WakeReason) {
    match (wait, reason) {
        (_, WakeReason::Interrupted) => cx.x[10] = -EINTR as usize,
        (WaitReason::Child, _) => cx.sepc = cx.sepc.wrapping_sub(4),
        _ => cx.x[10] = 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    #[test]
    fn interrupted_waits_return_eintr() {
        let mut cx = TrapContext::app_init_context(0x1_0000, 0, 0, 0, 0);
        complete_wait(&mut cx, WaitReason::Sleep, WakeReason::Interrupted);
        assert_eq!(cx.x[10] as isize, -EINTR);
        complete_wait(&mut cx, WaitReason::Sleep, WakeReason::Timeout);
        assert_eq!(cx.x[10], 0);
    }

    #[test]
    fn child_wait_restarts_the_call() {
        let mut cx = TrapContext::app_init_context(0x1_0004, 0, 0, 0, 0);
        complete_wait(&mut cx, WaitReason::Child, WakeReason::ChildExited);
        assert_eq!(cx.sepc, 0x1_0000);
    }

    #[test]
    fn unknown_syscall_fails() {
        let mut kernel = test_util::kernel(64);
        let pid = kernel.spawn(&test_util::app_image(&[])).unwrap();
        kernel.schedule();
        assert_eq!(syscall(&mut kernel, 9999, [0; 3]), -1);
        assert_eq!(kernel.current_pid(), Some(pid));
    }
}
