//! The boundary between the engine and system-call policy.
//!
//! The engine calls [`SyscallHandler::handle_syscall`] synchronously at every `syscall`, with
//! `rip` already advanced past the instruction and RCX/R11 loaded the way the instruction
//! loads them. Syscall numbers are opaque to the core; it only applies the outcome.

use crate::process::Process;
use crate::state::CpuState;
use vmx86_mem::AddressSpace;

/// A failed system call. Reaches the guest as `-errno` in RAX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("system call failed with errno {errno}")]
pub struct SyscallError {
    pub errno: i32,
}

impl SyscallError {
    pub const fn new(errno: i32) -> Self {
        Self { errno }
    }

    /// The value left in RAX.
    pub fn to_return_value(self) -> u64 {
        (-i64::from(self.errno)) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Store the value in RAX and continue.
    Return(u64),
    /// The handler rewrote the whole CPU state (`rt_sigreturn`); leave RAX alone.
    Restored,
    /// Terminate the calling thread.
    ExitThread(i32),
    /// Terminate every thread of the process.
    ExitGroup(i32),
}

/// Who is making the call.
#[derive(Clone, Copy)]
pub struct SyscallContext<'a> {
    pub tid: u32,
    pub process: &'a Process,
}

pub trait SyscallHandler: Send + Sync {
    fn handle_syscall(
        &self,
        cpu: &mut CpuState,
        mem: &AddressSpace,
        ctx: &SyscallContext<'_>,
    ) -> Result<SyscallOutcome, SyscallError>;
}

impl<F> SyscallHandler for F
where
    F: Fn(&mut CpuState, &AddressSpace, &SyscallContext<'_>) -> Result<SyscallOutcome, SyscallError>
        + Send
        + Sync,
{
    fn handle_syscall(
        &self,
        cpu: &mut CpuState,
        mem: &AddressSpace,
        ctx: &SyscallContext<'_>,
    ) -> Result<SyscallOutcome, SyscallError> {
        self(cpu, mem, ctx)
    }
}
