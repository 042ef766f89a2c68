//! Per-thread execution engine.
//!
//! An [`Engine`] owns one thread's [`CpuState`] and drives it through
//! `Fetch -> Execute -> Transfer -> Fetch`, detouring through `Trap` when a block faults, until
//! it reaches `Halted`. Everything else it touches (address space, translation cache, signal
//! handlers, syscall policy) belongs to the [`Process`] and is shared with sibling engines.

use crate::interp::{BlockExit, Interpreter};
use crate::process::Process;
use crate::signal;
use crate::state::CpuState;
use crate::syscall::{SyscallContext, SyscallOutcome};
use crate::trace::{register_deltas, TraceEvent};
use crate::trap::{Trap, TrapCause};
use core::fmt;
use std::sync::Arc;
use vmx86_jit::{Block, TranslateError};
use vmx86_types::Gpr;

/// Why a thread stopped for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The thread called `exit`.
    Exited(i32),
    /// Some thread of the process called `exit_group`.
    ExitGroup(i32),
    /// Killed by a signal the guest could not handle.
    Signaled(u32),
    /// The emulator cannot continue this thread.
    Fatal(TranslateError),
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Exited(code) => write!(f, "exited with code {code}"),
            ExitReason::ExitGroup(code) => write!(f, "process exited with code {code}"),
            ExitReason::Signaled(signo) => write!(f, "killed by signal {signo}"),
            ExitReason::Fatal(err) => write!(f, "fatal emulation error: {err}"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum EngineState {
    /// Resolve `rip` to a translated block.
    Fetch,
    Execute(Arc<Block>),
    /// `rip` is `next_rip`; with `syscall`, the syscall boundary runs before the next fetch.
    Transfer { next_rip: u64, syscall: bool },
    Trap(Trap),
    Halted(ExitReason),
}

/// Runs one guest thread.
pub struct Engine {
    process: Arc<Process>,
    tid: u32,
    cpu: CpuState,
    interp: Interpreter,
    state: EngineState,
    blocks_executed: u64,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("tid", &self.tid)
            .field("rip", &format_args!("{:#x}", self.cpu.rip))
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub(crate) fn new(process: Arc<Process>, tid: u32, cpu: CpuState) -> Self {
        Self {
            process,
            tid,
            cpu,
            interp: Interpreter::new(),
            state: EngineState::Fetch,
            blocks_executed: 0,
        }
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn cpu(&self) -> &CpuState {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut CpuState {
        &mut self.cpu
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn blocks_executed(&self) -> u64 {
        self.blocks_executed
    }

    pub fn exit_reason(&self) -> Option<&ExitReason> {
        match &self.state {
            EngineState::Halted(reason) => Some(reason),
            _ => None,
        }
    }

    /// Make one state transition. Does nothing once halted.
    pub fn step(&mut self) -> &EngineState {
        let state = std::mem::replace(&mut self.state, EngineState::Fetch);
        self.state = match state {
            EngineState::Fetch => self.fetch(),
            EngineState::Execute(block) => self.execute(&block),
            EngineState::Transfer { next_rip, syscall } => self.transfer(next_rip, syscall),
            EngineState::Trap(trap) => self.trap(trap),
            halted @ EngineState::Halted(_) => halted,
        };
        &self.state
    }

    /// Run until the thread halts.
    pub fn run(&mut self) -> ExitReason {
        loop {
            if let EngineState::Halted(reason) = self.step() {
                return reason.clone();
            }
        }
    }

    /// Run at most `blocks` more blocks, stopping at a block boundary. Returns the exit
    /// reason if the thread halted.
    pub fn run_blocks(&mut self, blocks: u64) -> Option<&ExitReason> {
        let target = self.blocks_executed.saturating_add(blocks);
        loop {
            match self.state {
                EngineState::Halted(_) => break,
                EngineState::Fetch if self.blocks_executed >= target => break,
                _ => {
                    self.step();
                }
            }
        }
        self.exit_reason()
    }

    fn fetch(&mut self) -> EngineState {
        if let Some(code) = self.process.exit_code() {
            return self.halt(ExitReason::ExitGroup(code));
        }
        let rip = self.cpu.rip;
        match self
            .process
            .cache()
            .lookup_or_build(rip, self.cpu.mode.decode_mode())
        {
            Ok(block) => EngineState::Execute(block),
            Err(TranslateError::Decode(failure)) => EngineState::Trap(Trap {
                rip,
                cause: TrapCause::Decode(failure),
            }),
            Err(TranslateError::Fetch(fault)) => EngineState::Trap(Trap {
                rip,
                cause: TrapCause::Memory(fault),
            }),
            Err(err @ TranslateError::Unsupported { .. }) => {
                tracing::warn!(tid = self.tid, %err, "cannot translate guest code");
                self.halt(ExitReason::Fatal(err))
            }
        }
    }

    fn execute(&mut self, block: &Block) -> EngineState {
        let before = self.process.config().trace_blocks.then_some(self.cpu.gpr);
        let exit = self.interp.execute(
            block,
            &mut self.cpu,
            self.process.mem(),
            self.process.cpuid(),
        );
        self.blocks_executed += 1;

        let (next_rip, syscall) = match exit {
            BlockExit::Jump { next_rip } => (next_rip, false),
            BlockExit::Syscall { next_rip } => (next_rip, true),
            BlockExit::Trap(trap) => return EngineState::Trap(trap),
        };
        if let (Some(before), Some(sink)) = (before, self.process.trace()) {
            sink.record(&TraceEvent::Block {
                tid: self.tid,
                entry: block.entry,
                insts: block.guest_insts,
                next_rip,
                deltas: register_deltas(&before, &self.cpu.gpr),
            });
        }
        EngineState::Transfer { next_rip, syscall }
    }

    fn transfer(&mut self, next_rip: u64, syscall: bool) -> EngineState {
        self.cpu.set_rip(next_rip);
        if !syscall {
            return EngineState::Fetch;
        }

        // What the `syscall` instruction itself does to the registers.
        self.cpu.set_gpr(Gpr::Rcx, self.cpu.rip);
        self.cpu.set_gpr(Gpr::R11, self.cpu.rflags());

        let nr = self.cpu.gpr(Gpr::Rax);
        let process = self.process.clone();
        let ctx = SyscallContext {
            tid: self.tid,
            process: &process,
        };
        let result = process
            .syscalls()
            .handle_syscall(&mut self.cpu, process.mem(), &ctx);
        tracing::trace!(tid = self.tid, nr, ?result, "syscall");

        let (next, ret) = match result {
            Ok(SyscallOutcome::Return(value)) => {
                self.cpu.set_gpr(Gpr::Rax, value);
                (EngineState::Fetch, value as i64)
            }
            Ok(SyscallOutcome::Restored) => {
                (EngineState::Fetch, self.cpu.gpr(Gpr::Rax) as i64)
            }
            Err(err) => {
                let value = err.to_return_value();
                self.cpu.set_gpr(Gpr::Rax, value);
                (EngineState::Fetch, value as i64)
            }
            Ok(SyscallOutcome::ExitThread(code)) => {
                self.record_syscall(nr, i64::from(code));
                return self.halt(ExitReason::Exited(code));
            }
            Ok(SyscallOutcome::ExitGroup(code)) => {
                self.process.request_exit(code);
                self.record_syscall(nr, i64::from(code));
                let code = self.process.exit_code().unwrap_or(code);
                return self.halt(ExitReason::ExitGroup(code));
            }
        };
        self.record_syscall(nr, ret);
        next
    }

    fn record_syscall(&self, nr: u64, ret: i64) {
        if let Some(sink) = self.process.trace() {
            sink.record(&TraceEvent::Syscall {
                tid: self.tid,
                nr,
                ret,
            });
        }
    }

    fn trap(&mut self, trap: Trap) -> EngineState {
        let sig = trap.signal();
        tracing::debug!(tid = self.tid, %trap, signo = sig.signo, "guest trap");
        if let Some(sink) = self.process.trace() {
            sink.record(&TraceEvent::Trap {
                tid: self.tid,
                rip: trap.rip,
                signo: sig.signo,
                addr: sig.addr,
            });
        }
        self.cpu.pending_signal = Some(sig);
        match signal::deliver(
            &mut self.cpu,
            self.process.mem(),
            self.process.signals(),
            sig,
        ) {
            Ok(()) => EngineState::Fetch,
            Err(err) => {
                tracing::debug!(tid = self.tid, %err, "signal not deliverable");
                self.halt(ExitReason::Signaled(err.signo()))
            }
        }
    }

    fn halt(&self, reason: ExitReason) -> EngineState {
        tracing::debug!(tid = self.tid, rip = self.cpu.rip, %reason, "thread halted");
        if let Some(sink) = self.process.trace() {
            sink.record(&TraceEvent::Exit {
                tid: self.tid,
                reason: reason.to_string(),
            });
        }
        EngineState::Halted(reason)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.process.deregister(self.tid);
    }
}
