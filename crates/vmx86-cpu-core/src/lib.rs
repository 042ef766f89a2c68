//! CPU core: CPU state, the translation cache, the micro-op interpreter and the per-thread
//! execution engine that ties them to a shared address space.
//!
//! A [`Process`] owns what its threads share; [`Process::spawn_thread`] hands out an
//! [`Engine`] per guest thread. System-call policy is supplied from outside through
//! [`SyscallHandler`].

pub mod cache;
pub mod config;
pub mod cpuid;
pub mod exec;
pub mod interp;
pub mod process;
pub mod signal;
pub mod state;
pub mod syscall;
pub mod trace;
pub mod trap;

pub use cache::{CacheStats, TranslationCache};
pub use config::{ConfigError, VmConfig, MAX_STACK_SIZE};
pub use cpuid::{CpuidResult, CpuidTable};
pub use exec::{Engine, EngineState, ExitReason};
pub use interp::{BlockExit, Interpreter};
pub use process::{Process, ThreadInfo};
pub use signal::{SigAction, SignalTable};
pub use state::{CpuMode, CpuState, PendingSignal};
pub use syscall::{SyscallContext, SyscallError, SyscallHandler, SyscallOutcome};
pub use trace::{JsonLinesTraceSink, MemoryTraceSink, RegDelta, TraceEvent, TraceSink};
pub use trap::{Trap, TrapCause};
