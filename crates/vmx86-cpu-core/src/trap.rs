use crate::signal::{
    FPE_INTDIV, ILL_ILLOPC, ILL_ILLOPN, SEGV_ACCERR, SEGV_MAPERR, SIGFPE, SIGILL, SIGSEGV,
    SIGTRAP, SI_KERNEL,
};
use crate::state::PendingSignal;
use core::fmt;
use vmx86_mem::MemoryFault;
use vmx86_x86::DecodeFailure;

/// Why guest execution could not continue normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapCause {
    Memory(MemoryFault),
    Decode(DecodeFailure),
    /// `div`/`idiv` by zero or with a quotient too wide for the destination.
    DivideError,
    Breakpoint,
    InvalidOpcode,
    GeneralProtection,
}

/// A guest-visible fault, reported at `rip`.
///
/// For faults `rip` is the faulting instruction, which has had no architectural effect. For
/// `int3` it is the instruction after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trap {
    pub rip: u64,
    pub cause: TrapCause,
}

impl Trap {
    /// The Linux signal this trap is delivered as.
    pub fn signal(&self) -> PendingSignal {
        let (signo, code, addr) = match &self.cause {
            TrapCause::Memory(fault) => {
                let code = if fault.is_unmapped() {
                    SEGV_MAPERR
                } else {
                    SEGV_ACCERR
                };
                (SIGSEGV, code, fault.addr)
            }
            TrapCause::Decode(_) => (SIGILL, ILL_ILLOPC, self.rip),
            TrapCause::InvalidOpcode => (SIGILL, ILL_ILLOPN, self.rip),
            TrapCause::DivideError => (SIGFPE, FPE_INTDIV, self.rip),
            TrapCause::Breakpoint => (SIGTRAP, SI_KERNEL, 0),
            TrapCause::GeneralProtection => (SIGSEGV, SI_KERNEL, 0),
        };
        PendingSignal { signo, code, addr }
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            TrapCause::Memory(fault) => write!(f, "{fault} (rip {:#x})", self.rip),
            TrapCause::Decode(failure) => write!(f, "{failure}"),
            TrapCause::DivideError => write!(f, "divide error at {:#x}", self.rip),
            TrapCause::Breakpoint => write!(f, "breakpoint before {:#x}", self.rip),
            TrapCause::InvalidOpcode => write!(f, "invalid opcode at {:#x}", self.rip),
            TrapCause::GeneralProtection => write!(f, "general protection fault at {:#x}", self.rip),
        }
    }
}
