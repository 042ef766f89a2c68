//! Block translator: discovers a guest basic block, lowers each instruction to micro-ops and
//! runs block-local passes over the result.
//!
//! Translation only reads guest code through a [`CodeSource`]; it never touches CPU state and
//! never writes guest memory. Executing a [`Block`] is the CPU core's job.

pub mod block;
pub mod ir;
pub mod opt;
pub mod translate;

pub use block::{discover_block, BasicBlock, BlockEndKind, BlockLimits, CodeSource};
pub use ir::{Block, IrInst, Terminator, TrapKind, ValueId};
pub use translate::{build, translate_block, TranslateOptions};

use vmx86_mem::MemoryFault;
use vmx86_x86::{DecodeFailure, Mnemonic};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslateError {
    #[error(transparent)]
    Decode(#[from] DecodeFailure),
    #[error("instruction fetch failed: {0}")]
    Fetch(#[from] MemoryFault),
    #[error("unsupported instruction `{mnemonic:?}` at {rip:#x}")]
    Unsupported { rip: u64, mnemonic: Mnemonic },
}

impl TranslateError {
    /// Guest address the failure is attributed to.
    pub fn rip(&self) -> u64 {
        match self {
            TranslateError::Decode(d) => d.rip,
            TranslateError::Fetch(f) => f.addr,
            TranslateError::Unsupported { rip, .. } => *rip,
        }
    }
}
