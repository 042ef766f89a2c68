//! Normalized x86-64 instruction descriptors.
//!
//! The raw decoder output is rich but awkward to lower. [`decode`] turns it into a
//! [`DecodedInst`]: a closed [`InstKind`] with register/immediate/memory operands, the encoded
//! length and the flags the instruction reads and writes. Anything outside the supported set
//! still decodes, as [`InstKind::Unsupported`], so callers can tell "not x86" apart from "not
//! implemented here".

mod inst;
mod normalize;
mod operand;

pub use inst::{
    AluOp, BitOp, DecodedInst, FlagsEffect, InstKind, ShiftCount, ShiftOp, StringOp, TrapInst,
};
pub use operand::{Address, Operand, Reg, SegBase};
pub use vmx86_decoder::{DecodeError, DecodeMode, Mnemonic, MAX_INSTRUCTION_LEN};

/// A byte sequence that is not a valid instruction in the requested mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot decode instruction at {rip:#x}: {kind}")]
pub struct DecodeFailure {
    pub rip: u64,
    pub kind: DecodeError,
}

/// Decode and normalize the instruction starting at `bytes[0]`, located at guest address `rip`.
pub fn decode(mode: DecodeMode, rip: u64, bytes: &[u8]) -> Result<DecodedInst, DecodeFailure> {
    let decoded =
        vmx86_decoder::decode_one(mode, rip, bytes).map_err(|kind| DecodeFailure { rip, kind })?;
    Ok(normalize::normalize(mode, rip, &decoded))
}
