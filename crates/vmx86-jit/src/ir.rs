//! Micro-operation IR for one translated block.
//!
//! A block is a straight-line list of [`IrInst`] followed by exactly one [`Terminator`]. Values
//! are single-assignment 64-bit slots numbered by [`ValueId`]; nothing is ever read before it is
//! written.
//!
//! Each guest instruction starts with an [`IrInst::InstStart`] marker. Within one guest
//! instruction every fallible operation (loads, stores, atomics, division, string helpers)
//! precedes the architectural state updates (`WriteReg`, `WriteFlag`, `Flags`), so a fault
//! leaves registers and flags exactly as they were before the instruction.

use core::fmt;
use vmx86_types::{Cond, Flag, FlagSet, Gpr, Width};
use vmx86_x86::{SegBase, StringOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestReg {
    /// Sub-register view. Reads zero-extend; 32-bit writes clear bits 63:32, narrower writes
    /// merge.
    Gpr { reg: Gpr, width: Width, high8: bool },
    Rip,
    SegBase(SegBase),
}

impl GuestReg {
    pub const fn gpr(reg: Gpr, width: Width) -> Self {
        GuestReg::Gpr {
            reg,
            width,
            high8: false,
        }
    }
}

impl fmt::Display for GuestReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestReg::Gpr { reg, width, high8 } => {
                let r = vmx86_x86::Reg {
                    gpr: *reg,
                    width: *width,
                    high8: *high8,
                };
                write!(f, "{r}")
            }
            GuestReg::Rip => f.write_str("rip"),
            GuestReg::SegBase(SegBase::Fs) => f.write_str("fs.base"),
            GuestReg::SegBase(SegBase::Gs) => f.write_str("gs.base"),
        }
    }
}

/// Pure arithmetic. The result is truncated to the operation width; shift and rotate counts
/// are used as given (masking is the lowering's job).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
    /// Low half of the product.
    Mul,
    /// 1 if equal, else 0.
    Eq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
    Bswap,
    /// Index of the lowest set bit; the operand must be non-zero.
    Bsf,
    /// Index of the highest set bit; the operand must be non-zero.
    Bsr,
}

/// How a [`IrInst::Flags`] update derives the flags from its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOp {
    /// `result = lhs + rhs (+ carry)`.
    Add,
    Adc,
    /// `result = lhs - rhs (- borrow)`.
    Sub,
    Sbb,
    /// `and`/`or`/`xor`/`test`: CF and OF cleared.
    Logic,
    /// `lhs` is the original value, `rhs` the masked count. A zero count leaves flags alone.
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
    /// `lhs` is the high half, `result` the low half of a product.
    MulUnsigned,
    MulSigned,
    /// `lhs` is the tested value, `rhs` the bit index; sets CF.
    BitTest,
    /// `lhs` is the scanned source; sets ZF when it is zero.
    BitScan,
}

impl FlagOp {
    pub fn is_shift(self) -> bool {
        matches!(
            self,
            FlagOp::Shl | FlagOp::Shr | FlagOp::Sar | FlagOp::Rol | FlagOp::Ror
        )
    }
}

/// Atomic read-modify-write flavors. The old value is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmwOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Xchg,
    Neg,
}

impl RmwOp {
    pub fn apply(self, width: Width, old: u64, src: u64) -> u64 {
        width.truncate(match self {
            RmwOp::Add => old.wrapping_add(src),
            RmwOp::Sub => old.wrapping_sub(src),
            RmwOp::And => old & src,
            RmwOp::Or => old | src,
            RmwOp::Xor => old ^ src,
            RmwOp::Xchg => src,
            RmwOp::Neg => old.wrapping_neg(),
        })
    }
}

/// Operations that touch more state than an SSA value can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Helper {
    /// Reads EAX/ECX, writes RAX/RBX/RCX/RDX.
    Cpuid,
    /// Writes EDX:EAX with the retired-instruction counter.
    Rdtsc,
    /// `movs`/`stos`, driven by RSI/RDI/RCX and DF. Partial progress of a faulting `rep` is
    /// kept, which makes the instruction restartable.
    String {
        op: StringOp,
        width: Width,
        rep: bool,
        addr_width: Width,
    },
}

impl Helper {
    pub fn is_fallible(self) -> bool {
        matches!(self, Helper::String { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrInst {
    /// Start of the guest instruction at `rip`.
    InstStart {
        rip: u64,
        len: u8,
    },
    Const {
        dst: ValueId,
        value: u64,
    },
    ReadReg {
        dst: ValueId,
        reg: GuestReg,
    },
    WriteReg {
        reg: GuestReg,
        src: ValueId,
    },
    ReadFlag {
        dst: ValueId,
        flag: Flag,
    },
    WriteFlag {
        flag: Flag,
        src: ValueId,
    },
    /// Zero- or sign-extend the low `from` bits of `src` to 64 bits.
    Ext {
        dst: ValueId,
        src: ValueId,
        from: Width,
        signed: bool,
    },
    BinOp {
        dst: ValueId,
        op: BinOp,
        lhs: ValueId,
        rhs: ValueId,
        width: Width,
    },
    UnOp {
        dst: ValueId,
        op: UnOp,
        src: ValueId,
        width: Width,
    },
    /// Update the flags in `mask` as `op` defines them. An empty mask is a no-op.
    Flags {
        op: FlagOp,
        width: Width,
        lhs: ValueId,
        rhs: ValueId,
        result: ValueId,
        mask: FlagSet,
    },
    EvalCond {
        dst: ValueId,
        cond: Cond,
    },
    Select {
        dst: ValueId,
        cond: ValueId,
        if_true: ValueId,
        if_false: ValueId,
    },
    Load {
        dst: ValueId,
        addr: ValueId,
        width: Width,
    },
    Store {
        addr: ValueId,
        src: ValueId,
        width: Width,
    },
    AtomicRmw {
        dst: ValueId,
        op: RmwOp,
        addr: ValueId,
        src: ValueId,
        width: Width,
    },
    /// Atomically store `new` if memory equals `expected`; `dst` receives the old value.
    CmpXchg {
        dst: ValueId,
        addr: ValueId,
        expected: ValueId,
        new: ValueId,
        width: Width,
    },
    /// Full double-width product of `lhs * rhs` at `width`.
    MulWide {
        lo: ValueId,
        hi: ValueId,
        lhs: ValueId,
        rhs: ValueId,
        width: Width,
        signed: bool,
    },
    /// Divide `hi:lo` by `divisor`. Raises a divide error on a zero divisor or a quotient that
    /// does not fit in `width`.
    DivWide {
        quot: ValueId,
        rem: ValueId,
        hi: ValueId,
        lo: ValueId,
        divisor: ValueId,
        width: Width,
        signed: bool,
    },
    Helper(Helper),
}

impl IrInst {
    /// True for operations that may raise a trap at run time.
    pub fn is_fallible(&self) -> bool {
        match self {
            IrInst::Load { .. }
            | IrInst::Store { .. }
            | IrInst::AtomicRmw { .. }
            | IrInst::CmpXchg { .. }
            | IrInst::DivWide { .. } => true,
            IrInst::Helper(h) => h.is_fallible(),
            _ => false,
        }
    }

    /// True for architectural state updates.
    pub fn is_commit(&self) -> bool {
        matches!(
            self,
            IrInst::WriteReg { .. } | IrInst::WriteFlag { .. } | IrInst::Flags { .. }
        )
    }

    /// Flags read by this operation.
    pub fn flags_read(&self) -> FlagSet {
        match self {
            IrInst::ReadFlag { flag, .. } => flag.as_set(),
            IrInst::EvalCond { cond, .. } => cond.reads(),
            IrInst::Helper(Helper::String { .. }) => FlagSet::DF,
            _ => FlagSet::empty(),
        }
    }

    /// Flags unconditionally overwritten by this operation.
    pub fn flags_killed(&self) -> FlagSet {
        match self {
            IrInst::WriteFlag { flag, .. } => flag.as_set(),
            IrInst::Flags { op, mask, .. } if !op.is_shift() => *mask,
            _ => FlagSet::empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// `int3`; reported after the instruction.
    Breakpoint,
    /// `ud2` and friends.
    InvalidOpcode,
    /// `hlt`, `int n`: privileged or unsupported gates in user mode.
    GeneralProtection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    Jump {
        target: u64,
    },
    CondJump {
        cond: ValueId,
        target: u64,
        fallthrough: u64,
    },
    IndirectJump {
        target: ValueId,
    },
    /// `syscall`; RIP continues at `next_rip` once the system call returns.
    Syscall {
        next_rip: u64,
    },
    Trap {
        kind: TrapKind,
        rip: u64,
    },
}

/// A translated block. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub entry: u64,
    /// One past the last guest byte the block was decoded from.
    pub end: u64,
    pub insts: Vec<IrInst>,
    pub terminator: Terminator,
    pub guest_insts: u32,
    pub value_count: u32,
}

impl Block {
    pub fn byte_len(&self) -> u64 {
        self.end - self.entry
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.entry <= addr && addr < self.end
    }

    /// Guest RIPs of the instructions in the block, in order.
    pub fn inst_rips(&self) -> impl Iterator<Item = u64> + '_ {
        self.insts.iter().filter_map(|i| match i {
            IrInst::InstStart { rip, .. } => Some(*rip),
            _ => None,
        })
    }
}

impl fmt::Display for IrInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrInst::InstStart { rip, len } => write!(f, "; {rip:#x} ({len} bytes)"),
            IrInst::Const { dst, value } => write!(f, "{dst} = const {value:#x}"),
            IrInst::ReadReg { dst, reg } => write!(f, "{dst} = {reg}"),
            IrInst::WriteReg { reg, src } => write!(f, "{reg} = {src}"),
            IrInst::ReadFlag { dst, flag } => write!(f, "{dst} = {flag:?}"),
            IrInst::WriteFlag { flag, src } => write!(f, "{flag:?} = {src}"),
            IrInst::Ext {
                dst,
                src,
                from,
                signed,
            } => {
                let op = if *signed { "sext" } else { "zext" };
                write!(f, "{dst} = {op}{from} {src}")
            }
            IrInst::BinOp {
                dst,
                op,
                lhs,
                rhs,
                width,
            } => write!(f, "{dst} = {op:?}.{width} {lhs}, {rhs}"),
            IrInst::UnOp { dst, op, src, width } => write!(f, "{dst} = {op:?}.{width} {src}"),
            IrInst::Flags {
                op,
                width,
                lhs,
                rhs,
                result,
                mask,
            } => write!(
                f,
                "flags[{:#x}] = {op:?}.{width} {lhs}, {rhs} -> {result}",
                mask.bits()
            ),
            IrInst::EvalCond { dst, cond } => write!(f, "{dst} = cond {}", cond.suffix()),
            IrInst::Select {
                dst,
                cond,
                if_true,
                if_false,
            } => write!(f, "{dst} = {cond} ? {if_true} : {if_false}"),
            IrInst::Load { dst, addr, width } => write!(f, "{dst} = load{width} [{addr}]"),
            IrInst::Store { addr, src, width } => write!(f, "store{width} [{addr}], {src}"),
            IrInst::AtomicRmw {
                dst,
                op,
                addr,
                src,
                width,
            } => write!(f, "{dst} = atomic {op:?}{width} [{addr}], {src}"),
            IrInst::CmpXchg {
                dst,
                addr,
                expected,
                new,
                width,
            } => write!(f, "{dst} = cmpxchg{width} [{addr}], {expected}, {new}"),
            IrInst::MulWide {
                lo,
                hi,
                lhs,
                rhs,
                width,
                signed,
            } => {
                let op = if *signed { "imul" } else { "mul" };
                write!(f, "{hi}:{lo} = {op}{width} {lhs}, {rhs}")
            }
            IrInst::DivWide {
                quot,
                rem,
                hi,
                lo,
                divisor,
                width,
                signed,
            } => {
                let op = if *signed { "idiv" } else { "div" };
                write!(f, "{quot}, {rem} = {op}{width} {hi}:{lo}, {divisor}")
            }
            IrInst::Helper(h) => write!(f, "helper {h:?}"),
        }
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Jump { target } => write!(f, "jump {target:#x}"),
            Terminator::CondJump {
                cond,
                target,
                fallthrough,
            } => write!(f, "if {cond} jump {target:#x} else {fallthrough:#x}"),
            Terminator::IndirectJump { target } => write!(f, "jump {target}"),
            Terminator::Syscall { next_rip } => write!(f, "syscall -> {next_rip:#x}"),
            Terminator::Trap { kind, rip } => write!(f, "trap {kind:?} at {rip:#x}"),
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "block {:#x}..{:#x}:", self.entry, self.end)?;
        for inst in &self.insts {
            writeln!(f, "  {inst}")?;
        }
        write!(f, "  {}", self.terminator)
    }
}
