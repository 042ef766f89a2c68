use crate::operand::{Address, Operand, Reg};
use core::fmt;
use vmx86_decoder::Mnemonic;
use vmx86_types::{Cond, FlagSet, Width};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Adc,
    Sub,
    Sbb,
    And,
    Or,
    Xor,
}

impl AluOp {
    pub fn name(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Adc => "adc",
            AluOp::Sub => "sub",
            AluOp::Sbb => "sbb",
            AluOp::And => "and",
            AluOp::Or => "or",
            AluOp::Xor => "xor",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
}

impl ShiftOp {
    pub fn name(self) -> &'static str {
        match self {
            ShiftOp::Shl => "shl",
            ShiftOp::Shr => "shr",
            ShiftOp::Sar => "sar",
            ShiftOp::Rol => "rol",
            ShiftOp::Ror => "ror",
        }
    }

    pub fn is_rotate(self) -> bool {
        matches!(self, ShiftOp::Rol | ShiftOp::Ror)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftCount {
    Imm(u8),
    Cl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOp {
    Test,
    Set,
    Reset,
    Complement,
}

impl BitOp {
    pub fn name(self) -> &'static str {
        match self {
            BitOp::Test => "bt",
            BitOp::Set => "bts",
            BitOp::Reset => "btr",
            BitOp::Complement => "btc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringOp {
    Movs,
    Stos,
}

/// Instructions whose only effect is to raise a trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapInst {
    /// `int3`: reported with RIP after the instruction.
    Breakpoint,
    /// `ud0`/`ud1`/`ud2`.
    Undefined,
    /// `hlt` and `int n` (n != 3): privileged in user mode.
    Privileged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstKind {
    Mov {
        dst: Operand,
        src: Operand,
        width: Width,
    },
    /// `movzx`/`movsx`/`movsxd`.
    MovExtend {
        dst: Reg,
        src: Operand,
        src_width: Width,
        signed: bool,
    },
    Lea {
        dst: Reg,
        addr: Address,
    },
    Xchg {
        dst: Operand,
        src: Reg,
        width: Width,
    },
    Cmovcc {
        cond: Cond,
        dst: Reg,
        src: Operand,
        width: Width,
    },
    Setcc {
        cond: Cond,
        dst: Operand,
    },
    Push {
        src: Operand,
        width: Width,
    },
    Pop {
        dst: Operand,
        width: Width,
    },
    Leave,
    Bswap {
        reg: Reg,
    },
    /// `cbw`/`cwde`/`cdqe`: sign-extend the lower half of the accumulator; `width` is the
    /// destination width.
    SignExtendAcc {
        width: Width,
    },
    /// `cwd`/`cdq`/`cqo`: fill the data register with the accumulator's sign.
    SignSplitAcc {
        width: Width,
    },
    Alu {
        op: AluOp,
        dst: Operand,
        src: Operand,
        width: Width,
    },
    Cmp {
        lhs: Operand,
        rhs: Operand,
        width: Width,
    },
    Test {
        lhs: Operand,
        rhs: Operand,
        width: Width,
    },
    Inc {
        dst: Operand,
        width: Width,
    },
    Dec {
        dst: Operand,
        width: Width,
    },
    Neg {
        dst: Operand,
        width: Width,
    },
    Not {
        dst: Operand,
        width: Width,
    },
    Shift {
        op: ShiftOp,
        dst: Operand,
        count: ShiftCount,
        width: Width,
    },
    /// Two- and three-operand `imul`; the product is truncated to `width`.
    Imul {
        dst: Reg,
        src: Operand,
        imm: Option<u64>,
        width: Width,
    },
    /// One-operand `mul`/`imul`: accumulator times `src` into the data:accumulator pair.
    MulWide {
        signed: bool,
        src: Operand,
        width: Width,
    },
    Div {
        signed: bool,
        src: Operand,
        width: Width,
    },
    Bit {
        op: BitOp,
        dst: Operand,
        bit: Operand,
        width: Width,
    },
    BitScan {
        reverse: bool,
        dst: Reg,
        src: Operand,
        width: Width,
    },
    Xadd {
        dst: Operand,
        src: Reg,
        width: Width,
    },
    Cmpxchg {
        dst: Operand,
        src: Reg,
        width: Width,
    },
    Jmp {
        target: u64,
    },
    JmpIndirect {
        target: Operand,
    },
    Jcc {
        cond: Cond,
        target: u64,
    },
    Call {
        target: u64,
    },
    CallIndirect {
        target: Operand,
    },
    Ret {
        pop: u16,
    },
    Syscall,
    String {
        op: StringOp,
        width: Width,
    },
    SetDirection {
        down: bool,
    },
    Nop,
    Cpuid,
    Rdtsc,
    Trap(TrapInst),
    /// Decodes fine but has no lowering.
    Unsupported(Mnemonic),
}

/// Flags an instruction consumes and produces. Undefined outputs are left out of `writes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlagsEffect {
    pub reads: FlagSet,
    pub writes: FlagSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInst {
    pub rip: u64,
    pub len: u8,
    pub kind: InstKind,
    pub lock: bool,
    /// `rep`/`repe`/`repne` on a string instruction.
    pub rep: bool,
}

impl DecodedInst {
    #[must_use]
    pub fn next_rip(&self) -> u64 {
        self.rip.wrapping_add(self.len as u64)
    }

    /// True for anything that leaves straight-line execution: branches, calls, returns, the
    /// syscall gate and trap-raising instructions.
    #[must_use]
    pub fn is_block_terminator(&self) -> bool {
        matches!(
            self.kind,
            InstKind::Jmp { .. }
                | InstKind::JmpIndirect { .. }
                | InstKind::Jcc { .. }
                | InstKind::Call { .. }
                | InstKind::CallIndirect { .. }
                | InstKind::Ret { .. }
                | InstKind::Syscall
                | InstKind::Trap(_)
        )
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self.kind, InstKind::Unsupported(_))
    }

    pub fn flags_effect(&self) -> FlagsEffect {
        let none = FlagSet::empty();
        let (reads, writes) = match &self.kind {
            InstKind::Alu { op, .. } => match op {
                AluOp::Adc | AluOp::Sbb => (FlagSet::CF, FlagSet::STATUS),
                _ => (none, FlagSet::STATUS),
            },
            InstKind::Cmp { .. }
            | InstKind::Test { .. }
            | InstKind::Neg { .. }
            | InstKind::Xadd { .. }
            | InstKind::Cmpxchg { .. } => (none, FlagSet::STATUS),
            InstKind::Inc { .. } | InstKind::Dec { .. } => (none, FlagSet::STATUS_NO_CF),
            InstKind::Shift { op, .. } if op.is_rotate() => (none, FlagSet::CF | FlagSet::OF),
            InstKind::Shift { .. } => (none, FlagSet::STATUS),
            InstKind::Imul { .. } | InstKind::MulWide { .. } => (none, FlagSet::CF | FlagSet::OF),
            InstKind::Bit { .. } => (none, FlagSet::CF),
            InstKind::BitScan { .. } => (none, FlagSet::ZF),
            InstKind::Jcc { cond, .. }
            | InstKind::Setcc { cond, .. }
            | InstKind::Cmovcc { cond, .. } => (cond.reads(), none),
            InstKind::String { .. } => (FlagSet::DF, none),
            InstKind::SetDirection { .. } => (none, FlagSet::DF),
            // `syscall` saves RFLAGS into r11.
            InstKind::Syscall => (FlagSet::all(), none),
            _ => (none, none),
        };
        FlagsEffect { reads, writes }
    }
}

impl fmt::Display for DecodedInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lock {
            f.write_str("lock ")?;
        }
        if self.rep {
            f.write_str("rep ")?;
        }
        write!(f, "{}", self.kind)
    }
}

fn width_suffix(width: Width) -> &'static str {
    match width {
        Width::W8 => "b",
        Width::W16 => "w",
        Width::W32 => "d",
        Width::W64 => "q",
    }
}

impl fmt::Display for InstKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstKind::Mov { dst, src, .. } => write!(f, "mov {dst}, {src}"),
            InstKind::MovExtend {
                dst, src, signed, ..
            } => {
                let m = if *signed { "movsx" } else { "movzx" };
                write!(f, "{m} {dst}, {src}")
            }
            InstKind::Lea { dst, addr } => write!(f, "lea {dst}, {addr}"),
            InstKind::Xchg { dst, src, .. } => write!(f, "xchg {dst}, {src}"),
            InstKind::Cmovcc { cond, dst, src, .. } => {
                write!(f, "cmov{} {dst}, {src}", cond.suffix())
            }
            InstKind::Setcc { cond, dst } => write!(f, "set{} {dst}", cond.suffix()),
            InstKind::Push { src, .. } => write!(f, "push {src}"),
            InstKind::Pop { dst, .. } => write!(f, "pop {dst}"),
            InstKind::Leave => f.write_str("leave"),
            InstKind::Bswap { reg } => write!(f, "bswap {reg}"),
            InstKind::SignExtendAcc { width } => f.write_str(match width {
                Width::W16 => "cbw",
                Width::W32 => "cwde",
                _ => "cdqe",
            }),
            InstKind::SignSplitAcc { width } => f.write_str(match width {
                Width::W16 => "cwd",
                Width::W32 => "cdq",
                _ => "cqo",
            }),
            InstKind::Alu { op, dst, src, .. } => write!(f, "{} {dst}, {src}", op.name()),
            InstKind::Cmp { lhs, rhs, .. } => write!(f, "cmp {lhs}, {rhs}"),
            InstKind::Test { lhs, rhs, .. } => write!(f, "test {lhs}, {rhs}"),
            InstKind::Inc { dst, .. } => write!(f, "inc {dst}"),
            InstKind::Dec { dst, .. } => write!(f, "dec {dst}"),
            InstKind::Neg { dst, .. } => write!(f, "neg {dst}"),
            InstKind::Not { dst, .. } => write!(f, "not {dst}"),
            InstKind::Shift { op, dst, count, .. } => match count {
                ShiftCount::Imm(n) => write!(f, "{} {dst}, {n}", op.name()),
                ShiftCount::Cl => write!(f, "{} {dst}, cl", op.name()),
            },
            InstKind::Imul { dst, src, imm, .. } => match imm {
                Some(imm) => write!(f, "imul {dst}, {src}, 0x{imm:x}"),
                None => write!(f, "imul {dst}, {src}"),
            },
            InstKind::MulWide { signed, src, .. } => {
                write!(f, "{} {src}", if *signed { "imul" } else { "mul" })
            }
            InstKind::Div { signed, src, .. } => {
                write!(f, "{} {src}", if *signed { "idiv" } else { "div" })
            }
            InstKind::Bit { op, dst, bit, .. } => write!(f, "{} {dst}, {bit}", op.name()),
            InstKind::BitScan {
                reverse, dst, src, ..
            } => write!(f, "{} {dst}, {src}", if *reverse { "bsr" } else { "bsf" }),
            InstKind::Xadd { dst, src, .. } => write!(f, "xadd {dst}, {src}"),
            InstKind::Cmpxchg { dst, src, .. } => write!(f, "cmpxchg {dst}, {src}"),
            InstKind::Jmp { target } => write!(f, "jmp 0x{target:x}"),
            InstKind::JmpIndirect { target } => write!(f, "jmp {target}"),
            InstKind::Jcc { cond, target } => write!(f, "j{} 0x{target:x}", cond.suffix()),
            InstKind::Call { target } => write!(f, "call 0x{target:x}"),
            InstKind::CallIndirect { target } => write!(f, "call {target}"),
            InstKind::Ret { pop: 0 } => f.write_str("ret"),
            InstKind::Ret { pop } => write!(f, "ret 0x{pop:x}"),
            InstKind::Syscall => f.write_str("syscall"),
            InstKind::String { op, width } => {
                let m = match op {
                    StringOp::Movs => "movs",
                    StringOp::Stos => "stos",
                };
                write!(f, "{m}{}", width_suffix(*width))
            }
            InstKind::SetDirection { down: true } => f.write_str("std"),
            InstKind::SetDirection { down: false } => f.write_str("cld"),
            InstKind::Nop => f.write_str("nop"),
            InstKind::Cpuid => f.write_str("cpuid"),
            InstKind::Rdtsc => f.write_str("rdtsc"),
            InstKind::Trap(TrapInst::Breakpoint) => f.write_str("int3"),
            InstKind::Trap(TrapInst::Undefined) => f.write_str("ud2"),
            InstKind::Trap(TrapInst::Privileged) => f.write_str("hlt"),
            InstKind::Unsupported(m) => write!(f, "{m:?} (unsupported)"),
        }
    }
}
