//! Maps the backend decoder's instruction model onto [`InstKind`].

use crate::inst::{
    AluOp, BitOp, DecodedInst, InstKind, ShiftCount, ShiftOp, StringOp, TrapInst,
};
use crate::operand::{Address, Operand, Reg, SegBase};
use vmx86_decoder::{DecodeMode, DecodedInstruction, Instruction, Mnemonic, OpKind, Register};
use vmx86_types::{Cond, Gpr, Width};

struct Ctx<'a> {
    mode: DecodeMode,
    instr: &'a Instruction,
    addr_override: bool,
}

pub(crate) fn normalize(mode: DecodeMode, rip: u64, decoded: &DecodedInstruction) -> DecodedInst {
    let instr = &decoded.instruction;
    let ctx = Ctx {
        mode,
        instr,
        addr_override: decoded.prefixes.address_size_override,
    };
    let mnemonic = instr.mnemonic();
    let kind = lower_kind(&ctx, mnemonic).unwrap_or(InstKind::Unsupported(mnemonic));
    let rep = matches!(kind, InstKind::String { .. })
        && (decoded.prefixes.rep || decoded.prefixes.repne);

    DecodedInst {
        rip,
        len: instr.len() as u8,
        kind,
        lock: decoded.prefixes.lock,
        rep,
    }
}

fn gpr_of(full: Register) -> Option<Gpr> {
    Some(match full {
        Register::RAX => Gpr::Rax,
        Register::RCX => Gpr::Rcx,
        Register::RDX => Gpr::Rdx,
        Register::RBX => Gpr::Rbx,
        Register::RSP => Gpr::Rsp,
        Register::RBP => Gpr::Rbp,
        Register::RSI => Gpr::Rsi,
        Register::RDI => Gpr::Rdi,
        Register::R8 => Gpr::R8,
        Register::R9 => Gpr::R9,
        Register::R10 => Gpr::R10,
        Register::R11 => Gpr::R11,
        Register::R12 => Gpr::R12,
        Register::R13 => Gpr::R13,
        Register::R14 => Gpr::R14,
        Register::R15 => Gpr::R15,
        _ => return None,
    })
}

fn reg_of(r: Register) -> Option<Reg> {
    let high = match r {
        Register::AH => Some(Gpr::Rax),
        Register::CH => Some(Gpr::Rcx),
        Register::DH => Some(Gpr::Rdx),
        Register::BH => Some(Gpr::Rbx),
        _ => None,
    };
    if let Some(gpr) = high {
        return Some(Reg::high8(gpr));
    }
    let width = if r.is_gpr8() {
        Width::W8
    } else if r.is_gpr16() {
        Width::W16
    } else if r.is_gpr32() {
        Width::W32
    } else if r.is_gpr64() {
        Width::W64
    } else {
        return None;
    };
    Some(Reg::new(gpr_of(r.full_register())?, width))
}

impl Ctx<'_> {
    fn addr_width(&self) -> Option<Width> {
        match (self.mode, self.addr_override) {
            (DecodeMode::Bits64, false) => Some(Width::W64),
            (DecodeMode::Bits64, true) | (DecodeMode::Bits32, false) => Some(Width::W32),
            // 16-bit addressing is not modeled.
            (DecodeMode::Bits32, true) => None,
        }
    }

    fn stack_width(&self) -> Width {
        match self.mode {
            DecodeMode::Bits64 => Width::W64,
            DecodeMode::Bits32 => Width::W32,
        }
    }

    fn address(&self) -> Option<Address> {
        let addr_width = self.addr_width()?;
        let seg = match self.instr.memory_segment() {
            Register::FS => Some(SegBase::Fs),
            Register::GS => Some(SegBase::Gs),
            _ => None,
        };
        let base_reg = self.instr.memory_base();
        if matches!(base_reg, Register::RIP | Register::EIP) {
            return Some(Address {
                seg,
                base: None,
                index: None,
                scale: 1,
                disp: self.instr.memory_displacement64(),
                rip_relative: true,
                addr_width,
            });
        }
        let base = match base_reg {
            Register::None => None,
            r => Some(gpr_of(r.full_register())?),
        };
        let index = match self.instr.memory_index() {
            Register::None => None,
            r => Some(gpr_of(r.full_register())?),
        };
        Some(Address {
            seg,
            base,
            index,
            scale: self.instr.memory_index_scale() as u8,
            disp: self.instr.memory_displacement64(),
            rip_relative: false,
            addr_width,
        })
    }

    fn operand(&self, i: u32) -> Option<Operand> {
        match self.instr.op_kind(i) {
            OpKind::Register => reg_of(self.instr.op_register(i)).map(Operand::Reg),
            OpKind::Memory => self.address().map(Operand::Mem),
            OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => Some(Operand::Imm(self.instr.immediate(i))),
            _ => None,
        }
    }

    fn reg(&self, i: u32) -> Option<Reg> {
        match self.operand(i)? {
            Operand::Reg(r) => Some(r),
            _ => None,
        }
    }

    /// Width of a register or memory operand.
    fn width(&self, i: u32) -> Option<Width> {
        match self.instr.op_kind(i) {
            OpKind::Register => Some(reg_of(self.instr.op_register(i))?.width),
            OpKind::Memory => Width::from_bytes(self.instr.memory_size().size()),
            OpKind::Immediate8to16 | OpKind::Immediate16 => Some(Width::W16),
            OpKind::Immediate8to32 | OpKind::Immediate32 => Some(Width::W32),
            OpKind::Immediate8to64 | OpKind::Immediate32to64 => Some(Width::W64),
            _ => None,
        }
    }

    fn near_target(&self) -> Option<u64> {
        match self.instr.op_kind(0) {
            OpKind::NearBranch64 | OpKind::NearBranch32 => Some(self.instr.near_branch_target()),
            _ => None,
        }
    }

    fn binary(&self) -> Option<(Operand, Operand, Width)> {
        Some((self.operand(0)?, self.operand(1)?, self.width(0)?))
    }

    fn unary(&self) -> Option<(Operand, Width)> {
        Some((self.operand(0)?, self.width(0)?))
    }

    fn is_string_form(&self) -> bool {
        matches!(
            self.instr.op_kind(0),
            OpKind::MemoryESRDI | OpKind::MemoryESEDI
        ) && !(self.mode == DecodeMode::Bits64 && self.addr_override)
    }
}

fn cond_of(m: Mnemonic) -> Option<Cond> {
    use Mnemonic as M;
    Some(match m {
        M::Jo | M::Seto | M::Cmovo => Cond::O,
        M::Jno | M::Setno | M::Cmovno => Cond::No,
        M::Jb | M::Setb | M::Cmovb => Cond::B,
        M::Jae | M::Setae | M::Cmovae => Cond::Ae,
        M::Je | M::Sete | M::Cmove => Cond::E,
        M::Jne | M::Setne | M::Cmovne => Cond::Ne,
        M::Jbe | M::Setbe | M::Cmovbe => Cond::Be,
        M::Ja | M::Seta | M::Cmova => Cond::A,
        M::Js | M::Sets | M::Cmovs => Cond::S,
        M::Jns | M::Setns | M::Cmovns => Cond::Ns,
        M::Jp | M::Setp | M::Cmovp => Cond::P,
        M::Jnp | M::Setnp | M::Cmovnp => Cond::Np,
        M::Jl | M::Setl | M::Cmovl => Cond::L,
        M::Jge | M::Setge | M::Cmovge => Cond::Ge,
        M::Jle | M::Setle | M::Cmovle => Cond::Le,
        M::Jg | M::Setg | M::Cmovg => Cond::G,
        _ => return None,
    })
}

fn lower_kind(ctx: &Ctx<'_>, mnemonic: Mnemonic) -> Option<InstKind> {
    use Mnemonic as M;
    let instr = ctx.instr;

    let kind = match mnemonic {
        M::Mov => {
            let (dst, src, width) = ctx.binary()?;
            InstKind::Mov { dst, src, width }
        }
        M::Movzx | M::Movsx | M::Movsxd => InstKind::MovExtend {
            dst: ctx.reg(0)?,
            src: ctx.operand(1)?,
            src_width: ctx.width(1)?,
            signed: mnemonic != M::Movzx,
        },
        M::Lea => {
            let mut addr = ctx.operand(1)?.as_mem().copied()?;
            addr.seg = None;
            InstKind::Lea {
                dst: ctx.reg(0)?,
                addr,
            }
        }
        M::Xchg => InstKind::Xchg {
            dst: ctx.operand(0)?,
            src: ctx.reg(1)?,
            width: ctx.width(0)?,
        },
        M::Push => {
            let width = ctx.width(0)?;
            if width == Width::W8 {
                return None;
            }
            InstKind::Push {
                src: ctx.operand(0)?,
                width,
            }
        }
        M::Pop => {
            let (dst, width) = ctx.unary()?;
            InstKind::Pop { dst, width }
        }
        M::Leave => InstKind::Leave,
        M::Bswap => {
            let reg = ctx.reg(0)?;
            if reg.width == Width::W16 {
                return None;
            }
            InstKind::Bswap { reg }
        }
        M::Cbw => InstKind::SignExtendAcc { width: Width::W16 },
        M::Cwde => InstKind::SignExtendAcc { width: Width::W32 },
        M::Cdqe => InstKind::SignExtendAcc { width: Width::W64 },
        M::Cwd => InstKind::SignSplitAcc { width: Width::W16 },
        M::Cdq => InstKind::SignSplitAcc { width: Width::W32 },
        M::Cqo => InstKind::SignSplitAcc { width: Width::W64 },
        M::Add | M::Adc | M::Sub | M::Sbb | M::And | M::Or | M::Xor => {
            let op = match mnemonic {
                M::Add => AluOp::Add,
                M::Adc => AluOp::Adc,
                M::Sub => AluOp::Sub,
                M::Sbb => AluOp::Sbb,
                M::And => AluOp::And,
                M::Or => AluOp::Or,
                _ => AluOp::Xor,
            };
            let (dst, src, width) = ctx.binary()?;
            InstKind::Alu { op, dst, src, width }
        }
        M::Cmp => {
            let (lhs, rhs, width) = ctx.binary()?;
            InstKind::Cmp { lhs, rhs, width }
        }
        M::Test => {
            let (lhs, rhs, width) = ctx.binary()?;
            InstKind::Test { lhs, rhs, width }
        }
        M::Inc => {
            let (dst, width) = ctx.unary()?;
            InstKind::Inc { dst, width }
        }
        M::Dec => {
            let (dst, width) = ctx.unary()?;
            InstKind::Dec { dst, width }
        }
        M::Neg => {
            let (dst, width) = ctx.unary()?;
            InstKind::Neg { dst, width }
        }
        M::Not => {
            let (dst, width) = ctx.unary()?;
            InstKind::Not { dst, width }
        }
        M::Shl | M::Sal | M::Shr | M::Sar | M::Rol | M::Ror => {
            let op = match mnemonic {
                M::Shl | M::Sal => ShiftOp::Shl,
                M::Shr => ShiftOp::Shr,
                M::Sar => ShiftOp::Sar,
                M::Rol => ShiftOp::Rol,
                _ => ShiftOp::Ror,
            };
            let (dst, width) = ctx.unary()?;
            let count = match instr.op_kind(1) {
                OpKind::Register if instr.op_register(1) == Register::CL => ShiftCount::Cl,
                OpKind::Immediate8 => ShiftCount::Imm(instr.immediate8()),
                _ => return None,
            };
            InstKind::Shift {
                op,
                dst,
                count,
                width,
            }
        }
        M::Imul if instr.op_count() == 1 => {
            let (src, width) = ctx.unary()?;
            InstKind::MulWide {
                signed: true,
                src,
                width,
            }
        }
        M::Imul => {
            let imm = if instr.op_count() == 3 {
                match ctx.operand(2)? {
                    Operand::Imm(v) => Some(v),
                    _ => return None,
                }
            } else {
                None
            };
            InstKind::Imul {
                dst: ctx.reg(0)?,
                src: ctx.operand(1)?,
                imm,
                width: ctx.width(0)?,
            }
        }
        M::Mul => {
            let (src, width) = ctx.unary()?;
            InstKind::MulWide {
                signed: false,
                src,
                width,
            }
        }
        M::Div | M::Idiv => {
            let (src, width) = ctx.unary()?;
            InstKind::Div {
                signed: mnemonic == M::Idiv,
                src,
                width,
            }
        }
        M::Bt | M::Bts | M::Btr | M::Btc => {
            let op = match mnemonic {
                M::Bt => BitOp::Test,
                M::Bts => BitOp::Set,
                M::Btr => BitOp::Reset,
                _ => BitOp::Complement,
            };
            let (dst, bit, width) = ctx.binary()?;
            InstKind::Bit {
                op,
                dst,
                bit,
                width,
            }
        }
        M::Bsf | M::Bsr => InstKind::BitScan {
            reverse: mnemonic == M::Bsr,
            dst: ctx.reg(0)?,
            src: ctx.operand(1)?,
            width: ctx.width(0)?,
        },
        M::Xadd => InstKind::Xadd {
            dst: ctx.operand(0)?,
            src: ctx.reg(1)?,
            width: ctx.width(0)?,
        },
        M::Cmpxchg => InstKind::Cmpxchg {
            dst: ctx.operand(0)?,
            src: ctx.reg(1)?,
            width: ctx.width(0)?,
        },
        M::Jmp => match ctx.near_target() {
            Some(target) => InstKind::Jmp { target },
            None => indirect_target(ctx).map(|target| InstKind::JmpIndirect { target })?,
        },
        M::Call => match ctx.near_target() {
            Some(target) => InstKind::Call { target },
            None => indirect_target(ctx).map(|target| InstKind::CallIndirect { target })?,
        },
        M::Ret => InstKind::Ret {
            pop: if instr.op_count() == 1 {
                instr.immediate16()
            } else {
                0
            },
        },
        M::Syscall => InstKind::Syscall,
        M::Movsb | M::Movsw | M::Movsd | M::Movsq | M::Stosb | M::Stosw | M::Stosd | M::Stosq
            if ctx.is_string_form() =>
        {
            let (op, width) = match mnemonic {
                M::Movsb => (StringOp::Movs, Width::W8),
                M::Movsw => (StringOp::Movs, Width::W16),
                M::Movsd => (StringOp::Movs, Width::W32),
                M::Movsq => (StringOp::Movs, Width::W64),
                M::Stosb => (StringOp::Stos, Width::W8),
                M::Stosw => (StringOp::Stos, Width::W16),
                M::Stosd => (StringOp::Stos, Width::W32),
                _ => (StringOp::Stos, Width::W64),
            };
            InstKind::String { op, width }
        }
        M::Cld => InstKind::SetDirection { down: false },
        M::Std => InstKind::SetDirection { down: true },
        M::Nop | M::Endbr64 | M::Endbr32 | M::Pause => InstKind::Nop,
        M::Cpuid => InstKind::Cpuid,
        M::Rdtsc => InstKind::Rdtsc,
        M::Int3 => InstKind::Trap(TrapInst::Breakpoint),
        M::Int if instr.immediate8() == 3 => InstKind::Trap(TrapInst::Breakpoint),
        M::Int | M::Hlt => InstKind::Trap(TrapInst::Privileged),
        M::Ud0 | M::Ud1 | M::Ud2 => InstKind::Trap(TrapInst::Undefined),
        m => {
            let cond = cond_of(m)?;
            match m {
                M::Seto
                | M::Setno
                | M::Setb
                | M::Setae
                | M::Sete
                | M::Setne
                | M::Setbe
                | M::Seta
                | M::Sets
                | M::Setns
                | M::Setp
                | M::Setnp
                | M::Setl
                | M::Setge
                | M::Setle
                | M::Setg => InstKind::Setcc {
                    cond,
                    dst: ctx.operand(0)?,
                },
                M::Cmovo
                | M::Cmovno
                | M::Cmovb
                | M::Cmovae
                | M::Cmove
                | M::Cmovne
                | M::Cmovbe
                | M::Cmova
                | M::Cmovs
                | M::Cmovns
                | M::Cmovp
                | M::Cmovnp
                | M::Cmovl
                | M::Cmovge
                | M::Cmovle
                | M::Cmovg => InstKind::Cmovcc {
                    cond,
                    dst: ctx.reg(0)?,
                    src: ctx.operand(1)?,
                    width: ctx.width(0)?,
                },
                _ => InstKind::Jcc {
                    cond,
                    target: ctx.near_target()?,
                },
            }
        }
    };

    // The stack-relative forms only model the mode's natural stack width.
    if let InstKind::JmpIndirect { .. } | InstKind::CallIndirect { .. } = kind {
        if ctx.width(0)? != ctx.stack_width() {
            return None;
        }
    }
    Some(kind)
}

fn indirect_target(ctx: &Ctx<'_>) -> Option<Operand> {
    match ctx.instr.op_kind(0) {
        OpKind::Register | OpKind::Memory => ctx.operand(0),
        _ => None,
    }
}
