//! Straightforward interpreter over decoded instructions, used as the oracle for translated
//! execution. Covers the register-only subset produced by [`super::asm`].

use vmx86_types::{
    Width, RFLAGS_AF, RFLAGS_CF, RFLAGS_OF, RFLAGS_PF, RFLAGS_SF, RFLAGS_STATUS_MASK,
    RFLAGS_ZF,
};
use vmx86_x86::{
    decode, AluOp, DecodeMode, DecodedInst, InstKind, Operand, Reg, ShiftCount, ShiftOp,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefState {
    pub gpr: [u64; 16],
    pub rflags: u64,
    /// Status flags whose value is architecturally defined after the last instruction.
    pub defined: u64,
}

impl RefState {
    pub fn new(gpr: [u64; 16], rflags: u64) -> Self {
        Self {
            gpr,
            rflags,
            defined: RFLAGS_STATUS_MASK,
        }
    }

    fn read(&self, reg: Reg) -> u64 {
        assert!(!reg.high8);
        reg.width.truncate(self.gpr[reg.gpr.index()])
    }

    fn write(&mut self, reg: Reg, v: u64) {
        let slot = &mut self.gpr[reg.gpr.index()];
        *slot = match reg.width {
            Width::W64 => v,
            Width::W32 => v & 0xffff_ffff,
            w => (*slot & !w.mask()) | w.truncate(v),
        };
    }

    fn operand(&self, op: &Operand, width: Width) -> u64 {
        match op {
            Operand::Reg(r) => self.read(*r),
            Operand::Imm(v) => width.truncate(*v),
            Operand::Mem(_) => panic!("memory operand outside the generated subset"),
        }
    }

    fn dst_reg(op: &Operand) -> Reg {
        match op {
            Operand::Reg(r) => *r,
            other => panic!("unexpected destination {other:?}"),
        }
    }

    /// Replace the flags in `written`; flags in `undefined` become don't-care.
    fn set_flags(&mut self, written: u64, values: u64, undefined: u64) {
        self.rflags = (self.rflags & !written) | (values & written);
        self.defined = (self.defined | written) & !undefined;
    }
}

fn szp(width: Width, r: u64) -> u64 {
    let mut f = 0;
    if r == 0 {
        f |= RFLAGS_ZF;
    }
    if r & width.sign_bit() != 0 {
        f |= RFLAGS_SF;
    }
    if (r as u8).count_ones() % 2 == 0 {
        f |= RFLAGS_PF;
    }
    f
}

fn bit(cond: bool, flag: u64) -> u64 {
    if cond {
        flag
    } else {
        0
    }
}

fn add_flags(width: Width, a: u64, b: u64, r: u64) -> u64 {
    let sign = width.sign_bit();
    szp(width, r)
        | bit(r < a, RFLAGS_CF)
        | bit((a ^ r) & (b ^ r) & sign != 0, RFLAGS_OF)
        | ((a ^ b ^ r) & RFLAGS_AF)
}

fn sub_flags(width: Width, a: u64, b: u64, r: u64) -> u64 {
    let sign = width.sign_bit();
    szp(width, r)
        | bit(a < b, RFLAGS_CF)
        | bit((a ^ b) & (a ^ r) & sign != 0, RFLAGS_OF)
        | ((a ^ b ^ r) & RFLAGS_AF)
}

const ARITH: u64 = RFLAGS_STATUS_MASK;
const NO_CF: u64 = RFLAGS_STATUS_MASK & !RFLAGS_CF;

pub fn step(s: &mut RefState, inst: &DecodedInst) {
    match &inst.kind {
        InstKind::Nop => {}
        InstKind::Mov { dst, src, width } => {
            let v = s.operand(src, *width);
            s.write(RefState::dst_reg(dst), v);
        }
        InstKind::Lea { dst, addr } => {
            let mut ea = addr.disp;
            if let Some(b) = addr.base {
                ea = ea.wrapping_add(s.gpr[b.index()]);
            }
            if let Some(i) = addr.index {
                ea = ea.wrapping_add(s.gpr[i.index()].wrapping_mul(u64::from(addr.scale)));
            }
            s.write(*dst, addr.addr_width.truncate(ea));
        }
        InstKind::Alu {
            op,
            dst,
            src,
            width,
        } => {
            let w = *width;
            let a = s.operand(dst, w);
            let b = s.operand(src, w);
            let (r, flags, undefined) = match op {
                AluOp::Add => {
                    let r = w.truncate(a.wrapping_add(b));
                    (r, add_flags(w, a, b, r), 0)
                }
                AluOp::Sub => {
                    let r = w.truncate(a.wrapping_sub(b));
                    (r, sub_flags(w, a, b, r), 0)
                }
                AluOp::And => (a & b, szp(w, a & b), RFLAGS_AF),
                AluOp::Or => (a | b, szp(w, a | b), RFLAGS_AF),
                AluOp::Xor => (a ^ b, szp(w, a ^ b), RFLAGS_AF),
                AluOp::Adc | AluOp::Sbb => panic!("carry ops are not generated"),
            };
            s.write(RefState::dst_reg(dst), r);
            s.set_flags(ARITH, flags, undefined);
        }
        InstKind::Cmp { lhs, rhs, width } => {
            let a = s.operand(lhs, *width);
            let b = s.operand(rhs, *width);
            let r = width.truncate(a.wrapping_sub(b));
            s.set_flags(ARITH, sub_flags(*width, a, b, r), 0);
        }
        InstKind::Test { lhs, rhs, width } => {
            let r = s.operand(lhs, *width) & s.operand(rhs, *width);
            s.set_flags(ARITH, szp(*width, r), RFLAGS_AF);
        }
        InstKind::Inc { dst, width } => {
            let a = s.operand(dst, *width);
            let r = width.truncate(a.wrapping_add(1));
            s.write(RefState::dst_reg(dst), r);
            s.set_flags(NO_CF, add_flags(*width, a, 1, r), 0);
        }
        InstKind::Dec { dst, width } => {
            let a = s.operand(dst, *width);
            let r = width.truncate(a.wrapping_sub(1));
            s.write(RefState::dst_reg(dst), r);
            s.set_flags(NO_CF, sub_flags(*width, a, 1, r), 0);
        }
        InstKind::Neg { dst, width } => {
            let a = s.operand(dst, *width);
            let r = width.truncate(0u64.wrapping_sub(a));
            s.write(RefState::dst_reg(dst), r);
            s.set_flags(ARITH, sub_flags(*width, 0, a, r), 0);
        }
        InstKind::Not { dst, width } => {
            let r = width.truncate(!s.operand(dst, *width));
            s.write(RefState::dst_reg(dst), r);
        }
        InstKind::Shift {
            op,
            dst,
            count: ShiftCount::Imm(count),
            width,
        } => {
            let w = *width;
            let c = u64::from(*count) & w.shift_count_mask();
            if c == 0 {
                return;
            }
            let a = s.operand(dst, w);
            let bits = u64::from(w.bits());
            let (r, cf, of) = match op {
                ShiftOp::Shl => {
                    let r = if c >= bits { 0 } else { w.truncate(a << c) };
                    let cf = c <= bits && (a >> (bits - c)) & 1 != 0;
                    (r, cf, (r & w.sign_bit() != 0) != cf)
                }
                ShiftOp::Shr => {
                    let r = if c >= bits { 0 } else { a >> c };
                    let cf = (a >> (c - 1)) & 1 != 0;
                    (r, cf, a & w.sign_bit() != 0)
                }
                ShiftOp::Sar => {
                    let sa = w.sign_extend(a) as i64;
                    let r = w.truncate((sa >> c.min(63)) as u64);
                    let cf = (sa >> (c - 1).min(63)) & 1 != 0;
                    (r, cf, false)
                }
                ShiftOp::Rol | ShiftOp::Ror => panic!("rotates are not generated"),
            };
            s.write(RefState::dst_reg(dst), r);
            let undefined = if c == 1 {
                RFLAGS_AF
            } else {
                RFLAGS_AF | RFLAGS_OF
            };
            s.set_flags(
                ARITH,
                szp(w, r) | bit(cf, RFLAGS_CF) | bit(of, RFLAGS_OF),
                undefined,
            );
        }
        other => panic!("instruction outside the generated subset: {other:?}"),
    }
}

/// Decode and interpret `code` (placed at `base`) until its bytes run out.
pub fn run(s: &mut RefState, base: u64, code: &[u8]) {
    let mut off = 0usize;
    while off < code.len() {
        let inst = decode(DecodeMode::Bits64, base + off as u64, &code[off..])
            .unwrap_or_else(|e| panic!("reference decode failed: {e}"));
        step(s, &inst);
        off += usize::from(inst.len);
    }
}
