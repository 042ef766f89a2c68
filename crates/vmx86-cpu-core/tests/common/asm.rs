//! Encoder for the register-only instructions the identity property generates.

use proptest::prelude::*;
use vmx86_types::Gpr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alu {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Cmp,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unary {
    Inc,
    Dec,
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shift {
    Shl,
    Shr,
    Sar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    MovImm64 { dst: Gpr, imm: u64 },
    MovImm32 { dst: Gpr, imm: u32 },
    MovReg { wide: bool, dst: Gpr, src: Gpr },
    Alu { op: Alu, wide: bool, dst: Gpr, src: Gpr },
    Unary { op: Unary, wide: bool, dst: Gpr },
    Shift { op: Shift, wide: bool, dst: Gpr, count: u8 },
    Lea { dst: Gpr, base: Gpr, index: Gpr, scale: u8, disp: i32 },
}

fn rex(w: bool, r: Gpr, b: Gpr) -> Option<u8> {
    let v = (u8::from(w) << 3) | ((r.as_u8() >> 3) << 2) | (b.as_u8() >> 3);
    (v != 0).then_some(0x40 | v)
}

fn modrm_rr(reg: u8, rm: Gpr) -> u8 {
    0xc0 | ((reg & 7) << 3) | (rm.as_u8() & 7)
}

impl Op {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            Op::MovImm64 { dst, imm } => {
                out.push(0x48 | (dst.as_u8() >> 3));
                out.push(0xb8 + (dst.as_u8() & 7));
                out.extend_from_slice(&imm.to_le_bytes());
            }
            Op::MovImm32 { dst, imm } => {
                if dst.as_u8() >= 8 {
                    out.push(0x41);
                }
                out.push(0xb8 + (dst.as_u8() & 7));
                out.extend_from_slice(&imm.to_le_bytes());
            }
            Op::MovReg { wide, dst, src } => {
                out.extend(rex(wide, src, dst));
                out.push(0x89);
                out.push(modrm_rr(src.as_u8(), dst));
            }
            Op::Alu { op, wide, dst, src } => {
                let opcode = match op {
                    Alu::Add => 0x01,
                    Alu::Or => 0x09,
                    Alu::And => 0x21,
                    Alu::Sub => 0x29,
                    Alu::Xor => 0x31,
                    Alu::Cmp => 0x39,
                    Alu::Test => 0x85,
                };
                out.extend(rex(wide, src, dst));
                out.push(opcode);
                out.push(modrm_rr(src.as_u8(), dst));
            }
            Op::Unary { op, wide, dst } => {
                let (opcode, ext) = match op {
                    Unary::Inc => (0xff, 0),
                    Unary::Dec => (0xff, 1),
                    Unary::Not => (0xf7, 2),
                    Unary::Neg => (0xf7, 3),
                };
                out.extend(rex(wide, Gpr::Rax, dst));
                out.push(opcode);
                out.push(modrm_rr(ext, dst));
            }
            Op::Shift {
                op,
                wide,
                dst,
                count,
            } => {
                let ext = match op {
                    Shift::Shl => 4,
                    Shift::Shr => 5,
                    Shift::Sar => 7,
                };
                out.extend(rex(wide, Gpr::Rax, dst));
                out.push(0xc1);
                out.push(modrm_rr(ext, dst));
                out.push(count);
            }
            Op::Lea {
                dst,
                base,
                index,
                scale,
                disp,
            } => {
                let rex = 0x48
                    | ((dst.as_u8() >> 3) << 2)
                    | ((index.as_u8() >> 3) << 1)
                    | (base.as_u8() >> 3);
                let ss = match scale {
                    1 => 0,
                    2 => 1,
                    4 => 2,
                    _ => 3,
                };
                out.push(rex);
                out.push(0x8d);
                // mod=10 with a SIB byte: [base + index*scale + disp32].
                out.push(0x84 | ((dst.as_u8() & 7) << 3));
                out.push((ss << 6) | ((index.as_u8() & 7) << 3) | (base.as_u8() & 7));
                out.extend_from_slice(&disp.to_le_bytes());
            }
        }
    }
}

pub fn assemble(ops: &[Op]) -> Vec<u8> {
    let mut out = Vec::new();
    for op in ops {
        op.encode(&mut out);
    }
    out
}

pub fn gpr() -> impl Strategy<Value = Gpr> {
    (0usize..16).prop_map(|i| Gpr::ALL[i])
}

/// Any register usable as a SIB index (everything but RSP).
fn index_gpr() -> impl Strategy<Value = Gpr> {
    gpr().prop_filter("rsp cannot be an index", |g| *g != Gpr::Rsp)
}

fn alu() -> impl Strategy<Value = Alu> {
    prop_oneof![
        Just(Alu::Add),
        Just(Alu::Sub),
        Just(Alu::And),
        Just(Alu::Or),
        Just(Alu::Xor),
        Just(Alu::Cmp),
        Just(Alu::Test),
    ]
}

fn unary() -> impl Strategy<Value = Unary> {
    prop_oneof![
        Just(Unary::Inc),
        Just(Unary::Dec),
        Just(Unary::Neg),
        Just(Unary::Not),
    ]
}

fn shift() -> impl Strategy<Value = Shift> {
    prop_oneof![Just(Shift::Shl), Just(Shift::Shr), Just(Shift::Sar)]
}

pub fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (gpr(), any::<u64>()).prop_map(|(dst, imm)| Op::MovImm64 { dst, imm }),
        (gpr(), any::<u32>()).prop_map(|(dst, imm)| Op::MovImm32 { dst, imm }),
        (any::<bool>(), gpr(), gpr()).prop_map(|(wide, dst, src)| Op::MovReg { wide, dst, src }),
        (alu(), any::<bool>(), gpr(), gpr())
            .prop_map(|(op, wide, dst, src)| Op::Alu { op, wide, dst, src }),
        (unary(), any::<bool>(), gpr()).prop_map(|(op, wide, dst)| Op::Unary { op, wide, dst }),
        (shift(), any::<bool>(), gpr(), 1u8..32).prop_map(|(op, wide, dst, count)| Op::Shift {
            op,
            wide,
            dst,
            count,
        }),
        (
            gpr(),
            gpr(),
            index_gpr(),
            prop_oneof![Just(1u8), Just(2), Just(4), Just(8)],
            any::<i32>()
        )
            .prop_map(|(dst, base, index, scale, disp)| Op::Lea {
                dst,
                base,
                index,
                scale,
                disp,
            }),
    ]
}
