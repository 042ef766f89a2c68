//! x86 → micro-op lowering.

use crate::block::{discover_block, BasicBlock, BlockEndKind, BlockLimits, CodeSource};
use crate::ir::{
    BinOp, Block, FlagOp, GuestReg, Helper, IrInst, RmwOp, Terminator, TrapKind, UnOp, ValueId,
};
use crate::TranslateError;
use vmx86_types::{Cond, Flag, FlagSet, Gpr, Width};
use vmx86_x86::{
    Address, AluOp, BitOp, DecodeMode, DecodedInst, InstKind, Operand, Reg, ShiftCount, ShiftOp,
    TrapInst,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslateOptions {
    pub limits: BlockLimits,
    pub eliminate_dead_flags: bool,
}

impl Default for TranslateOptions {
    fn default() -> Self {
        Self {
            limits: BlockLimits::default(),
            eliminate_dead_flags: true,
        }
    }
}

/// Discover and lower the block starting at `entry`.
///
/// Reads code through `src` and nothing else; the guest is not touched.
pub fn build<S: CodeSource + ?Sized>(
    src: &mut S,
    entry: u64,
    mode: DecodeMode,
    opts: &TranslateOptions,
) -> Result<Block, TranslateError> {
    let bb = discover_block(src, entry, mode, opts.limits)?;
    let mut block = translate_block(&bb, mode)?;
    if opts.eliminate_dead_flags {
        crate::opt::flag_elim::run(&mut block);
    }
    tracing::trace!(
        entry = block.entry,
        end = block.end,
        guest_insts = block.guest_insts,
        ops = block.insts.len(),
        "translated block"
    );
    Ok(block)
}

/// Lower an already discovered block.
pub fn translate_block(bb: &BasicBlock, mode: DecodeMode) -> Result<Block, TranslateError> {
    let mut b = Builder::new(mode);
    let mut terminator = None;
    for inst in &bb.insts {
        b.start_inst(inst);
        terminator = lower(&mut b, inst)?;
        b.end_inst();
    }

    let end = bb.end();
    let terminator = match (terminator, bb.end_kind) {
        (Some(t), _) => t,
        (None, BlockEndKind::Stop { rip }) => Terminator::Jump { target: rip },
        (None, _) => Terminator::Jump { target: end },
    };
    Ok(Block {
        entry: bb.entry,
        end,
        insts: b.insts,
        terminator,
        guest_insts: bb.insts.len() as u32,
        value_count: b.next_value,
    })
}

/// Where an operand lives once its address (if any) has been computed.
#[derive(Debug, Clone, Copy)]
enum Place {
    Reg(Reg),
    Mem(ValueId),
    Value(ValueId),
}

struct Builder {
    mode: DecodeMode,
    insts: Vec<IrInst>,
    /// State updates of the current guest instruction, flushed after its fallible operations.
    pending: Vec<IrInst>,
    next_value: u32,
}

impl Builder {
    fn new(mode: DecodeMode) -> Self {
        Self {
            mode,
            insts: Vec::new(),
            pending: Vec::new(),
            next_value: 0,
        }
    }

    fn stack_width(&self) -> Width {
        match self.mode {
            DecodeMode::Bits64 => Width::W64,
            DecodeMode::Bits32 => Width::W32,
        }
    }

    fn start_inst(&mut self, inst: &DecodedInst) {
        self.insts.push(IrInst::InstStart {
            rip: inst.rip,
            len: inst.len,
        });
    }

    fn end_inst(&mut self) {
        self.insts.append(&mut self.pending);
    }

    fn value(&mut self) -> ValueId {
        let v = ValueId(self.next_value);
        self.next_value += 1;
        v
    }

    fn konst(&mut self, value: u64) -> ValueId {
        let dst = self.value();
        self.insts.push(IrInst::Const { dst, value });
        dst
    }

    fn read_reg(&mut self, reg: GuestReg) -> ValueId {
        let dst = self.value();
        self.insts.push(IrInst::ReadReg { dst, reg });
        dst
    }

    fn read_gpr(&mut self, r: Reg) -> ValueId {
        self.read_reg(GuestReg::Gpr {
            reg: r.gpr,
            width: r.width,
            high8: r.high8,
        })
    }

    fn read_flag(&mut self, flag: Flag) -> ValueId {
        let dst = self.value();
        self.insts.push(IrInst::ReadFlag { dst, flag });
        dst
    }

    fn bin(&mut self, op: BinOp, lhs: ValueId, rhs: ValueId, width: Width) -> ValueId {
        let dst = self.value();
        self.insts.push(IrInst::BinOp {
            dst,
            op,
            lhs,
            rhs,
            width,
        });
        dst
    }

    fn un(&mut self, op: UnOp, src: ValueId, width: Width) -> ValueId {
        let dst = self.value();
        self.insts.push(IrInst::UnOp { dst, op, src, width });
        dst
    }

    fn ext(&mut self, src: ValueId, from: Width, signed: bool) -> ValueId {
        let dst = self.value();
        self.insts.push(IrInst::Ext {
            dst,
            src,
            from,
            signed,
        });
        dst
    }

    fn eval_cond(&mut self, cond: Cond) -> ValueId {
        let dst = self.value();
        self.insts.push(IrInst::EvalCond { dst, cond });
        dst
    }

    fn select(&mut self, cond: ValueId, if_true: ValueId, if_false: ValueId) -> ValueId {
        let dst = self.value();
        self.insts.push(IrInst::Select {
            dst,
            cond,
            if_true,
            if_false,
        });
        dst
    }

    fn load(&mut self, addr: ValueId, width: Width) -> ValueId {
        let dst = self.value();
        self.insts.push(IrInst::Load { dst, addr, width });
        dst
    }

    fn store(&mut self, addr: ValueId, src: ValueId, width: Width) {
        self.insts.push(IrInst::Store { addr, src, width });
    }

    fn atomic(&mut self, op: RmwOp, addr: ValueId, src: ValueId, width: Width) -> ValueId {
        let dst = self.value();
        self.insts.push(IrInst::AtomicRmw {
            dst,
            op,
            addr,
            src,
            width,
        });
        dst
    }

    fn write_reg(&mut self, reg: GuestReg, src: ValueId) {
        self.pending.push(IrInst::WriteReg { reg, src });
    }

    fn write_gpr(&mut self, r: Reg, src: ValueId) {
        self.write_reg(
            GuestReg::Gpr {
                reg: r.gpr,
                width: r.width,
                high8: r.high8,
            },
            src,
        );
    }

    fn write_flag(&mut self, flag: Flag, src: ValueId) {
        self.pending.push(IrInst::WriteFlag { flag, src });
    }

    fn flags(
        &mut self,
        op: FlagOp,
        width: Width,
        lhs: ValueId,
        rhs: ValueId,
        result: ValueId,
        mask: FlagSet,
    ) {
        self.pending.push(IrInst::Flags {
            op,
            width,
            lhs,
            rhs,
            result,
            mask,
        });
    }

    /// Effective address: `seg.base + trunc(base + index * scale + disp)`.
    fn address(&mut self, a: &Address) -> ValueId {
        self.address_with_sp(a, None)
    }

    /// Effective address of `a`, taking RSP from `sp` when given.
    fn address_with_sp(&mut self, a: &Address, sp: Option<ValueId>) -> ValueId {
        let mut acc = a.base.map(|g| match sp {
            Some(v) if g == Gpr::Rsp => v,
            _ => self.read_reg(GuestReg::gpr(g, Width::W64)),
        });
        if let Some(index) = a.index {
            let mut i = self.read_reg(GuestReg::gpr(index, Width::W64));
            if a.scale > 1 {
                let sh = self.konst(u64::from(a.scale.trailing_zeros()));
                i = self.bin(BinOp::Shl, i, sh, Width::W64);
            }
            acc = Some(match acc {
                Some(base) => self.bin(BinOp::Add, base, i, Width::W64),
                None => i,
            });
        }
        let mut ea = match acc {
            Some(v) if a.disp != 0 => {
                let d = self.konst(a.disp);
                self.bin(BinOp::Add, v, d, Width::W64)
            }
            Some(v) => v,
            None => self.konst(a.disp),
        };
        if a.addr_width != Width::W64 {
            ea = self.ext(ea, a.addr_width, false);
        }
        if let Some(seg) = a.seg {
            let base = self.read_reg(GuestReg::SegBase(seg));
            ea = self.bin(BinOp::Add, base, ea, Width::W64);
        }
        ea
    }

    fn place(&mut self, op: &Operand, width: Width) -> Place {
        match op {
            Operand::Reg(r) => Place::Reg(*r),
            Operand::Mem(a) => Place::Mem(self.address(a)),
            Operand::Imm(v) => Place::Value(self.konst(width.truncate(*v))),
        }
    }

    fn read_place(&mut self, p: Place, width: Width) -> ValueId {
        match p {
            Place::Reg(r) => self.read_gpr(r),
            Place::Mem(addr) => self.load(addr, width),
            Place::Value(v) => v,
        }
    }

    /// Register destinations are deferred; memory destinations are stored right away so the
    /// store precedes every state update of the instruction.
    fn write_place(&mut self, p: Place, width: Width, src: ValueId) {
        match p {
            Place::Reg(r) => self.write_gpr(r, src),
            Place::Mem(addr) => self.store(addr, src, width),
            Place::Value(_) => debug_assert!(false, "write to an immediate operand"),
        }
    }

    fn read_operand(&mut self, op: &Operand, width: Width) -> ValueId {
        let p = self.place(op, width);
        self.read_place(p, width)
    }

    fn rsp(&self) -> GuestReg {
        GuestReg::gpr(Gpr::Rsp, self.stack_width())
    }

    /// Store `value` below the stack pointer and defer the pointer update.
    fn push(&mut self, value: ValueId, width: Width) {
        let sw = self.stack_width();
        let sp = self.read_reg(self.rsp());
        let n = self.konst(width.bytes() as u64);
        let new_sp = self.bin(BinOp::Sub, sp, n, sw);
        self.store(new_sp, value, width);
        self.write_reg(self.rsp(), new_sp);
    }
}

fn acc(width: Width) -> Reg {
    Reg::new(Gpr::Rax, width)
}

fn alu_flag_op(op: AluOp) -> FlagOp {
    match op {
        AluOp::Add => FlagOp::Add,
        AluOp::Adc => FlagOp::Adc,
        AluOp::Sub => FlagOp::Sub,
        AluOp::Sbb => FlagOp::Sbb,
        AluOp::And | AluOp::Or | AluOp::Xor => FlagOp::Logic,
    }
}

fn alu_bin_op(op: AluOp) -> BinOp {
    match op {
        AluOp::Add | AluOp::Adc => BinOp::Add,
        AluOp::Sub | AluOp::Sbb => BinOp::Sub,
        AluOp::And => BinOp::And,
        AluOp::Or => BinOp::Or,
        AluOp::Xor => BinOp::Xor,
    }
}

fn alu_rmw_op(op: AluOp) -> RmwOp {
    match op {
        AluOp::Add | AluOp::Adc => RmwOp::Add,
        AluOp::Sub | AluOp::Sbb => RmwOp::Sub,
        AluOp::And => RmwOp::And,
        AluOp::Or => RmwOp::Or,
        AluOp::Xor => RmwOp::Xor,
    }
}

fn lower_alu(b: &mut Builder, inst: &DecodedInst, op: AluOp, dst: &Operand, src: &Operand, width: Width) {
    let p = b.place(dst, width);
    let rhs = b.read_operand(src, width);
    let carry = matches!(op, AluOp::Adc | AluOp::Sbb).then(|| b.read_flag(Flag::Cf));

    if let (true, Place::Mem(addr)) = (inst.lock, p) {
        let operand = match carry {
            Some(cf) => b.bin(BinOp::Add, rhs, cf, width),
            None => rhs,
        };
        let old = b.atomic(alu_rmw_op(op), addr, operand, width);
        let result = b.bin(alu_bin_op(op), old, operand, width);
        b.flags(alu_flag_op(op), width, old, rhs, result, FlagSet::STATUS);
        return;
    }

    let lhs = b.read_place(p, width);
    let mut result = b.bin(alu_bin_op(op), lhs, rhs, width);
    if let Some(cf) = carry {
        result = b.bin(alu_bin_op(op), result, cf, width);
    }
    b.write_place(p, width, result);
    b.flags(alu_flag_op(op), width, lhs, rhs, result, FlagSet::STATUS);
}

fn lower_inc_dec(b: &mut Builder, inst: &DecodedInst, dst: &Operand, width: Width, inc: bool) {
    let (bin, rmw, fop) = if inc {
        (BinOp::Add, RmwOp::Add, FlagOp::Add)
    } else {
        (BinOp::Sub, RmwOp::Sub, FlagOp::Sub)
    };
    let p = b.place(dst, width);
    let one = b.konst(1);
    let old = match (inst.lock, p) {
        (true, Place::Mem(addr)) => b.atomic(rmw, addr, one, width),
        _ => b.read_place(p, width),
    };
    let result = b.bin(bin, old, one, width);
    if !(inst.lock && matches!(p, Place::Mem(_))) {
        b.write_place(p, width, result);
    }
    b.flags(fop, width, old, one, result, FlagSet::STATUS_NO_CF);
}

fn lower_shift(b: &mut Builder, op: ShiftOp, dst: &Operand, count: ShiftCount, width: Width) {
    let mask = width.shift_count_mask();
    let (n, known_zero) = match count {
        ShiftCount::Imm(imm) => {
            let masked = u64::from(imm) & mask;
            (b.konst(masked), masked == 0)
        }
        ShiftCount::Cl => {
            let cl = b.read_gpr(Reg::new(Gpr::Rcx, Width::W8));
            let m = b.konst(mask);
            (b.bin(BinOp::And, cl, m, Width::W8), false)
        }
    };
    let (bin, fop) = match op {
        ShiftOp::Shl => (BinOp::Shl, FlagOp::Shl),
        ShiftOp::Shr => (BinOp::Shr, FlagOp::Shr),
        ShiftOp::Sar => (BinOp::Sar, FlagOp::Sar),
        ShiftOp::Rol => (BinOp::Rol, FlagOp::Rol),
        ShiftOp::Ror => (BinOp::Ror, FlagOp::Ror),
    };
    let p = b.place(dst, width);
    let value = b.read_place(p, width);
    let result = b.bin(bin, value, n, width);
    b.write_place(p, width, result);
    if !known_zero {
        let written = if op.is_rotate() {
            FlagSet::CF | FlagSet::OF
        } else {
            FlagSet::STATUS
        };
        b.flags(fop, width, value, n, result, written);
    }
}

fn lower_bit(b: &mut Builder, inst: &DecodedInst, op: BitOp, dst: &Operand, bit: &Operand, width: Width) {
    let bits = u64::from(width.bits());
    let log2_bits = u64::from(width.bits().trailing_zeros());
    let mut p = b.place(dst, width);

    let index = match bit {
        Operand::Imm(v) => b.konst(v & (bits - 1)),
        other => {
            let raw = b.read_operand(other, width);
            if let Place::Mem(addr) = p {
                // A register bit offset may address memory outside the operand.
                let wide = b.ext(raw, width, true);
                let sh = b.konst(log2_bits);
                let units = b.bin(BinOp::Sar, wide, sh, Width::W64);
                let scale = b.konst(u64::from(width.bytes().trailing_zeros()));
                let offset = b.bin(BinOp::Shl, units, scale, Width::W64);
                p = Place::Mem(b.bin(BinOp::Add, addr, offset, Width::W64));
            }
            let m = b.konst(bits - 1);
            b.bin(BinOp::And, raw, m, width)
        }
    };

    let one = b.konst(1);
    let bit_mask = b.bin(BinOp::Shl, one, index, width);
    let (rmw, operand) = match op {
        BitOp::Test => (None, bit_mask),
        BitOp::Set => (Some(RmwOp::Or), bit_mask),
        BitOp::Reset => (Some(RmwOp::And), b.un(UnOp::Not, bit_mask, width)),
        BitOp::Complement => (Some(RmwOp::Xor), bit_mask),
    };

    let old = match (rmw, inst.lock, p) {
        (Some(rmw), true, Place::Mem(addr)) => b.atomic(rmw, addr, operand, width),
        (Some(rmw), _, _) => {
            let old = b.read_place(p, width);
            let bin = match rmw {
                RmwOp::Or => BinOp::Or,
                RmwOp::And => BinOp::And,
                _ => BinOp::Xor,
            };
            let new = b.bin(bin, old, operand, width);
            b.write_place(p, width, new);
            old
        }
        (None, _, _) => b.read_place(p, width),
    };
    b.flags(FlagOp::BitTest, width, old, index, old, FlagSet::CF);
}

fn lower_cmpxchg(b: &mut Builder, dst: &Operand, src: Reg, width: Width) {
    let expected = b.read_gpr(acc(width));
    let new = b.read_gpr(src);
    let p = b.place(dst, width);
    let old = match p {
        Place::Mem(addr) => {
            let dst = b.value();
            b.insts.push(IrInst::CmpXchg {
                dst,
                addr,
                expected,
                new,
                width,
            });
            dst
        }
        _ => b.read_place(p, width),
    };
    let equal = b.bin(BinOp::Eq, old, expected, width);
    let diff = b.bin(BinOp::Sub, expected, old, width);

    // The accumulator is only written on failure; a 32-bit write would clear bits 63:32.
    if width == Width::W32 {
        let full = b.read_reg(GuestReg::gpr(Gpr::Rax, Width::W64));
        let v = b.select(equal, full, old);
        b.write_reg(GuestReg::gpr(Gpr::Rax, Width::W64), v);
    } else {
        let v = b.select(equal, expected, old);
        b.write_gpr(acc(width), v);
    }
    if let Place::Reg(r) = p {
        let v = b.select(equal, new, old);
        b.write_gpr(r, v);
    }
    b.flags(FlagOp::Sub, width, expected, old, diff, FlagSet::STATUS);
}

fn lower_mul_wide(b: &mut Builder, signed: bool, src: &Operand, width: Width) {
    let rhs = b.read_operand(src, width);
    let lhs = b.read_gpr(acc(width));
    let lo = b.value();
    let hi = b.value();
    b.insts.push(IrInst::MulWide {
        lo,
        hi,
        lhs,
        rhs,
        width,
        signed,
    });
    if width == Width::W8 {
        b.write_gpr(acc(Width::W8), lo);
        b.write_gpr(Reg::high8(Gpr::Rax), hi);
    } else {
        b.write_gpr(acc(width), lo);
        b.write_gpr(Reg::new(Gpr::Rdx, width), hi);
    }
    let fop = if signed {
        FlagOp::MulSigned
    } else {
        FlagOp::MulUnsigned
    };
    b.flags(fop, width, hi, lo, lo, FlagSet::CF | FlagSet::OF);
}

fn lower_div(b: &mut Builder, signed: bool, src: &Operand, width: Width) {
    let divisor = b.read_operand(src, width);
    let (hi_reg, lo_reg) = if width == Width::W8 {
        (Reg::high8(Gpr::Rax), acc(Width::W8))
    } else {
        (Reg::new(Gpr::Rdx, width), acc(width))
    };
    let hi = b.read_gpr(hi_reg);
    let lo = b.read_gpr(lo_reg);
    let quot = b.value();
    let rem = b.value();
    b.insts.push(IrInst::DivWide {
        quot,
        rem,
        hi,
        lo,
        divisor,
        width,
        signed,
    });
    b.write_gpr(lo_reg, quot);
    b.write_gpr(hi_reg, rem);
}

fn lower(b: &mut Builder, inst: &DecodedInst) -> Result<Option<Terminator>, TranslateError> {
    let next = inst.next_rip();
    let sw = b.stack_width();

    match &inst.kind {
        InstKind::Mov { dst, src, width } => {
            let v = b.read_operand(src, *width);
            let p = b.place(dst, *width);
            b.write_place(p, *width, v);
        }
        InstKind::MovExtend {
            dst,
            src,
            src_width,
            signed,
        } => {
            let v = b.read_operand(src, *src_width);
            let e = b.ext(v, *src_width, *signed);
            b.write_gpr(*dst, e);
        }
        InstKind::Lea { dst, addr } => {
            let a = b.address(addr);
            b.write_gpr(*dst, a);
        }
        InstKind::Xchg { dst, src, width } => {
            let s = b.read_gpr(*src);
            match b.place(dst, *width) {
                Place::Mem(addr) => {
                    let old = b.atomic(RmwOp::Xchg, addr, s, *width);
                    b.write_gpr(*src, old);
                }
                p => {
                    let d = b.read_place(p, *width);
                    b.write_place(p, *width, s);
                    b.write_gpr(*src, d);
                }
            }
        }
        InstKind::Cmovcc {
            cond,
            dst,
            src,
            width,
        } => {
            let s = b.read_operand(src, *width);
            let d = b.read_gpr(*dst);
            let c = b.eval_cond(*cond);
            let v = b.select(c, s, d);
            b.write_gpr(*dst, v);
        }
        InstKind::Setcc { cond, dst } => {
            let c = b.eval_cond(*cond);
            let p = b.place(dst, Width::W8);
            b.write_place(p, Width::W8, c);
        }
        InstKind::Push { src, width } => {
            let v = b.read_operand(src, *width);
            b.push(v, *width);
        }
        InstKind::Pop { dst, width } => {
            let sp = b.read_reg(b.rsp());
            let v = b.load(sp, *width);
            let n = b.konst(width.bytes() as u64);
            let new_sp = b.bin(BinOp::Add, sp, n, sw);
            // A memory destination is addressed with RSP already incremented.
            let p = match dst {
                Operand::Mem(a) => Place::Mem(b.address_with_sp(a, Some(new_sp))),
                _ => b.place(dst, *width),
            };
            if let Place::Mem(addr) = p {
                b.store(addr, v, *width);
            }
            // `pop rsp` loads the popped value into RSP after the increment.
            b.write_reg(b.rsp(), new_sp);
            if let Place::Reg(r) = p {
                b.write_gpr(r, v);
            }
        }
        InstKind::Leave => {
            let bp = b.read_reg(GuestReg::gpr(Gpr::Rbp, sw));
            let v = b.load(bp, sw);
            let n = b.konst(sw.bytes() as u64);
            let new_sp = b.bin(BinOp::Add, bp, n, sw);
            b.write_reg(b.rsp(), new_sp);
            b.write_reg(GuestReg::gpr(Gpr::Rbp, sw), v);
        }
        InstKind::Bswap { reg } => {
            let v = b.read_gpr(*reg);
            let r = b.un(UnOp::Bswap, v, reg.width);
            b.write_gpr(*reg, r);
        }
        InstKind::SignExtendAcc { width } => {
            let half = match width {
                Width::W16 => Width::W8,
                Width::W32 => Width::W16,
                _ => Width::W32,
            };
            let v = b.read_gpr(acc(half));
            let e = b.ext(v, half, true);
            b.write_gpr(acc(*width), e);
        }
        InstKind::SignSplitAcc { width } => {
            let v = b.read_gpr(acc(*width));
            let n = b.konst(u64::from(width.bits() - 1));
            let s = b.bin(BinOp::Sar, v, n, *width);
            b.write_gpr(Reg::new(Gpr::Rdx, *width), s);
        }
        InstKind::Alu {
            op,
            dst,
            src,
            width,
        } => lower_alu(b, inst, *op, dst, src, *width),
        InstKind::Cmp { lhs, rhs, width } => {
            let l = b.read_operand(lhs, *width);
            let r = b.read_operand(rhs, *width);
            let res = b.bin(BinOp::Sub, l, r, *width);
            b.flags(FlagOp::Sub, *width, l, r, res, FlagSet::STATUS);
        }
        InstKind::Test { lhs, rhs, width } => {
            let l = b.read_operand(lhs, *width);
            let r = b.read_operand(rhs, *width);
            let res = b.bin(BinOp::And, l, r, *width);
            b.flags(FlagOp::Logic, *width, l, r, res, FlagSet::STATUS);
        }
        InstKind::Inc { dst, width } => lower_inc_dec(b, inst, dst, *width, true),
        InstKind::Dec { dst, width } => lower_inc_dec(b, inst, dst, *width, false),
        InstKind::Neg { dst, width } => {
            let p = b.place(dst, *width);
            let zero = b.konst(0);
            let old = match (inst.lock, p) {
                (true, Place::Mem(addr)) => b.atomic(RmwOp::Neg, addr, zero, *width),
                _ => b.read_place(p, *width),
            };
            let res = b.un(UnOp::Neg, old, *width);
            if !(inst.lock && matches!(p, Place::Mem(_))) {
                b.write_place(p, *width, res);
            }
            b.flags(FlagOp::Sub, *width, zero, old, res, FlagSet::STATUS);
        }
        InstKind::Not { dst, width } => {
            let p = b.place(dst, *width);
            match (inst.lock, p) {
                (true, Place::Mem(addr)) => {
                    let ones = b.konst(width.mask());
                    b.atomic(RmwOp::Xor, addr, ones, *width);
                }
                _ => {
                    let v = b.read_place(p, *width);
                    let r = b.un(UnOp::Not, v, *width);
                    b.write_place(p, *width, r);
                }
            }
        }
        InstKind::Shift {
            op,
            dst,
            count,
            width,
        } => lower_shift(b, *op, dst, *count, *width),
        InstKind::Imul {
            dst,
            src,
            imm,
            width,
        } => {
            let (lhs, rhs) = match imm {
                Some(imm) => {
                    let l = b.read_operand(src, *width);
                    (l, b.konst(width.truncate(*imm)))
                }
                None => {
                    let r = b.read_operand(src, *width);
                    (b.read_gpr(*dst), r)
                }
            };
            let lo = b.value();
            let hi = b.value();
            b.insts.push(IrInst::MulWide {
                lo,
                hi,
                lhs,
                rhs,
                width: *width,
                signed: true,
            });
            b.write_gpr(*dst, lo);
            b.flags(FlagOp::MulSigned, *width, hi, lo, lo, FlagSet::CF | FlagSet::OF);
        }
        InstKind::MulWide { signed, src, width } => lower_mul_wide(b, *signed, src, *width),
        InstKind::Div { signed, src, width } => lower_div(b, *signed, src, *width),
        InstKind::Bit {
            op,
            dst,
            bit,
            width,
        } => lower_bit(b, inst, *op, dst, bit, *width),
        InstKind::BitScan {
            reverse,
            dst,
            src,
            width,
        } => {
            let s = b.read_operand(src, *width);
            let d = b.read_gpr(*dst);
            let op = if *reverse { UnOp::Bsr } else { UnOp::Bsf };
            let scan = b.un(op, s, *width);
            let zero = b.konst(0);
            let is_zero = b.bin(BinOp::Eq, s, zero, *width);
            // A zero source leaves the destination unchanged.
            let v = b.select(is_zero, d, scan);
            b.write_gpr(*dst, v);
            b.flags(FlagOp::BitScan, *width, s, zero, v, FlagSet::ZF);
        }
        InstKind::Xadd { dst, src, width } => {
            let s = b.read_gpr(*src);
            match b.place(dst, *width) {
                Place::Mem(addr) => {
                    let old = b.atomic(RmwOp::Add, addr, s, *width);
                    let sum = b.bin(BinOp::Add, old, s, *width);
                    b.write_gpr(*src, old);
                    b.flags(FlagOp::Add, *width, old, s, sum, FlagSet::STATUS);
                }
                p => {
                    let d = b.read_place(p, *width);
                    let sum = b.bin(BinOp::Add, d, s, *width);
                    b.write_gpr(*src, d);
                    b.write_place(p, *width, sum);
                    b.flags(FlagOp::Add, *width, d, s, sum, FlagSet::STATUS);
                }
            }
        }
        InstKind::Cmpxchg { dst, src, width } => lower_cmpxchg(b, dst, *src, *width),
        InstKind::Jmp { target } => return Ok(Some(Terminator::Jump { target: *target })),
        InstKind::JmpIndirect { target } => {
            let t = b.read_operand(target, sw);
            return Ok(Some(Terminator::IndirectJump { target: t }));
        }
        InstKind::Jcc { cond, target } => {
            let c = b.eval_cond(*cond);
            return Ok(Some(Terminator::CondJump {
                cond: c,
                target: *target,
                fallthrough: next,
            }));
        }
        InstKind::Call { target } => {
            let ret = b.konst(sw.truncate(next));
            b.push(ret, sw);
            return Ok(Some(Terminator::Jump { target: *target }));
        }
        InstKind::CallIndirect { target } => {
            let t = b.read_operand(target, sw);
            let ret = b.konst(sw.truncate(next));
            b.push(ret, sw);
            return Ok(Some(Terminator::IndirectJump { target: t }));
        }
        InstKind::Ret { pop } => {
            let sp = b.read_reg(b.rsp());
            let t = b.load(sp, sw);
            let n = b.konst(sw.bytes() as u64 + u64::from(*pop));
            let new_sp = b.bin(BinOp::Add, sp, n, sw);
            b.write_reg(b.rsp(), new_sp);
            return Ok(Some(Terminator::IndirectJump { target: t }));
        }
        InstKind::Syscall => return Ok(Some(Terminator::Syscall { next_rip: next })),
        InstKind::String { op, width } => {
            b.insts.push(IrInst::Helper(Helper::String {
                op: *op,
                width: *width,
                rep: inst.rep,
                addr_width: sw,
            }));
        }
        InstKind::SetDirection { down } => {
            let v = b.konst(u64::from(*down));
            b.write_flag(Flag::Df, v);
        }
        InstKind::Nop => {}
        InstKind::Cpuid => b.insts.push(IrInst::Helper(Helper::Cpuid)),
        InstKind::Rdtsc => b.insts.push(IrInst::Helper(Helper::Rdtsc)),
        InstKind::Trap(trap) => {
            let (kind, rip) = match trap {
                TrapInst::Breakpoint => (TrapKind::Breakpoint, next),
                TrapInst::Undefined => (TrapKind::InvalidOpcode, inst.rip),
                TrapInst::Privileged => (TrapKind::GeneralProtection, inst.rip),
            };
            return Ok(Some(Terminator::Trap { kind, rip }));
        }
        InstKind::Unsupported(mnemonic) => {
            return Err(TranslateError::Unsupported {
                rip: inst.rip,
                mnemonic: *mnemonic,
            })
        }
    }
    Ok(None)
}
