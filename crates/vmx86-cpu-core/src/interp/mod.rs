//! Micro-op interpreter.
//!
//! Executes one translated [`Block`] against a [`CpuState`] and an [`AddressSpace`]. The
//! translator orders every fallible operation of a guest instruction before its register and
//! flag updates, so when an operation traps the interpreter just stops: the faulting
//! instruction has had no architectural effect other than stores it already completed, and
//! `rip` is pointed back at it.

mod alu;
mod string;

use crate::cpuid::CpuidTable;
use crate::state::CpuState;
use crate::trap::{Trap, TrapCause};
use vmx86_jit::ir::{GuestReg, Helper, IrInst, Terminator, TrapKind, ValueId};
use vmx86_jit::Block;
use vmx86_mem::AddressSpace;
use vmx86_types::{Gpr, Width};
use vmx86_x86::SegBase;

/// How a block handed control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockExit {
    /// Continue at `next_rip` (already committed to `cpu.rip`).
    Jump { next_rip: u64 },
    /// The block ended in `syscall`; the call returns to `next_rip`.
    Syscall { next_rip: u64 },
    Trap(Trap),
}

/// Reusable scratch space for block execution.
#[derive(Debug, Default)]
pub struct Interpreter {
    values: Vec<u64>,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execute(
        &mut self,
        block: &Block,
        cpu: &mut CpuState,
        mem: &AddressSpace,
        cpuid: &CpuidTable,
    ) -> BlockExit {
        self.values.clear();
        self.values.resize(block.value_count as usize, 0);
        let vals = &mut self.values[..];

        let mut started = false;
        let mut rip = block.entry;
        let mut next = block.entry;
        for inst in &block.insts {
            if let IrInst::InstStart { rip: r, len } = inst {
                if started {
                    cpu.retired += 1;
                }
                started = true;
                rip = *r;
                next = r.wrapping_add(u64::from(*len));
                continue;
            }
            if let Err(cause) = step(inst, vals, cpu, mem, cpuid, next) {
                cpu.set_rip(rip);
                return BlockExit::Trap(Trap { rip, cause });
            }
        }

        let last_retires = !matches!(
            block.terminator,
            Terminator::Trap { kind, .. } if kind != TrapKind::Breakpoint
        );
        if started && last_retires {
            cpu.retired += 1;
        }

        match block.terminator {
            Terminator::Jump { target } => jump(cpu, target),
            Terminator::CondJump {
                cond,
                target,
                fallthrough,
            } => {
                let t = if vals[cond.0 as usize] != 0 {
                    target
                } else {
                    fallthrough
                };
                jump(cpu, t)
            }
            Terminator::IndirectJump { target } => jump(cpu, vals[target.0 as usize]),
            Terminator::Syscall { next_rip } => {
                cpu.set_rip(next_rip);
                BlockExit::Syscall { next_rip: cpu.rip }
            }
            Terminator::Trap { kind, rip } => {
                cpu.set_rip(rip);
                let cause = match kind {
                    TrapKind::Breakpoint => TrapCause::Breakpoint,
                    TrapKind::InvalidOpcode => TrapCause::InvalidOpcode,
                    TrapKind::GeneralProtection => TrapCause::GeneralProtection,
                };
                BlockExit::Trap(Trap {
                    rip: cpu.rip,
                    cause,
                })
            }
        }
    }
}

fn jump(cpu: &mut CpuState, target: u64) -> BlockExit {
    cpu.set_rip(target);
    BlockExit::Jump { next_rip: cpu.rip }
}

fn read_reg(cpu: &CpuState, reg: GuestReg, next_rip: u64) -> u64 {
    match reg {
        GuestReg::Gpr { reg, width, high8 } => cpu.read_gpr(reg, width, high8),
        GuestReg::Rip => next_rip,
        GuestReg::SegBase(SegBase::Fs) => cpu.fs_base,
        GuestReg::SegBase(SegBase::Gs) => cpu.gs_base,
    }
}

fn write_reg(cpu: &mut CpuState, reg: GuestReg, value: u64) {
    match reg {
        GuestReg::Gpr { reg, width, high8 } => cpu.write_gpr(reg, width, high8, value),
        GuestReg::Rip => cpu.set_rip(value),
        GuestReg::SegBase(SegBase::Fs) => cpu.fs_base = value,
        GuestReg::SegBase(SegBase::Gs) => cpu.gs_base = value,
    }
}

fn step(
    inst: &IrInst,
    vals: &mut [u64],
    cpu: &mut CpuState,
    mem: &AddressSpace,
    cpuid: &CpuidTable,
    next_rip: u64,
) -> Result<(), TrapCause> {
    let get = |vals: &[u64], v: ValueId| vals[v.0 as usize];
    match *inst {
        IrInst::InstStart { .. } => {}
        IrInst::Const { dst, value } => vals[dst.0 as usize] = value,
        IrInst::ReadReg { dst, reg } => vals[dst.0 as usize] = read_reg(cpu, reg, next_rip),
        IrInst::WriteReg { reg, src } => write_reg(cpu, reg, get(vals, src)),
        IrInst::ReadFlag { dst, flag } => vals[dst.0 as usize] = u64::from(cpu.flag(flag)),
        IrInst::WriteFlag { flag, src } => cpu.set_flag(flag, get(vals, src) != 0),
        IrInst::Ext {
            dst,
            src,
            from,
            signed,
        } => {
            let v = get(vals, src);
            vals[dst.0 as usize] = if signed {
                from.sign_extend(v)
            } else {
                from.truncate(v)
            };
        }
        IrInst::BinOp {
            dst,
            op,
            lhs,
            rhs,
            width,
        } => vals[dst.0 as usize] = alu::bin_op(op, width, get(vals, lhs), get(vals, rhs)),
        IrInst::UnOp { dst, op, src, width } => {
            vals[dst.0 as usize] = alu::un_op(op, width, get(vals, src))
        }
        IrInst::Flags {
            op,
            width,
            lhs,
            rhs,
            result,
            mask,
        } => {
            if mask.is_empty() {
                return Ok(());
            }
            if let Some(f) = alu::flags(op, width, get(vals, lhs), get(vals, rhs), get(vals, result))
            {
                let m = mask.bits();
                cpu.set_rflags((cpu.rflags() & !m) | (f & m));
            }
        }
        IrInst::EvalCond { dst, cond } => {
            vals[dst.0 as usize] = u64::from(cond.eval(cpu.rflags()))
        }
        IrInst::Select {
            dst,
            cond,
            if_true,
            if_false,
        } => {
            vals[dst.0 as usize] = if get(vals, cond) != 0 {
                get(vals, if_true)
            } else {
                get(vals, if_false)
            }
        }
        IrInst::Load { dst, addr, width } => {
            vals[dst.0 as usize] = mem
                .read_le(get(vals, addr), width.bytes())
                .map_err(TrapCause::Memory)?;
        }
        IrInst::Store { addr, src, width } => {
            mem.write_le(get(vals, addr), width.bytes(), width.truncate(get(vals, src)))
                .map_err(TrapCause::Memory)?;
        }
        IrInst::AtomicRmw {
            dst,
            op,
            addr,
            src,
            width,
        } => {
            let s = get(vals, src);
            vals[dst.0 as usize] = mem
                .atomic_update(get(vals, addr), width.bytes(), |old| {
                    Some(op.apply(width, old, s))
                })
                .map_err(TrapCause::Memory)?;
        }
        IrInst::CmpXchg {
            dst,
            addr,
            expected,
            new,
            width,
        } => {
            let expected = width.truncate(get(vals, expected));
            let new = width.truncate(get(vals, new));
            vals[dst.0 as usize] = mem
                .atomic_update(get(vals, addr), width.bytes(), |old| {
                    (old == expected).then_some(new)
                })
                .map_err(TrapCause::Memory)?;
        }
        IrInst::MulWide {
            lo,
            hi,
            lhs,
            rhs,
            width,
            signed,
        } => {
            let (l, h) = alu::mul_wide(width, get(vals, lhs), get(vals, rhs), signed);
            vals[lo.0 as usize] = l;
            vals[hi.0 as usize] = h;
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
            let (q, r) = alu::div_wide(width, get(vals, hi), get(vals, lo), get(vals, divisor), signed)
                .ok_or(TrapCause::DivideError)?;
            vals[quot.0 as usize] = q;
            vals[rem.0 as usize] = r;
        }
        IrInst::Helper(Helper::Cpuid) => {
            let leaf = cpu.read_gpr(Gpr::Rax, Width::W32, false) as u32;
            let subleaf = cpu.read_gpr(Gpr::Rcx, Width::W32, false) as u32;
            let r = cpuid.query(leaf, subleaf);
            cpu.write_gpr(Gpr::Rax, Width::W32, false, u64::from(r.eax));
            cpu.write_gpr(Gpr::Rbx, Width::W32, false, u64::from(r.ebx));
            cpu.write_gpr(Gpr::Rcx, Width::W32, false, u64::from(r.ecx));
            cpu.write_gpr(Gpr::Rdx, Width::W32, false, u64::from(r.edx));
        }
        IrInst::Helper(Helper::Rdtsc) => {
            let tsc = cpu.retired;
            cpu.write_gpr(Gpr::Rax, Width::W32, false, tsc & 0xffff_ffff);
            cpu.write_gpr(Gpr::Rdx, Width::W32, false, tsc >> 32);
        }
        IrInst::Helper(Helper::String {
            op,
            width,
            rep,
            addr_width,
        }) => {
            string::exec_string(cpu, mem, op, width, rep, addr_width).map_err(TrapCause::Memory)?
        }
    }
    Ok(())
}
