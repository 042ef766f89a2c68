use crate::state::CpuState;
use vmx86_mem::{AddressSpace, MemoryFault};
use vmx86_types::{Flag, Gpr, Width};
use vmx86_x86::StringOp;

/// Execute `movs`/`stos`, optionally `rep`-prefixed.
///
/// RSI/RDI/RCX are updated after every element, so a fault part way through a `rep` leaves
/// the registers describing the remaining work and the instruction can simply be restarted.
pub(crate) fn exec_string(
    cpu: &mut CpuState,
    mem: &AddressSpace,
    op: StringOp,
    width: Width,
    rep: bool,
    addr_width: Width,
) -> Result<(), MemoryFault> {
    let size = width.bytes();
    let step = if cpu.flag(Flag::Df) {
        (size as u64).wrapping_neg()
    } else {
        size as u64
    };

    loop {
        if rep && read(cpu, Gpr::Rcx, addr_width) == 0 {
            return Ok(());
        }

        let di = read(cpu, Gpr::Rdi, addr_width);
        match op {
            StringOp::Movs => {
                let si = read(cpu, Gpr::Rsi, addr_width);
                let v = mem.read_le(si, size)?;
                mem.write_le(di, size, v)?;
                write(cpu, Gpr::Rsi, addr_width, si.wrapping_add(step));
            }
            StringOp::Stos => {
                let v = cpu.read_gpr(Gpr::Rax, width, false);
                mem.write_le(di, size, v)?;
            }
        }
        write(cpu, Gpr::Rdi, addr_width, di.wrapping_add(step));

        if !rep {
            return Ok(());
        }
        let count = read(cpu, Gpr::Rcx, addr_width);
        write(cpu, Gpr::Rcx, addr_width, count.wrapping_sub(1));
    }
}

fn read(cpu: &CpuState, reg: Gpr, width: Width) -> u64 {
    cpu.read_gpr(reg, width, false)
}

fn write(cpu: &mut CpuState, reg: Gpr, width: Width, value: u64) {
    cpu.write_gpr(reg, width, false, value);
}
