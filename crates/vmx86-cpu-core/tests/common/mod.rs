#![allow(dead_code)]

pub mod asm;
pub mod reference;

use std::sync::Arc;
use vmx86_cpu_core::{
    CpuMode, CpuState, Engine, Process, SyscallContext, SyscallError, SyscallHandler,
    SyscallOutcome, TraceSink, VmConfig,
};
use vmx86_mem::{AddressSpace, Backing, Prot};
use vmx86_types::Gpr;

pub const CODE: u64 = 0x40_0000;
pub const DATA: u64 = 0x60_0000;
pub const STACK_TOP: u64 = 0x7ff0_0000;
pub const STACK_SIZE: u64 = 0x4000;

/// Code at `CODE` (RWX so tests can patch it), a data page and a small stack.
pub fn address_space(code: &[u8]) -> Arc<AddressSpace> {
    let mem = Arc::new(AddressSpace::new());
    mem.map_fixed(CODE, 0x2000, Prot::RWX, Backing::Anonymous, false)
        .unwrap();
    mem.map_fixed(DATA, 0x1000, Prot::RW, Backing::Anonymous, false)
        .unwrap();
    mem.map_fixed(
        STACK_TOP - STACK_SIZE,
        STACK_SIZE,
        Prot::RW,
        Backing::Anonymous,
        false,
    )
    .unwrap();
    mem.write(CODE, code).unwrap();
    mem
}

pub fn initial_cpu(rip: u64) -> CpuState {
    let mut cpu = CpuState::new(CpuMode::Long64);
    cpu.rip = rip;
    cpu.set_gpr(Gpr::Rsp, STACK_TOP - 0x100);
    cpu
}

/// Minimal syscall policy: 60 exits the thread, 231 exits the group, 39 is getpid and
/// anything else fails with ENOSYS.
pub struct TestSyscalls;

impl SyscallHandler for TestSyscalls {
    fn handle_syscall(
        &self,
        cpu: &mut CpuState,
        _mem: &AddressSpace,
        ctx: &SyscallContext<'_>,
    ) -> Result<SyscallOutcome, SyscallError> {
        match cpu.gpr(Gpr::Rax) {
            60 => Ok(SyscallOutcome::ExitThread(cpu.gpr(Gpr::Rdi) as i32)),
            231 => Ok(SyscallOutcome::ExitGroup(cpu.gpr(Gpr::Rdi) as i32)),
            39 => Ok(SyscallOutcome::Return(u64::from(ctx.process.pid()))),
            _ => Err(SyscallError::new(38)),
        }
    }
}

/// Route engine logs to the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn process(mem: Arc<AddressSpace>, config: VmConfig) -> Arc<Process> {
    init_tracing();
    Process::new(100, config, mem, Arc::new(TestSyscalls)).expect("valid config")
}

pub fn traced_process(
    mem: Arc<AddressSpace>,
    config: VmConfig,
    sink: Arc<dyn TraceSink>,
) -> Arc<Process> {
    init_tracing();
    Process::with_trace(100, config, mem, Arc::new(TestSyscalls), Some(sink))
        .expect("valid config")
}

/// One process with one thread about to run `code` from `CODE`.
pub fn engine(code: &[u8]) -> Engine {
    let mem = address_space(code);
    process(mem, VmConfig::default()).spawn_thread(initial_cpu(CODE))
}
