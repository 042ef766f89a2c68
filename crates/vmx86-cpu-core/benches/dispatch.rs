use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use vmx86_cpu_core::{
    CpuMode, CpuState, Process, SyscallContext, SyscallError, SyscallOutcome, VmConfig,
};
use vmx86_mem::{AddressSpace, Backing, Prot};
use vmx86_types::Gpr;
use vmx86_x86::DecodeMode;

const CODE: u64 = 0x40_0000;

fn criterion_config() -> Criterion {
    match std::env::var("VMX86_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            .warm_up_time(Duration::from_millis(150))
            .measurement_time(Duration::from_millis(400))
            .sample_size(20)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(50)
            .noise_threshold(0.03),
    }
}

fn no_syscalls(
    _: &mut CpuState,
    _: &AddressSpace,
    _: &SyscallContext<'_>,
) -> Result<SyscallOutcome, SyscallError> {
    Err(SyscallError::new(38))
}

/// A process whose only thread spins in `add rax, rbx; dec rcx; jnz`.
fn hot_loop_process() -> Arc<Process> {
    let mem = Arc::new(AddressSpace::new());
    mem.map_fixed(CODE, 0x1000, Prot::RX, Backing::Anonymous, false)
        .unwrap();
    mem.write_initial(CODE, &[0x48, 0x01, 0xd8, 0x48, 0xff, 0xc9, 0x75, 0xf8])
        .unwrap();
    Process::new(1, VmConfig::default(), mem, Arc::new(no_syscalls)).unwrap()
}

fn bench_dispatch(c: &mut Criterion) {
    let process = hot_loop_process();
    let mut cpu = CpuState::new(CpuMode::Long64);
    cpu.rip = CODE;
    cpu.set_gpr(Gpr::Rcx, u64::MAX);
    cpu.set_gpr(Gpr::Rbx, 3);
    let mut engine = process.spawn_thread(cpu);

    let blocks = 10_000u64;
    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(blocks * 3));
    group.bench_function("hot_loop_blocks", |b| {
        b.iter(|| {
            let exit = engine.run_blocks(black_box(blocks)).is_some();
            black_box(exit);
        });
    });
    group.finish();
    black_box(engine.cpu().gpr(Gpr::Rax));
}

fn bench_cache_hit(c: &mut Criterion) {
    let process = hot_loop_process();
    let cache = process.cache().clone();
    cache.lookup_or_build(CODE, DecodeMode::Bits64).unwrap();

    c.bench_function("translation_cache_hit", |b| {
        b.iter(|| {
            let block = cache
                .lookup_or_build(black_box(CODE), DecodeMode::Bits64)
                .unwrap();
            black_box(block.guest_insts);
        });
    });
}

criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_dispatch, bench_cache_hit
}
criterion_main!(benches);
