mod common;

use common::{address_space, engine, initial_cpu, process, traced_process, CODE};
use std::sync::Arc;
use std::thread;
use vmx86_cpu_core::signal::{SA_RESTORER, SA_SIGINFO, SIGILL, SIGSEGV, SIGTRAP};
use vmx86_cpu_core::{
    EngineState, ExitReason, MemoryTraceSink, RegDelta, SigAction, TraceEvent, VmConfig,
};
use vmx86_jit::TranslateError;
use vmx86_types::Gpr;

/// `mov edi, eax; mov eax, 60; syscall`: exit with the low half of RAX.
const EXIT_WITH_EAX: [u8; 9] = [0x89, 0xc7, 0xb8, 0x3c, 0, 0, 0, 0x0f, 0x05];

fn exit_with(code: u8) -> Vec<u8> {
    vec![0xbf, code, 0, 0, 0, 0xb8, 0x3c, 0, 0, 0, 0x0f, 0x05]
}

#[test]
fn mov_ret_reaches_the_return_address() {
    // mov eax, 42; ret
    let mut engine = engine(&[0xb8, 0x2a, 0, 0, 0, 0xc3]);
    let mem = engine.process().mem().clone();
    mem.write(CODE + 0x100, &EXIT_WITH_EAX).unwrap();
    let rsp = engine.cpu().gpr(Gpr::Rsp) - 8;
    mem.write_u64(rsp, CODE + 0x100).unwrap();
    engine.cpu_mut().set_gpr(Gpr::Rsp, rsp);

    assert_eq!(engine.run(), ExitReason::Exited(42));
    assert_eq!(engine.cpu().gpr(Gpr::Rsp), rsp + 8);
    assert_eq!(engine.cpu().rip, CODE + 0x100 + EXIT_WITH_EAX.len() as u64);
    // Each guest instruction retired once.
    assert_eq!(engine.cpu().retired, 5);
}

#[test]
fn pop_into_the_stack_top_writes_above_the_popped_slot() {
    // push 0x11; push 0x22; pop qword [rsp]; pop rax; <exit with eax>
    let mut code = vec![0x6a, 0x11, 0x6a, 0x22, 0x8f, 0x04, 0x24, 0x58];
    code.extend_from_slice(&EXIT_WITH_EAX);
    let mut engine = engine(&code);
    let rsp = engine.cpu().gpr(Gpr::Rsp);
    assert_eq!(engine.run(), ExitReason::Exited(0x22));
    assert_eq!(engine.cpu().gpr(Gpr::Rsp), rsp);
}

#[test]
fn syscall_errors_become_negative_errno() {
    // mov eax, 999; syscall; <exit with eax>
    let mut code = vec![0xb8, 0xe7, 0x03, 0, 0, 0x0f, 0x05];
    code.extend_from_slice(&EXIT_WITH_EAX);
    let mut engine = engine(&code);
    assert_eq!(engine.run(), ExitReason::Exited(-38));
    // `syscall` loaded RCX with the return address and R11 with the flags.
    assert_eq!(engine.cpu().gpr(Gpr::Rcx), CODE + code.len() as u64);
}

#[test]
fn step_walks_the_state_machine() {
    let mut engine = engine(&[0x90, 0xeb, 0xfe]); // nop; jmp $
    assert!(matches!(engine.state(), EngineState::Fetch));
    assert!(matches!(engine.step(), EngineState::Execute(_)));
    assert!(matches!(
        engine.step(),
        EngineState::Transfer {
            next_rip,
            syscall: false
        } if *next_rip == CODE + 1
    ));
    assert!(matches!(engine.step(), EngineState::Fetch));
    assert_eq!(engine.cpu().rip, CODE + 1);

    assert_eq!(engine.run_blocks(10), None);
    assert_eq!(engine.blocks_executed(), 11);
    assert_eq!(engine.cpu().rip, CODE + 1);
}

#[test]
fn unhandled_faults_kill_the_thread() {
    // jmp rax into unmapped memory.
    let mut e = engine(&[0xff, 0xe0]);
    e.cpu_mut().set_gpr(Gpr::Rax, 0x9000_0000);
    assert_eq!(e.run(), ExitReason::Signaled(SIGSEGV));
    assert_eq!(e.cpu().rip, 0x9000_0000);
    assert_eq!(e.cpu().pending_signal.map(|s| s.addr), Some(0x9000_0000));

    // Invalid opcode in 64-bit mode.
    assert_eq!(engine(&[0x06]).run(), ExitReason::Signaled(SIGILL));
    // ud2 and int3.
    assert_eq!(engine(&[0x0f, 0x0b]).run(), ExitReason::Signaled(SIGILL));
    assert_eq!(engine(&[0xcc]).run(), ExitReason::Signaled(SIGTRAP));
    // hlt is privileged.
    assert_eq!(engine(&[0xf4]).run(), ExitReason::Signaled(SIGSEGV));
}

#[test]
fn unsupported_instruction_is_fatal() {
    // nop; fld1
    let mut e = engine(&[0x90, 0xd9, 0xe8]);
    let first = e.run();
    // The nop runs as its own block; the fld1 block cannot be built.
    assert!(matches!(
        first,
        ExitReason::Fatal(TranslateError::Unsupported { rip, .. }) if rip == CODE + 1
    ));
    assert_eq!(e.cpu().rip, CODE + 1);
}

fn with_segv_handler(code: &[u8], handler: &[u8]) -> vmx86_cpu_core::Engine {
    let e = engine(code);
    let mem = e.process().mem();
    mem.write(CODE + 0x200, handler).unwrap();
    e.process().signals().set(
        SIGSEGV,
        SigAction {
            handler: CODE + 0x200,
            flags: SA_SIGINFO | SA_RESTORER,
            restorer: CODE + 0x300,
            mask: 0,
        },
    );
    e
}

/// `mov rax, [0x10]`
const LOAD_NULL_PAGE: [u8; 8] = [0x48, 0x8b, 0x04, 0x25, 0x10, 0, 0, 0];

#[test]
fn faults_are_delivered_to_the_registered_handler() {
    // mov r12, rdi; mov r13, rsi; <exit 7>
    let mut handler = vec![0x49, 0x89, 0xfc, 0x49, 0x89, 0xf5];
    handler.extend(exit_with(7));
    let mut e = with_segv_handler(&LOAD_NULL_PAGE, &handler);
    e.cpu_mut().set_gpr(Gpr::Rax, 0x5555);

    assert_eq!(e.run(), ExitReason::Exited(7));
    let cpu = e.cpu();
    assert_eq!(cpu.gpr(Gpr::R12), u64::from(SIGSEGV));
    let info = cpu.gpr(Gpr::R13);
    let mem = e.process().mem();
    assert_eq!(mem.read_u32(info).unwrap(), SIGSEGV);
    assert_eq!(mem.read_u64(info + 16).unwrap(), 0x10);
    // The frame's return address is the restorer.
    assert_eq!(mem.read_u64(info - 8).unwrap(), CODE + 0x300);
    // The faulting load had no effect.
    assert_eq!(mem.read_u64(info + 128).unwrap(), 0x5555);
    assert_eq!(cpu.pending_signal, None);
}

#[test]
fn fault_inside_its_own_handler_is_fatal() {
    let mut e = with_segv_handler(&LOAD_NULL_PAGE, &LOAD_NULL_PAGE);
    assert_eq!(e.run(), ExitReason::Signaled(SIGSEGV));
    assert_eq!(e.cpu().rip, CODE + 0x200);
}

#[test]
fn self_modifying_code_is_retranslated() {
    // mov eax, 1; ret
    let mut e = engine(&[0xb8, 1, 0, 0, 0, 0xc3]);
    let process = e.process().clone();
    let mem = process.mem().clone();
    mem.write(CODE + 0x100, &EXIT_WITH_EAX).unwrap();
    let rsp = e.cpu().gpr(Gpr::Rsp) - 8;
    mem.write_u64(rsp, CODE + 0x100).unwrap();
    e.cpu_mut().set_gpr(Gpr::Rsp, rsp);
    assert_eq!(e.run(), ExitReason::Exited(1));
    drop(e);
    assert!(process.cache().contains(CODE));

    // Patch the immediate and run the same entry again on a new thread.
    mem.write_u8(CODE + 1, 2).unwrap();
    assert!(!process.cache().contains(CODE));
    let mut cpu = initial_cpu(CODE);
    cpu.set_gpr(Gpr::Rsp, rsp);
    let mut e = process.spawn_thread(cpu);
    assert_eq!(e.run(), ExitReason::Exited(2));
    assert_eq!(process.cache().stats().invalidations, 1);
}

#[test]
fn guest_store_into_its_own_next_block() {
    // 0: mov byte [CODE+0x11], 9   (the imm8 of the mov below)
    // 8: jmp 0x10
    // 0x10: mov edi, 5 -> becomes mov edi, 9
    let target = (CODE + 0x11) as u32;
    let mut code = vec![0xc6, 0x04, 0x25];
    code.extend_from_slice(&target.to_le_bytes());
    code.push(9);
    code.extend_from_slice(&[0xeb, 0x06]);
    code.resize(0x10, 0x90);
    code.extend_from_slice(&[0xbf, 5, 0, 0, 0, 0xb8, 0x3c, 0, 0, 0, 0x0f, 0x05]);

    let mem = address_space(&code);
    let process = process(mem, VmConfig::default());
    // Warm the cache with the unmodified target block first.
    process
        .cache()
        .lookup_or_build(CODE + 0x10, vmx86_x86::DecodeMode::Bits64)
        .unwrap();
    let mut e = process.spawn_thread(initial_cpu(CODE));
    assert_eq!(e.run(), ExitReason::Exited(9));
    assert!(process.cache().stats().invalidations >= 1);
}

#[test]
fn exit_group_stops_every_thread() {
    let mut code = vec![0xeb, 0xfe]; // spin: jmp $
    code.resize(0x40, 0x90);
    code.extend_from_slice(&[0xbf, 3, 0, 0, 0, 0xb8, 0xe7, 0, 0, 0, 0x0f, 0x05]);
    let process = process(address_space(&code), VmConfig::default());

    let spinner = process.spawn_thread(initial_cpu(CODE));
    let spinner_tid = spinner.tid();
    let handle = thread::spawn(move || {
        let mut spinner = spinner;
        spinner.run()
    });
    let mut exiter = process.spawn_thread(initial_cpu(CODE + 0x40));
    assert_eq!(process.thread_count(), 2);
    assert_eq!(exiter.run(), ExitReason::ExitGroup(3));
    assert_eq!(handle.join().unwrap(), ExitReason::ExitGroup(3));
    assert_eq!(process.exit_code(), Some(3));

    // The spinner's engine was dropped with its host thread.
    assert_eq!(process.thread_ids(), vec![exiter.tid()]);
    assert_ne!(spinner_tid, exiter.tid());
    drop(exiter);
    assert_eq!(process.thread_count(), 0);
}

#[test]
fn trace_records_blocks_syscalls_and_exit() {
    let sink = Arc::new(MemoryTraceSink::new());
    let config = VmConfig {
        trace_blocks: true,
        ..VmConfig::default()
    };
    let process = traced_process(address_space(&exit_with(4)), config, sink.clone());
    let mut e = process.spawn_thread(initial_cpu(CODE));
    let tid = e.tid();
    assert_eq!(e.run(), ExitReason::Exited(4));

    let events = sink.events();
    assert_eq!(events.len(), 3);
    assert_eq!(
        events[0],
        TraceEvent::Block {
            tid,
            entry: CODE,
            insts: 3,
            next_rip: CODE + 12,
            deltas: vec![
                RegDelta {
                    reg: Gpr::Rax,
                    value: 60
                },
                RegDelta {
                    reg: Gpr::Rdi,
                    value: 4
                },
            ],
        }
    );
    assert_eq!(
        events[1],
        TraceEvent::Syscall {
            tid,
            nr: 60,
            ret: 4
        }
    );
    assert!(matches!(&events[2], TraceEvent::Exit { reason, .. } if reason.contains("code 4")));
}
