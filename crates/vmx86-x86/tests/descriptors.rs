use vmx86_types::{Cond, FlagSet, Gpr, Width};
use vmx86_x86::{
    decode, AluOp, DecodeError, DecodeMode, InstKind, Operand, Reg, ShiftCount, ShiftOp,
    StringOp, TrapInst,
};

fn d64(rip: u64, bytes: &[u8]) -> vmx86_x86::DecodedInst {
    decode(DecodeMode::Bits64, rip, bytes).expect("decode")
}

#[test]
fn mov_reg_imm() {
    // mov eax, 0x2a
    let inst = d64(0x1000, &[0xB8, 0x2A, 0x00, 0x00, 0x00]);
    assert_eq!(inst.len, 5);
    assert_eq!(inst.next_rip(), 0x1005);
    assert_eq!(
        inst.kind,
        InstKind::Mov {
            dst: Operand::Reg(Reg::new(Gpr::Rax, Width::W32)),
            src: Operand::Imm(0x2a),
            width: Width::W32,
        }
    );
    assert!(!inst.is_block_terminator());
}

#[test]
fn alu_with_sign_extended_imm8() {
    // add rsp, -8  (48 83 C4 F8)
    let inst = d64(0, &[0x48, 0x83, 0xC4, 0xF8]);
    match inst.kind {
        InstKind::Alu {
            op: AluOp::Add,
            dst: Operand::Reg(r),
            src: Operand::Imm(v),
            width: Width::W64,
        } => {
            assert_eq!(r.gpr, Gpr::Rsp);
            assert_eq!(v, (-8i64) as u64);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(inst.flags_effect().writes, FlagSet::STATUS);
}

#[test]
fn rip_relative_operand_is_absolute() {
    // mov rax, [rip+0x10] at 0x2000, 7 bytes long => 0x2017
    let inst = d64(0x2000, &[0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00]);
    match inst.kind {
        InstKind::Mov {
            src: Operand::Mem(addr),
            ..
        } => {
            assert!(addr.rip_relative);
            assert_eq!(addr.disp, 0x2017);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn fs_segment_override_is_kept() {
    // mov rax, fs:[0x28]
    let inst = d64(0, &[0x64, 0x48, 0x8B, 0x04, 0x25, 0x28, 0x00, 0x00, 0x00]);
    assert_eq!(inst.to_string(), "mov rax, fs:[0x28]");
}

#[test]
fn branches_terminate_blocks() {
    // jne -5 at 0x10 => target 0x10 + 2 - 5 = 0xd
    let inst = d64(0x10, &[0x75, 0xFB]);
    assert_eq!(
        inst.kind,
        InstKind::Jcc {
            cond: Cond::Ne,
            target: 0xd
        }
    );
    assert!(inst.is_block_terminator());
    assert_eq!(inst.flags_effect().reads, FlagSet::ZF);

    // call rel32 0
    let call = d64(0x100, &[0xE8, 0, 0, 0, 0]);
    assert_eq!(call.kind, InstKind::Call { target: 0x105 });

    // ret 0x10
    let ret = d64(0, &[0xC2, 0x10, 0x00]);
    assert_eq!(ret.kind, InstKind::Ret { pop: 0x10 });

    // jmp rax
    let jmp = d64(0, &[0xFF, 0xE0]);
    assert!(matches!(jmp.kind, InstKind::JmpIndirect { .. }));

    let syscall = d64(0, &[0x0F, 0x05]);
    assert_eq!(syscall.kind, InstKind::Syscall);
    assert!(syscall.is_block_terminator());
}

#[test]
fn shift_forms() {
    // shl rax, 1 (D1 E0)
    let inst = d64(0, &[0x48, 0xD1, 0xE0]);
    assert!(matches!(
        inst.kind,
        InstKind::Shift {
            op: ShiftOp::Shl,
            count: ShiftCount::Imm(1),
            width: Width::W64,
            ..
        }
    ));
    // ror ecx, cl (D3 C9)
    let inst = d64(0, &[0xD3, 0xC9]);
    assert!(matches!(
        inst.kind,
        InstKind::Shift {
            op: ShiftOp::Ror,
            count: ShiftCount::Cl,
            ..
        }
    ));
    assert_eq!(inst.flags_effect().writes, FlagSet::CF | FlagSet::OF);
}

#[test]
fn imul_arities() {
    // imul rcx (48 F7 E9)
    assert!(matches!(
        d64(0, &[0x48, 0xF7, 0xE9]).kind,
        InstKind::MulWide { signed: true, .. }
    ));
    // imul eax, ecx (0F AF C1)
    assert!(matches!(
        d64(0, &[0x0F, 0xAF, 0xC1]).kind,
        InstKind::Imul { imm: None, .. }
    ));
    // imul eax, ecx, 10 (6B C1 0A)
    assert!(matches!(
        d64(0, &[0x6B, 0xC1, 0x0A]).kind,
        InstKind::Imul { imm: Some(10), .. }
    ));
}

#[test]
fn rep_string_ops() {
    // rep movsb
    let inst = d64(0, &[0xF3, 0xA4]);
    assert!(inst.rep);
    assert_eq!(
        inst.kind,
        InstKind::String {
            op: StringOp::Movs,
            width: Width::W8
        }
    );
    assert_eq!(inst.flags_effect().reads, FlagSet::DF);

    // stosq without rep
    let inst = d64(0, &[0x48, 0xAB]);
    assert!(!inst.rep);
    assert_eq!(
        inst.kind,
        InstKind::String {
            op: StringOp::Stos,
            width: Width::W64
        }
    );
}

#[test]
fn lock_prefix_is_recorded() {
    // lock xadd [rdi], eax
    let inst = d64(0, &[0xF0, 0x0F, 0xC1, 0x07]);
    assert!(inst.lock);
    assert!(matches!(inst.kind, InstKind::Xadd { .. }));
    assert_eq!(inst.to_string(), "lock xadd [rdi], eax");
}

#[test]
fn trap_instructions() {
    assert_eq!(d64(0, &[0xCC]).kind, InstKind::Trap(TrapInst::Breakpoint));
    assert_eq!(d64(0, &[0x0F, 0x0B]).kind, InstKind::Trap(TrapInst::Undefined));
    assert_eq!(d64(0, &[0xF4]).kind, InstKind::Trap(TrapInst::Privileged));
    assert!(d64(0, &[0xF4]).is_block_terminator());
}

#[test]
fn nops_and_endbr() {
    assert_eq!(d64(0, &[0x90]).kind, InstKind::Nop);
    assert_eq!(d64(0, &[0xF3, 0x0F, 0x1E, 0xFA]).kind, InstKind::Nop);
    // nop dword ptr [rax+rax*1+0x0]
    assert_eq!(d64(0, &[0x0F, 0x1F, 0x44, 0x00, 0x00]).kind, InstKind::Nop);
}

#[test]
fn unimplemented_instructions_are_unsupported_not_invalid() {
    // addps xmm0, xmm1
    let inst = d64(0, &[0x0F, 0x58, 0xC1]);
    assert!(!inst.is_supported());
    assert!(matches!(inst.kind, InstKind::Unsupported(_)));
}

#[test]
fn invalid_bytes_fail_with_location() {
    let err = decode(DecodeMode::Bits64, 0x4000, &[0x0F, 0xFF]).unwrap_err();
    assert_eq!(err.rip, 0x4000);
    assert_ne!(err.kind, DecodeError::EmptyInput);
}

#[test]
fn compat_mode_push_is_32_bit() {
    // push ebp in 32-bit mode
    let inst = decode(DecodeMode::Bits32, 0, &[0x55]).unwrap();
    assert_eq!(
        inst.kind,
        InstKind::Push {
            src: Operand::Reg(Reg::new(Gpr::Rbp, Width::W32)),
            width: Width::W32
        }
    );
}
