//! Signal dispositions and the guest signal frame.
//!
//! Only synchronous signals raised by traps are delivered. The frame pushed for a handler is:
//!
//! ```text
//! F + 0     return address (the registered restorer)
//! F + 8     siginfo, 128 bytes: si_signo @0, si_errno @4, si_code @8, si_addr @16
//! F + 136   saved context: rax..r15 (16 x 8), rip, rflags, blocked mask
//! ```
//!
//! `F` sits below the 128-byte red zone and is chosen so that `F + 8` is 16-byte aligned, the
//! same stack alignment a function sees right after `call`. The handler runs with
//! `rdi = signo`, `rsi = F + 8` and `rdx = F + 136`. Returning through the restorer issues
//! `rt_sigreturn` with `rsp = F + 8`, which is where [`restore_frame`] finds the context.

use crate::state::{CpuState, PendingSignal};
use std::sync::{PoisonError, RwLock};
use vmx86_mem::{AddressSpace, MemoryFault};
use vmx86_types::{Flag, Gpr};

pub const SIGILL: u32 = 4;
pub const SIGTRAP: u32 = 5;
pub const SIGFPE: u32 = 8;
pub const SIGKILL: u32 = 9;
pub const SIGSEGV: u32 = 11;
pub const SIGSTOP: u32 = 19;
pub const NSIG: u32 = 64;

pub const SI_KERNEL: i32 = 0x80;
pub const ILL_ILLOPC: i32 = 1;
pub const ILL_ILLOPN: i32 = 2;
pub const FPE_INTDIV: i32 = 1;
pub const SEGV_MAPERR: i32 = 1;
pub const SEGV_ACCERR: i32 = 2;

pub const SIG_DFL: u64 = 0;
pub const SIG_IGN: u64 = 1;

pub const SA_SIGINFO: u64 = 0x0000_0004;
pub const SA_RESTORER: u64 = 0x0400_0000;
pub const SA_NODEFER: u64 = 0x4000_0000;
pub const SA_RESETHAND: u64 = 0x8000_0000;

const RED_ZONE: u64 = 128;
const SIGINFO_SIZE: u64 = 128;
const CONTEXT_SIZE: u64 = 16 * 8 + 3 * 8;
const FRAME_SIZE: u64 = 8 + SIGINFO_SIZE + CONTEXT_SIZE;

/// The `struct sigaction` fields the emulator honors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigAction {
    pub handler: u64,
    pub flags: u64,
    pub restorer: u64,
    pub mask: u64,
}

impl SigAction {
    pub fn is_default(&self) -> bool {
        self.handler == SIG_DFL
    }
}

#[inline]
pub fn sig_bit(signo: u32) -> u64 {
    1u64 << (signo - 1)
}

/// Process-wide signal dispositions.
#[derive(Debug)]
pub struct SignalTable {
    actions: RwLock<[SigAction; NSIG as usize]>,
}

impl Default for SignalTable {
    fn default() -> Self {
        Self {
            actions: RwLock::new([SigAction::default(); NSIG as usize]),
        }
    }
}

impl SignalTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(signo: u32) -> bool {
        (1..=NSIG).contains(&signo)
    }

    pub fn get(&self, signo: u32) -> Option<SigAction> {
        if !Self::is_valid(signo) {
            return None;
        }
        let actions = self.actions.read().unwrap_or_else(PoisonError::into_inner);
        Some(actions[signo as usize - 1])
    }

    /// Install `action`, returning the previous one. `None` for an out-of-range signal or one
    /// whose disposition cannot change.
    pub fn set(&self, signo: u32, action: SigAction) -> Option<SigAction> {
        if !Self::is_valid(signo) || signo == SIGKILL || signo == SIGSTOP {
            return None;
        }
        let mut actions = self.actions.write().unwrap_or_else(PoisonError::into_inner);
        Some(std::mem::replace(&mut actions[signo as usize - 1], action))
    }
}

/// Why a signal could not be handed to a guest handler. The thread dies of the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("signal {0} has no handler")]
    NoHandler(u32),
    #[error("signal {0} raised again while blocked")]
    Blocked(u32),
    #[error("signal frame for {signo} could not be written: {fault}")]
    Frame { signo: u32, fault: MemoryFault },
}

impl DeliveryError {
    pub fn signo(&self) -> u32 {
        match *self {
            DeliveryError::NoHandler(s) | DeliveryError::Blocked(s) => s,
            // The kernel kills with SIGSEGV when it cannot build a frame.
            DeliveryError::Frame { .. } => SIGSEGV,
        }
    }
}

/// Divert `cpu` into the handler registered for `sig`.
///
/// Synchronous signals cannot be ignored: `SIG_IGN`, `SIG_DFL` and a blocked signal all kill
/// the thread.
pub fn deliver(
    cpu: &mut CpuState,
    mem: &AddressSpace,
    table: &SignalTable,
    sig: PendingSignal,
) -> Result<(), DeliveryError> {
    let signo = sig.signo;
    let action = match table.get(signo) {
        Some(a) if a.handler != SIG_DFL && a.handler != SIG_IGN => a,
        _ => return Err(DeliveryError::NoHandler(signo)),
    };
    if cpu.signal_mask & sig_bit(signo) != 0 {
        return Err(DeliveryError::Blocked(signo));
    }

    let sp = cpu.gpr(Gpr::Rsp).wrapping_sub(RED_ZONE);
    let frame = ((sp.wrapping_sub(FRAME_SIZE)) & !0xf).wrapping_sub(8);
    let info = frame + 8;
    let context = info + SIGINFO_SIZE;

    let mut bytes = Vec::with_capacity(FRAME_SIZE as usize);
    bytes.extend_from_slice(&action.restorer.to_le_bytes());
    let mut siginfo = [0u8; SIGINFO_SIZE as usize];
    siginfo[0..4].copy_from_slice(&(signo as i32).to_le_bytes());
    siginfo[8..12].copy_from_slice(&sig.code.to_le_bytes());
    siginfo[16..24].copy_from_slice(&sig.addr.to_le_bytes());
    bytes.extend_from_slice(&siginfo);
    for v in cpu.gpr {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes.extend_from_slice(&cpu.rip.to_le_bytes());
    bytes.extend_from_slice(&cpu.rflags().to_le_bytes());
    bytes.extend_from_slice(&cpu.signal_mask.to_le_bytes());
    mem.write(frame, &bytes)
        .map_err(|fault| DeliveryError::Frame { signo, fault })?;

    cpu.set_gpr(Gpr::Rsp, frame);
    cpu.set_gpr(Gpr::Rdi, u64::from(signo));
    cpu.set_gpr(Gpr::Rsi, info);
    cpu.set_gpr(Gpr::Rdx, context);
    cpu.set_gpr(Gpr::Rax, 0);
    cpu.set_flag(Flag::Df, false);
    cpu.set_rip(action.handler);
    cpu.signal_mask |= action.mask;
    if action.flags & SA_NODEFER == 0 {
        cpu.signal_mask |= sig_bit(signo);
    }
    cpu.pending_signal = None;
    if action.flags & SA_RESETHAND != 0 {
        table.set(signo, SigAction::default());
    }
    tracing::debug!(signo, handler = action.handler, frame, "delivered signal");
    Ok(())
}

/// `rt_sigreturn`: reload the context saved by [`deliver`]. Expects `rsp` to point at the
/// siginfo, as it does after the handler returned into the restorer.
pub fn restore_frame(cpu: &mut CpuState, mem: &AddressSpace) -> Result<(), MemoryFault> {
    let context = cpu.gpr(Gpr::Rsp).wrapping_add(SIGINFO_SIZE);
    let raw = mem.read(context, CONTEXT_SIZE as usize)?;
    let word = |i: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&raw[i * 8..i * 8 + 8]);
        u64::from_le_bytes(b)
    };
    for (i, reg) in cpu.gpr.iter_mut().enumerate() {
        *reg = word(i);
    }
    cpu.set_rip(word(16));
    cpu.set_rflags(word(17));
    cpu.signal_mask = word(18);
    Ok(())
}
