use serde::{Deserialize, Serialize};
use vmx86_types::{Flag, Gpr, Width, RFLAGS_DF, RFLAGS_RESERVED1, RFLAGS_STATUS_MASK};
use vmx86_x86::DecodeMode;

/// Bits of `RFLAGS` a user-mode guest can change.
pub const RFLAGS_USER_MASK: u64 = RFLAGS_STATUS_MASK | RFLAGS_DF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CpuMode {
    /// 64-bit code segment.
    Long64,
    /// 32-bit code segment under a 64-bit kernel.
    Compat32,
}

impl CpuMode {
    pub fn decode_mode(self) -> DecodeMode {
        match self {
            CpuMode::Long64 => DecodeMode::Bits64,
            CpuMode::Compat32 => DecodeMode::Bits32,
        }
    }

    pub fn stack_width(self) -> Width {
        match self {
            CpuMode::Long64 => Width::W64,
            CpuMode::Compat32 => Width::W32,
        }
    }

    pub fn ip_mask(self) -> u64 {
        self.stack_width().mask()
    }
}

/// A signal raised by a trap that has not been delivered yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSignal {
    pub signo: u32,
    pub code: i32,
    /// Faulting address reported in `si_addr`.
    pub addr: u64,
}

/// Architectural state of one guest thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuState {
    pub gpr: [u64; 16],
    pub rip: u64,
    rflags: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub mode: CpuMode,
    /// Guest instructions retired so far; also what `rdtsc` reports.
    pub retired: u64,
    pub pending_signal: Option<PendingSignal>,
    /// Blocked signals, bit `signo - 1`.
    pub signal_mask: u64,
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new(CpuMode::Long64)
    }
}

impl CpuState {
    pub fn new(mode: CpuMode) -> Self {
        Self {
            gpr: [0; 16],
            rip: 0,
            rflags: RFLAGS_RESERVED1,
            fs_base: 0,
            gs_base: 0,
            mode,
            retired: 0,
            pending_signal: None,
            signal_mask: 0,
        }
    }

    #[inline]
    pub fn gpr(&self, reg: Gpr) -> u64 {
        self.gpr[reg.index()]
    }

    #[inline]
    pub fn set_gpr(&mut self, reg: Gpr, value: u64) {
        self.gpr[reg.index()] = value;
    }

    /// Read a sub-register, zero-extended.
    pub fn read_gpr(&self, reg: Gpr, width: Width, high8: bool) -> u64 {
        let full = self.gpr[reg.index()];
        if high8 {
            (full >> 8) & 0xff
        } else {
            width.truncate(full)
        }
    }

    /// Write a sub-register. 32-bit writes clear bits 63:32; 8- and 16-bit writes merge.
    pub fn write_gpr(&mut self, reg: Gpr, width: Width, high8: bool, value: u64) {
        let cur = self.gpr[reg.index()];
        self.gpr[reg.index()] = match (width, high8) {
            (_, true) => (cur & !0xff00) | ((value & 0xff) << 8),
            (Width::W64, _) => value,
            (Width::W32, _) => value & 0xffff_ffff,
            (Width::W16, _) => (cur & !0xffff) | (value & 0xffff),
            (Width::W8, _) => (cur & !0xff) | (value & 0xff),
        };
    }

    #[inline]
    pub fn rflags(&self) -> u64 {
        self.rflags
    }

    /// Replace the user-visible flags; everything else keeps its fixed value.
    pub fn set_rflags(&mut self, flags: u64) {
        self.rflags = (flags & RFLAGS_USER_MASK) | RFLAGS_RESERVED1;
    }

    #[inline]
    pub fn flag(&self, flag: Flag) -> bool {
        self.rflags & flag.rflags_bit() != 0
    }

    pub fn set_flag(&mut self, flag: Flag, value: bool) {
        if value {
            self.rflags |= flag.rflags_bit();
        } else {
            self.rflags &= !flag.rflags_bit();
        }
    }

    pub fn stack_ptr(&self) -> u64 {
        self.read_gpr(Gpr::Rsp, self.mode.stack_width(), false)
    }

    pub fn set_stack_ptr(&mut self, value: u64) {
        self.write_gpr(Gpr::Rsp, self.mode.stack_width(), false, value);
    }

    pub fn set_rip(&mut self, rip: u64) {
        self.rip = rip & self.mode.ip_mask();
    }
}
